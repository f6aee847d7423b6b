// Synchronization primitives

pub mod completion;
pub mod mutex;
pub mod rwsem;
pub mod spinlock;
pub mod waitqueue;

pub use completion::Completion;
pub use mutex::{Mutex, MutexGuard};
pub use rwsem::RwSemaphore;
pub use spinlock::{SpinGuard, SpinLock};
pub use waitqueue::{SleepKind, WaitQueue, WaitTree};
