//! Thread control blocks
//!
//! All scheduling-relevant state sits behind the per-thread `sched`
//! spinlock; the state word changes only through the typed transition
//! methods so illegal edges trip an assertion instead of corrupting the
//! run queues.

use alloc::string::String;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::arch::{CpuContext, TrapFrame};
use crate::lib::error::{Errno, Result};
use crate::process::group::ThreadGroup;
use crate::process::signal::{SigActs, ThreadSig};
use crate::sync::SpinLock;

pub type Tid = i32;
pub const NO_TID: Tid = -1;

pub const PAGE_SIZE: usize = 4096;
/// Default kernel stack: 4 pages
pub const DEFAULT_STACK_ORDER: usize = 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// A termination signal became pending-and-unmasked
        const KILLED = 1 << 0;
        /// Some signal may be deliverable (fast path; recheck under the
        /// signal lock before acting)
        const SIGPENDING = 1 << 1;
        /// A wakeup arrived before the sleep; the next sleep attempt
        /// returns immediately
        const AWOKEN = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Unused,
    Running,
    Interruptible,
    Uninterruptible,
    Stopped,
    Zombie,
}

/// Outcome of the atomic sleep-entry check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepDecision {
    /// Parked; yield to the scheduler
    Sleep,
    /// A wakeup raced us; do not sleep, report a normal wake
    Awoken,
    /// A signal is pending; do not sleep, report cancellation
    Interrupted,
}

/// Scheduling fields, serialized by the TCB lock
pub struct SchedInfo {
    state: ThreadState,
    /// Home CPU: the run queue this thread goes back to
    pub cpu: usize,
    /// Priority tier, 0 is most urgent
    pub priority: u8,
    /// Linked on a run queue right now
    pub on_rq: bool,
}

impl SchedInfo {
    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn make_running(&mut self) {
        debug_assert!(
            self.state != ThreadState::Zombie && self.state != ThreadState::Unused,
            "resurrecting a dead thread"
        );
        self.state = ThreadState::Running;
    }

    pub fn make_interruptible(&mut self) {
        debug_assert_eq!(self.state, ThreadState::Running);
        self.state = ThreadState::Interruptible;
    }

    pub fn make_uninterruptible(&mut self) {
        debug_assert_eq!(self.state, ThreadState::Running);
        self.state = ThreadState::Uninterruptible;
    }

    pub fn make_stopped(&mut self) {
        debug_assert!(matches!(
            self.state,
            ThreadState::Running | ThreadState::Interruptible
        ));
        self.state = ThreadState::Stopped;
    }

    pub fn make_zombie(&mut self) {
        debug_assert_eq!(self.state, ThreadState::Running);
        self.state = ThreadState::Zombie;
    }

    pub fn make_unused(&mut self) {
        debug_assert_eq!(self.state, ThreadState::Zombie);
        self.state = ThreadState::Unused;
    }
}

pub struct Thread {
    tid: Tid,
    name: String,
    kstack: usize,
    stack_order: usize,

    /// Callee-saved switch context; touched only during context switch
    /// with the run queue discipline in force.
    pub(crate) ctx: UnsafeCell<CpuContext>,
    /// Saved user-mode register state; touched by the owning thread in
    /// trap context.
    pub(crate) trap_frame: UnsafeCell<TrapFrame>,

    flags: AtomicU32,
    pub sched: SpinLock<SchedInfo>,
    pub group: Arc<ThreadGroup>,
    pub sigacts: Arc<SigActs>,
    pub sig: SpinLock<ThreadSig>,
    /// Exit status, valid once the thread is a zombie
    pub exit_code: core::sync::atomic::AtomicI32,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    fn alloc_kstack(order: usize) -> Result<usize> {
        let layout = stack_layout(order);
        let p = unsafe { alloc::alloc::alloc(layout) };
        if p.is_null() {
            return Err(Errno::ENOMEM);
        }
        Ok(p as usize)
    }

    /// Create a kernel thread, ready to be enqueued by its first wakeup.
    pub fn new_kthread(
        name: &str,
        entry: fn(usize, usize),
        arg1: usize,
        arg2: usize,
        stack_order: usize,
        group: Arc<ThreadGroup>,
        sigacts: Arc<SigActs>,
    ) -> Result<Arc<Thread>> {
        let tid = crate::process::tid::alloc_tid()?;
        let kstack = Self::alloc_kstack(stack_order)?;
        let stack_top = kstack + (PAGE_SIZE << stack_order);

        let ctx = CpuContext::new_kthread(
            crate::arch::context::kthread_entry_stub as usize,
            stack_top,
            entry as usize,
            arg1,
            arg2,
        );

        Ok(Arc::new(Thread {
            tid,
            name: String::from(name),
            kstack,
            stack_order,
            ctx: UnsafeCell::new(ctx),
            trap_frame: UnsafeCell::new(TrapFrame::zeroed()),
            flags: AtomicU32::new(0),
            sched: SpinLock::new(
                "tcb",
                SchedInfo {
                    state: ThreadState::Interruptible,
                    cpu: crate::arch::hart_id(),
                    priority: crate::process::scheduler::DEFAULT_PRIORITY,
                    on_rq: false,
                },
            ),
            group,
            sigacts,
            sig: SpinLock::new("thread_sig", ThreadSig::new()),
            exit_code: core::sync::atomic::AtomicI32::new(0),
        }))
    }

    /// Adopt the calling boot context as this hart's idle thread. Its
    /// switch context is filled in the first time it yields.
    pub fn adopt_idle(
        hart: usize,
        group: Arc<ThreadGroup>,
        sigacts: Arc<SigActs>,
    ) -> Result<Arc<Thread>> {
        let tid = crate::process::tid::alloc_tid()?;
        Ok(Arc::new(Thread {
            tid,
            name: alloc::format!("idle/{}", hart),
            kstack: 0,
            stack_order: 0,
            ctx: UnsafeCell::new(CpuContext::new()),
            trap_frame: UnsafeCell::new(TrapFrame::zeroed()),
            flags: AtomicU32::new(0),
            sched: SpinLock::new(
                "tcb",
                SchedInfo {
                    state: ThreadState::Running,
                    cpu: hart,
                    priority: crate::process::scheduler::IDLE_PRIORITY,
                    on_rq: false,
                },
            ),
            group,
            sigacts,
            sig: SpinLock::new("thread_sig", ThreadSig::new()),
            exit_code: core::sync::atomic::AtomicI32::new(0),
        }))
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, f: ThreadFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, f: ThreadFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    pub fn test_flag(&self, f: ThreadFlags) -> bool {
        self.flags().intersects(f)
    }

    pub fn set_killed(&self) {
        self.set_flag(ThreadFlags::KILLED);
    }

    pub fn is_killed(&self) -> bool {
        self.test_flag(ThreadFlags::KILLED)
    }

    /// Consume a pending early wakeup, if one arrived.
    pub fn take_awoken(&self) -> bool {
        let old = self
            .flags
            .fetch_and(!ThreadFlags::AWOKEN.bits(), Ordering::AcqRel);
        old & ThreadFlags::AWOKEN.bits() != 0
    }

    pub fn set_awoken(&self) {
        self.set_flag(ThreadFlags::AWOKEN);
    }

    /// Recompute the SIGPENDING fast-path flag from `deliverable`.
    pub fn update_sigpending(&self, deliverable: bool) {
        if deliverable {
            self.set_flag(ThreadFlags::SIGPENDING);
        } else {
            self.clear_flag(ThreadFlags::SIGPENDING);
        }
    }

    pub fn signal_pending(&self) -> bool {
        self.test_flag(ThreadFlags::SIGPENDING | ThreadFlags::KILLED)
    }

    /// The atomic half of going to sleep: decide, and transition state
    /// under the TCB lock. Runs while the bound queue's lock is held so a
    /// concurrent waker either sees the queued waiter or targets a thread
    /// that is still `Running` (and then sets AWOKEN).
    pub fn prepare_sleep(&self, kind: crate::sync::SleepKind) -> SleepDecision {
        let mut s = self.sched.lock();
        if self.take_awoken() {
            return SleepDecision::Awoken;
        }
        if kind == crate::sync::SleepKind::Interruptible && self.signal_pending() {
            return SleepDecision::Interrupted;
        }
        match kind {
            crate::sync::SleepKind::Interruptible => s.make_interruptible(),
            crate::sync::SleepKind::Uninterruptible => s.make_uninterruptible(),
        }
        SleepDecision::Sleep
    }

    pub fn state(&self) -> ThreadState {
        self.sched.lock().state()
    }

    pub(crate) fn ctx_ptr(&self) -> *mut CpuContext {
        self.ctx.get()
    }

    /// The thread's saved trap frame. Caller must be the thread itself in
    /// trap context, or hold it stopped.
    pub unsafe fn trap_frame_ptr(&self) -> *mut TrapFrame {
        self.trap_frame.get()
    }
}

fn stack_layout(order: usize) -> core::alloc::Layout {
    core::alloc::Layout::from_size_align(PAGE_SIZE << order, 16).expect("stack layout")
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.kstack != 0 {
            unsafe {
                alloc::alloc::dealloc(self.kstack as *mut u8, stack_layout(self.stack_order));
            }
        }
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched(state: ThreadState) -> SchedInfo {
        SchedInfo {
            state,
            cpu: 0,
            priority: 2,
            on_rq: false,
        }
    }

    #[test]
    fn test_legal_state_edges() {
        let mut s = sched(ThreadState::Running);
        s.make_interruptible();
        assert_eq!(s.state(), ThreadState::Interruptible);
        s.make_running();
        s.make_uninterruptible();
        s.make_running();
        s.make_stopped();
        assert_eq!(s.state(), ThreadState::Stopped);
        s.make_running();
        s.make_zombie();
        s.make_unused();
        assert_eq!(s.state(), ThreadState::Unused);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn test_zombie_cannot_run_again() {
        let mut s = sched(ThreadState::Zombie);
        s.make_running();
    }

    #[test]
    fn test_awoken_flag_consumed_once() {
        // Flag arithmetic alone; no scheduler involved.
        let flags = AtomicU32::new(ThreadFlags::AWOKEN.bits());
        let old = flags.fetch_and(!ThreadFlags::AWOKEN.bits(), Ordering::AcqRel);
        assert!(old & ThreadFlags::AWOKEN.bits() != 0);
        let old = flags.fetch_and(!ThreadFlags::AWOKEN.bits(), Ordering::AcqRel);
        assert!(old & ThreadFlags::AWOKEN.bits() == 0);
    }
}
