//! Read/write semaphore
//!
//! Many readers or one writer. The `prio_write` policy bit decides who is
//! preferred on wake and whether arriving readers must queue behind
//! waiting writers.

use super::spinlock::SpinLock;
use super::waitqueue::{SleepKind, WaitQueue};
use crate::process::thread::{Tid, NO_TID};

struct RwsemState {
    readers: u32,
    holder_tid: Tid,
    waiting_writers: u32,
    prio_write: bool,
}

pub struct RwSemaphore {
    state: SpinLock<RwsemState>,
    read_wq: WaitQueue,
    write_wq: WaitQueue,
}

impl RwSemaphore {
    pub const fn new(name: &'static str, prio_write: bool) -> Self {
        Self {
            state: SpinLock::new(
                name,
                RwsemState {
                    readers: 0,
                    holder_tid: NO_TID,
                    waiting_writers: 0,
                    prio_write,
                },
            ),
            read_wq: WaitQueue::new(name),
            write_wq: WaitQueue::new(name),
        }
    }

    pub fn acquire_read(&self) {
        let mut g = self.state.lock();
        loop {
            let writer_held = g.holder_tid != NO_TID;
            let writer_queued = g.prio_write && g.waiting_writers > 0;
            if !writer_held && !writer_queued {
                g.readers += 1;
                return;
            }
            let (reacquired, _) = self.read_wq.wait_in_state(g, SleepKind::Uninterruptible);
            g = reacquired;
        }
    }

    pub fn acquire_write(&self) {
        let me = crate::process::current_tid();

        let mut g = self.state.lock();
        if g.holder_tid == me {
            panic!("rwsem {}: write lock already held", self.state.name());
        }
        loop {
            if g.readers == 0 && g.holder_tid == NO_TID {
                g.holder_tid = me;
                return;
            }
            g.waiting_writers += 1;
            let (reacquired, _) = self.write_wq.wait_in_state(g, SleepKind::Uninterruptible);
            g = reacquired;
            g.waiting_writers -= 1;
        }
    }

    pub fn try_acquire_read(&self) -> bool {
        let mut g = self.state.lock();
        if g.holder_tid == NO_TID && !(g.prio_write && g.waiting_writers > 0) {
            g.readers += 1;
            true
        } else {
            false
        }
    }

    pub fn try_acquire_write(&self) -> bool {
        let me = crate::process::current_tid();
        let mut g = self.state.lock();
        if g.readers == 0 && g.holder_tid == NO_TID {
            g.holder_tid = me;
            true
        } else {
            false
        }
    }

    /// Release either side; which one is derived from the caller.
    pub fn release(&self) {
        let me = crate::process::current_tid();
        let wake_writer;
        {
            let mut g = self.state.lock();
            if g.holder_tid == me {
                g.holder_tid = NO_TID;
            } else {
                if g.readers == 0 {
                    panic!("rwsem {}: release without holders", self.state.name());
                }
                g.readers -= 1;
                if g.readers > 0 {
                    return;
                }
            }
            // Pick the wake side per the priority policy before unlocking.
            wake_writer = if g.prio_write {
                g.waiting_writers > 0
            } else {
                self.read_wq.is_empty() && g.waiting_writers > 0
            };
        }

        if wake_writer {
            self.write_wq.wakeup_one(0, 0);
        } else {
            self.read_wq.wakeup_all(0, 0);
        }
    }

    pub fn readers(&self) -> u32 {
        self.state.lock().readers
    }

    pub fn holder(&self) -> Tid {
        self.state.lock().holder_tid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_share() {
        let rw = RwSemaphore::new("test_rw", false);
        rw.acquire_read();
        rw.acquire_read();
        assert_eq!(rw.readers(), 2);
        assert!(!rw.try_acquire_write());
        rw.release();
        rw.release();
        assert_eq!(rw.readers(), 0);
    }

    #[test]
    fn test_writer_excludes() {
        let rw = RwSemaphore::new("test_rw2", false);
        rw.acquire_write();
        assert_eq!(rw.holder(), crate::process::current_tid());
        assert!(!rw.try_acquire_read());
        assert!(!rw.try_acquire_write());
        rw.release();
        assert_eq!(rw.holder(), NO_TID);
        assert!(rw.try_acquire_read());
        rw.release();
    }

    #[test]
    #[should_panic(expected = "write lock already held")]
    fn test_double_write_acquire_panics() {
        let rw = RwSemaphore::new("test_rw3", false);
        rw.acquire_write();
        rw.acquire_write();
    }
}
