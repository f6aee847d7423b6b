//! Completions
//!
//! A counted rendezvous: producers hand "done" units to waiters. A
//! broadcast (`complete_all`) saturates the counter at the sticky `ALL`
//! sentinel and releases every current waiter at once.

use super::spinlock::SpinLock;
use super::waitqueue::{SleepKind, WaitQueue};

/// Sticky sentinel: once `done` reaches this, waits never block again.
pub const ALL: u32 = u32::MAX;

pub struct Completion {
    done: SpinLock<u32>,
    wq: WaitQueue,
}

impl Completion {
    pub const fn new(name: &'static str) -> Self {
        Self {
            done: SpinLock::new(name, 0),
            wq: WaitQueue::new(name),
        }
    }

    /// Post one unit and release one waiter.
    pub fn complete(&self) {
        {
            let mut done = self.done.lock();
            *done = done.saturating_add(1);
        }
        self.wq.wakeup_one(0, 0);
    }

    /// Make the completion permanently done and release every waiter.
    ///
    /// Waiters are bulk-moved onto a private queue first so the wakeups
    /// run without the completion lock (no lock convoy on the way out).
    pub fn complete_all(&self) {
        let drained = WaitQueue::new("completion_drain");
        {
            let mut done = self.done.lock();
            *done = ALL;
            drained
                .bulk_move(&self.wq)
                .expect("drain queue starts empty");
        }
        drained.wakeup_all(0, 0);
    }

    /// Sleep until a unit is available, then consume it (unless the
    /// completion is sticky-done).
    pub fn wait_for_completion(&self) {
        let mut done = self.done.lock();
        while *done == 0 {
            let (reacquired, _) = self.wq.wait_in_state(done, SleepKind::Uninterruptible);
            done = reacquired;
        }
        if *done != ALL {
            *done -= 1;
        }
    }

    /// Non-blocking variant: consume a unit if one is available.
    pub fn try_wait_for_completion(&self) -> bool {
        let mut done = self.done.lock();
        if *done == 0 {
            return false;
        }
        if *done != ALL {
            *done -= 1;
        }
        true
    }

    /// Current counter value (`ALL` once broadcast).
    pub fn done(&self) -> u32 {
        *self.done.lock()
    }

    /// Waiters currently parked; empty after a broadcast.
    pub fn waiters(&self) -> usize {
        self.wq.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_wait_counts_down() {
        let c = Completion::new("test_c");
        assert!(!c.try_wait_for_completion());
        c.complete();
        c.complete();
        assert_eq!(c.done(), 2);
        assert!(c.try_wait_for_completion());
        assert!(c.try_wait_for_completion());
        assert!(!c.try_wait_for_completion());
    }

    #[test]
    fn test_complete_all_is_sticky() {
        let c = Completion::new("test_call");
        c.complete_all();
        assert_eq!(c.done(), ALL);
        // Sticky: consuming does not drain it.
        assert!(c.try_wait_for_completion());
        assert!(c.try_wait_for_completion());
        assert_eq!(c.done(), ALL);
        // Further completes leave the sentinel in place.
        c.complete();
        assert_eq!(c.done(), ALL);
        assert_eq!(c.waiters(), 0);
    }

    #[test]
    fn test_wait_does_not_block_when_done_available() {
        let c = Completion::new("test_nb");
        c.complete();
        c.wait_for_completion();
        assert_eq!(c.done(), 0);
    }
}
