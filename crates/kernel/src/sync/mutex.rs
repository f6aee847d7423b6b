//! Sleepable mutex
//!
//! A waitqueue plus an owner TID. Not recursive; the owner is asserted on
//! release. May not be taken while holding a spinlock or from IRQ context.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::spinlock::SpinLock;
use super::waitqueue::{SleepKind, WaitQueue};
use crate::process::thread::{Tid, NO_TID};

struct MutexState {
    owner: Tid,
}

pub struct Mutex<T: ?Sized> {
    state: SpinLock<MutexState>,
    wq: WaitQueue,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            state: SpinLock::new(name, MutexState { owner: NO_TID }),
            wq: WaitQueue::new(name),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let me = crate::process::current_tid();

        let mut g = self.state.lock();
        if g.owner == me {
            panic!("mutex {}: recursive lock", self.state.name());
        }
        loop {
            if g.owner == NO_TID {
                g.owner = me;
                return MutexGuard { mutex: self };
            }
            let (reacquired, _) = self.wq.wait_in_state(g, SleepKind::Uninterruptible);
            g = reacquired;
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let me = crate::process::current_tid();
        let mut g = self.state.lock();
        if g.owner == NO_TID {
            g.owner = me;
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner != NO_TID
    }

    fn unlock(&self) {
        let me = crate::process::current_tid();
        {
            let mut g = self.state.lock();
            if g.owner != me {
                panic!("mutex {}: unlock by non-owner", self.state.name());
            }
            g.owner = NO_TID;
        }
        // Hand-off happens after the state lock drops so the woken thread
        // can take it immediately.
        self.wq.wakeup_one(0, 0);
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncontended_lock_unlock() {
        let m = Mutex::new("test_m", 5u32);
        {
            let mut g = m.lock();
            *g = 6;
            assert!(m.is_locked());
        }
        assert!(!m.is_locked());
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn test_try_lock_reports_contention() {
        let m = Mutex::new("test_m2", ());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }
}
