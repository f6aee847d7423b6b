//! Sleep/wake queues
//!
//! A sleeping thread parks a `Waiter` record on a queue; wakers fill in
//! the waiter's error/data slots, detach it and make the thread runnable.
//! Enqueue is atomic with the transition to the sleeping state: both
//! happen before the caller's lock guard drops, so a waker that can see
//! the changed condition can also see the waiter.
//!
//! Two flavors share the contract: `WaitQueue` is FIFO, `WaitTree` keeps
//! waiters ordered by a caller-supplied key and can wake the earliest
//! waiter at or above a key.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};

use super::spinlock::{SpinGuard, SpinLock};
use crate::lib::error::{Errno, Result};
use crate::process::thread::Thread;

/// Requested sleeping state for a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepKind {
    Interruptible,
    Uninterruptible,
}

static WAITER_SEQ: AtomicU64 = AtomicU64::new(1);

/// One parked sleeper. Shared between the sleeping thread and the queue;
/// the sleeper's clone dies with its stack frame.
pub struct Waiter {
    thread: Option<Arc<Thread>>,
    error_no: AtomicI32,
    data: AtomicUsize,
    linked: AtomicBool,
    key: u64,
    seq: u64,
}

impl Waiter {
    pub(crate) fn new(thread: Option<Arc<Thread>>, key: u64) -> Arc<Self> {
        Arc::new(Self {
            thread,
            error_no: AtomicI32::new(Errno::EINTR.as_i32()),
            data: AtomicUsize::new(0),
            linked: AtomicBool::new(false),
            key,
            seq: WAITER_SEQ.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    fn fill(&self, error_no: i32, data: usize) {
        self.data.store(data, Ordering::Relaxed);
        self.error_no.store(error_no, Ordering::Release);
    }

    fn outcome(&self) -> Result<usize> {
        match self.error_no.load(Ordering::Acquire) {
            0 => Ok(self.data.load(Ordering::Relaxed)),
            raw => Err(Errno::from_i32(raw).unwrap_or(Errno::EINTR)),
        }
    }

    fn wake_thread(&self) {
        if let Some(t) = &self.thread {
            crate::process::scheduler::wakeup(t);
        }
    }
}

/// Checks common to every sleep entry.
fn assert_may_sleep() {
    let cpu = crate::smp::percpu::this_cpu();
    if cpu.in_irq() {
        panic!("wait: sleeping in IRQ context");
    }
    if cpu.rcu_nesting() > 0 {
        panic!("wait: sleeping inside an RCU read section");
    }
    if super::spinlock::spin_depth() != 1 {
        panic!("wait: caller must hold exactly the bound lock");
    }
}

/// FIFO waitqueue
pub struct WaitQueue {
    name: &'static str,
    inner: SpinLock<VecDeque<Arc<Waiter>>>,
}

impl WaitQueue {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: SpinLock::new("waitqueue", VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn push(&self, w: Arc<Waiter>) {
        w.linked.store(true, Ordering::Release);
        self.inner.lock().push_back(w);
    }

    pub(crate) fn pop(&self) -> Option<Arc<Waiter>> {
        let w = self.inner.lock().pop_front();
        if let Some(w) = &w {
            w.linked.store(false, Ordering::Release);
        }
        w
    }

    pub(crate) fn remove(&self, w: &Arc<Waiter>) -> bool {
        let mut list = self.inner.lock();
        if let Some(pos) = list.iter().position(|e| Arc::ptr_eq(e, w)) {
            list.remove(pos);
            w.linked.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Splice every waiter of a drained `src` into an empty `self`.
    pub fn bulk_move(&self, src: &WaitQueue) -> Result<()> {
        let mut moved = src.inner.lock();
        let mut dst = self.inner.lock();
        if !dst.is_empty() {
            return Err(Errno::ENOTEMPTY);
        }
        core::mem::swap(&mut *dst, &mut *moved);
        Ok(())
    }

    /// Sleep interruptibly until woken. See [`WaitQueue::wait_in_state`].
    pub fn wait<'a, T>(&self, guard: SpinGuard<'a, T>) -> (SpinGuard<'a, T>, Result<usize>) {
        self.wait_in_state(guard, SleepKind::Interruptible)
    }

    /// Atomically enqueue and sleep. The caller holds the lock that guards
    /// the awaited condition; it is released after the waiter is parked and
    /// re-acquired before this returns. Returns the waker's data word, or
    /// the errno a waker or cancellation left in the waiter.
    pub fn wait_in_state<'a, T>(
        &self,
        guard: SpinGuard<'a, T>,
        kind: SleepKind,
    ) -> (SpinGuard<'a, T>, Result<usize>) {
        assert_may_sleep();

        let cur = crate::process::current().expect("wait: no current thread");
        let w = Waiter::new(Some(cur.clone()), 0);
        let lock = guard.source();

        let parked = {
            let mut list = self.inner.lock();
            w.linked.store(true, Ordering::Release);
            list.push_back(w.clone());

            match cur.prepare_sleep(kind) {
                crate::process::thread::SleepDecision::Sleep => true,
                decision => {
                    // A wakeup or signal beat us here; unpark unless a
                    // waker already detached us and filled the slots.
                    if w.linked.swap(false, Ordering::AcqRel) {
                        if let Some(pos) = list.iter().position(|e| Arc::ptr_eq(e, &w)) {
                            list.remove(pos);
                        }
                        if decision == crate::process::thread::SleepDecision::Awoken {
                            w.fill(0, 0);
                        }
                    }
                    false
                }
            }
        };

        drop(guard);

        if parked {
            crate::process::scheduler::yield_now();
        }

        let reacquired = lock.lock();

        // Still linked after the wake: the wake was asynchronous (signal);
        // detach ourselves and report the cancellation.
        if w.is_linked() {
            self.remove(&w);
            return (reacquired, Err(Errno::EINTR));
        }

        (reacquired, w.outcome())
    }

    /// Wake the oldest waiter, handing it `error_no`/`data`.
    pub fn wakeup_one(&self, error_no: i32, data: usize) -> bool {
        match self.pop() {
            Some(w) => {
                w.fill(error_no, data);
                w.wake_thread();
                true
            }
            None => false,
        }
    }

    /// Wake every waiter. Returns how many were woken.
    pub fn wakeup_all(&self, error_no: i32, data: usize) -> usize {
        let mut n = 0;
        while self.wakeup_one(error_no, data) {
            n += 1;
        }
        n
    }
}

/// Keyed waitqueue: an ordered tree of waiters, FIFO within a key.
pub struct WaitTree {
    name: &'static str,
    inner: SpinLock<BTreeMap<(u64, u64), Arc<Waiter>>>,
}

impl WaitTree {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: SpinLock::new("waittree", BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn push(&self, w: Arc<Waiter>) {
        w.linked.store(true, Ordering::Release);
        self.inner.lock().insert((w.key, w.seq), w);
    }

    /// Earliest waiter whose key is >= `key`, if any.
    pub(crate) fn find_min_ge(&self, key: u64) -> Option<Arc<Waiter>> {
        self.inner
            .lock()
            .range((key, 0)..)
            .next()
            .map(|(_, w)| w.clone())
    }

    pub(crate) fn remove(&self, w: &Arc<Waiter>) -> bool {
        let removed = self.inner.lock().remove(&(w.key, w.seq)).is_some();
        if removed {
            w.linked.store(false, Ordering::Release);
        }
        removed
    }

    /// Sleep on the tree under `key`. Same contract as
    /// [`WaitQueue::wait_in_state`].
    pub fn wait_keyed<'a, T>(
        &self,
        guard: SpinGuard<'a, T>,
        key: u64,
        kind: SleepKind,
    ) -> (SpinGuard<'a, T>, Result<usize>) {
        assert_may_sleep();

        let cur = crate::process::current().expect("wait: no current thread");
        let w = Waiter::new(Some(cur.clone()), key);
        let lock = guard.source();

        let parked = {
            let mut tree = self.inner.lock();
            w.linked.store(true, Ordering::Release);
            tree.insert((w.key, w.seq), w.clone());

            match cur.prepare_sleep(kind) {
                crate::process::thread::SleepDecision::Sleep => true,
                decision => {
                    if w.linked.swap(false, Ordering::AcqRel) {
                        tree.remove(&(w.key, w.seq));
                        if decision == crate::process::thread::SleepDecision::Awoken {
                            w.fill(0, 0);
                        }
                    }
                    false
                }
            }
        };

        drop(guard);

        if parked {
            crate::process::scheduler::yield_now();
        }

        let reacquired = lock.lock();

        if w.is_linked() {
            self.remove(&w);
            return (reacquired, Err(Errno::EINTR));
        }

        (reacquired, w.outcome())
    }

    /// Wake the earliest waiter whose key is exactly `key`.
    pub fn wakeup_key(&self, key: u64, error_no: i32, data: usize) -> bool {
        let w = {
            let mut tree = self.inner.lock();
            let found = tree.range((key, 0)..).next().map(|(k, w)| (*k, w.clone()));
            match found {
                Some((k, w)) if k.0 == key => {
                    tree.remove(&k);
                    w.linked.store(false, Ordering::Release);
                    Some(w)
                }
                _ => None,
            }
        };
        match w {
            Some(w) => {
                w.fill(error_no, data);
                w.wake_thread();
                true
            }
            None => false,
        }
    }

    /// Wake every waiter whose key is exactly `key`.
    pub fn wakeup_key_all(&self, key: u64, error_no: i32, data: usize) -> usize {
        let mut n = 0;
        while self.wakeup_key(key, error_no, data) {
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_remove_leaves_size_unchanged() {
        let q = WaitQueue::new("test_q");
        let w = Waiter::new(None, 0);
        let before = q.len();
        q.push(w.clone());
        assert!(w.is_linked());
        assert!(q.remove(&w));
        assert_eq!(q.len(), before);
        assert!(!w.is_linked());
    }

    #[test]
    fn test_fifo_order() {
        let q = WaitQueue::new("test_fifo");
        let a = Waiter::new(None, 0);
        let b = Waiter::new(None, 0);
        q.push(a.clone());
        q.push(b.clone());
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &a));
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &b));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_bulk_move_requires_empty_destination() {
        let src = WaitQueue::new("test_src");
        let dst = WaitQueue::new("test_dst");
        src.push(Waiter::new(None, 0));
        src.push(Waiter::new(None, 0));

        assert_eq!(dst.bulk_move(&src), Ok(()));
        assert_eq!(dst.len(), 2);
        assert_eq!(src.len(), 0);

        src.push(Waiter::new(None, 0));
        assert_eq!(dst.bulk_move(&src), Err(Errno::ENOTEMPTY));
    }

    #[test]
    fn test_tree_min_ge_and_key_wake() {
        let t = WaitTree::new("test_tree");
        let w10 = Waiter::new(None, 10);
        let w20a = Waiter::new(None, 20);
        let w20b = Waiter::new(None, 20);
        t.push(w20a.clone());
        t.push(w10.clone());
        t.push(w20b.clone());

        let min = t.find_min_ge(0).unwrap();
        assert!(Arc::ptr_eq(&min, &w10));
        let min15 = t.find_min_ge(15).unwrap();
        assert!(Arc::ptr_eq(&min15, &w20a));

        // Exact-key wake is FIFO within the key and skips other keys.
        assert!(!t.wakeup_key(15, 0, 0));
        assert!(t.wakeup_key(20, 0, 7));
        assert_eq!(w20a.outcome(), Ok(7));
        assert_eq!(t.wakeup_key_all(20, 0, 8), 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_waiter_defaults_to_eintr() {
        let w = Waiter::new(None, 0);
        assert_eq!(w.outcome(), Err(Errno::EINTR));
        w.fill(Errno::ETIMEDOUT.as_i32(), 0);
        assert_eq!(w.outcome(), Err(Errno::ETIMEDOUT));
        w.fill(0, 99);
        assert_eq!(w.outcome(), Ok(99));
    }
}
