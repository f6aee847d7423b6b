//! TID allocation and lookup
//!
//! A fixed table of RCU-published thread pointers. Mutations take
//! `pid_lock`; lookups run lock-free inside an RCU read section and adopt
//! a reference before leaving it. A removed entry is retired through
//! `call_rcu`, so a concurrent lookup that already loaded the pointer
//! stays safe until its read section closes.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::lib::error::{Errno, Result};
use crate::process::thread::{Thread, Tid};
use crate::rcu::{rcu_read_lock, RcuPointer};
use crate::sync::SpinLock;

/// Maximum number of live threads
pub const MAX_THREADS: usize = 1024;

static NEXT_TID: AtomicI32 = AtomicI32::new(1);

/// Serializes table writes, group membership and live counts.
pub static PID_LOCK: SpinLock<()> = SpinLock::new("pid_lock", ());

struct Slots {
    slots: [RcuPointer<Thread>; MAX_THREADS],
}

static TABLE: Slots = Slots {
    slots: [const { RcuPointer::null() }; MAX_THREADS],
};

#[inline]
fn slot_of(tid: Tid) -> &'static RcuPointer<Thread> {
    &TABLE.slots[tid as usize % MAX_THREADS]
}

/// Reserve a fresh TID whose table slot is free.
pub fn alloc_tid() -> Result<Tid> {
    for _ in 0..MAX_THREADS {
        let tid = NEXT_TID.fetch_add(1, Ordering::SeqCst);
        if tid < 0 {
            // Wrapped; restart the space. Uniqueness still holds because
            // occupied slots are skipped below.
            NEXT_TID.store(1, Ordering::SeqCst);
            continue;
        }
        if slot_of(tid).is_null() {
            return Ok(tid);
        }
    }
    Err(Errno::ENOMEM)
}

/// Publish a thread in the table. Caller holds `pid_lock`.
pub fn insert(t: &Arc<Thread>) -> Result<()> {
    let slot = slot_of(t.tid());
    if !slot.is_null() {
        return Err(Errno::EEXIST);
    }
    // The slot owns one Arc reference until `remove` retires it.
    let raw = Arc::into_raw(t.clone()) as *mut Thread;
    let old = slot.assign_raw(raw);
    debug_assert!(old.is_null());
    Ok(())
}

/// Retract a thread from the table and retire the table's reference
/// after a grace period. Caller holds `pid_lock`.
pub fn remove(tid: Tid) -> Result<()> {
    let slot = slot_of(tid);
    let raw = slot.take();
    if raw.is_null() {
        return Err(Errno::ESRCH);
    }

    struct Retired(*const Thread);
    unsafe impl Send for Retired {}
    let retired = Retired(raw);

    crate::rcu::call_rcu(Box::new(move || {
        let r = retired;
        unsafe { drop(Arc::from_raw(r.0)) };
    }));
    Ok(())
}

/// Look up a live thread by TID.
pub fn lookup(tid: Tid) -> Option<Arc<Thread>> {
    if tid < 0 {
        return None;
    }
    let guard = rcu_read_lock();
    let raw = slot_of(tid).load_raw(&guard);
    if raw.is_null() {
        return None;
    }
    let t = unsafe { &*raw };
    if t.tid() != tid {
        return None;
    }
    // Adopt a reference while the read section still pins the object.
    unsafe {
        Arc::increment_strong_count(raw);
        Some(Arc::from_raw(raw))
    }
}

/// Look up a thread group by TGID (the leader's TID).
pub fn lookup_group(tgid: Tid) -> Option<Arc<crate::process::group::ThreadGroup>> {
    let leader = lookup(tgid)?;
    if leader.group.tgid() != tgid {
        return None;
    }
    Some(leader.group.clone())
}

/// Live threads currently published.
pub fn count() -> usize {
    let guard = rcu_read_lock();
    TABLE
        .slots
        .iter()
        .filter(|s| s.dereference(&guard).is_some())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::group::ThreadGroup;
    use crate::process::signal::SigActs;

    fn mk_thread(name: &str) -> Arc<Thread> {
        Thread::new_kthread(
            name,
            |_, _| {},
            0,
            0,
            crate::process::thread::DEFAULT_STACK_ORDER,
            ThreadGroup::new(),
            SigActs::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_insert_lookup_remove() {
        let t = mk_thread("tid_t");
        let tid = t.tid();
        {
            let _g = PID_LOCK.lock();
            insert(&t).unwrap();
        }
        let found = lookup(tid).expect("published thread is visible");
        assert_eq!(found.tid(), tid);
        assert!(Arc::ptr_eq(&found, &t));

        {
            let _g = PID_LOCK.lock();
            assert_eq!(remove(tid), Ok(()));
            assert_eq!(remove(tid), Err(Errno::ESRCH));
        }
        assert!(lookup(tid).is_none());
    }

    #[test]
    fn test_double_insert_refused() {
        let t = mk_thread("tid_dup");
        let _g = PID_LOCK.lock();
        insert(&t).unwrap();
        assert_eq!(insert(&t), Err(Errno::EEXIST));
        remove(t.tid()).unwrap();
    }

    #[test]
    fn test_lookup_rejects_stale_tid() {
        // A slot holds the thread whose tid hashes there; an old tid that
        // maps to the same slot must not alias it.
        let t = mk_thread("tid_stale");
        let tid = t.tid();
        {
            let _g = PID_LOCK.lock();
            insert(&t).unwrap();
        }
        let aliased = tid + MAX_THREADS as Tid;
        assert!(lookup(aliased).is_none());
        {
            let _g = PID_LOCK.lock();
            remove(tid).unwrap();
        }
    }
}
