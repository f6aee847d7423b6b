//! Read-copy-update
//!
//! Quiescent-state-based reclamation. Readers bump a per-hart nesting
//! counter; writers publish pointers with release stores and push deferred
//! frees onto hart-local callback lists. A grace period ends once every
//! live hart has noted a quiescent state (context switch or idle entry)
//! after the period started; the idle loop advances the state machine, so
//! no dedicated RCU thread exists.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use crate::smp::percpu::MAX_HARTS;
use crate::sync::{Completion, SpinLock};

/// Number of the most recently started grace period
static GP_SEQ: AtomicU64 = AtomicU64::new(0);
/// Is a grace period currently being waited out?
static GP_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
/// Number of the most recently completed grace period
static GP_COMPLETED: AtomicU64 = AtomicU64::new(0);

/// Last grace period each hart has passed through
static SEEN: [AtomicU64; MAX_HARTS] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];

/// Serializes grace-period advancement; contended harts just skip a turn.
static ADVANCE_LOCK: SpinLock<()> = SpinLock::new("rcu_advance", ());

struct RcuCallback {
    batch: u64,
    func: Box<dyn FnOnce() + Send>,
}

/// Hart-local deferred-free lists; pushes stay on the producing hart.
static CALLBACKS: [SpinLock<VecDeque<RcuCallback>>; MAX_HARTS] = [
    SpinLock::new("rcu_cbs", VecDeque::new()),
    SpinLock::new("rcu_cbs", VecDeque::new()),
    SpinLock::new("rcu_cbs", VecDeque::new()),
    SpinLock::new("rcu_cbs", VecDeque::new()),
    SpinLock::new("rcu_cbs", VecDeque::new()),
    SpinLock::new("rcu_cbs", VecDeque::new()),
    SpinLock::new("rcu_cbs", VecDeque::new()),
    SpinLock::new("rcu_cbs", VecDeque::new()),
];

/// RAII read-side critical section
pub struct RcuReadGuard {
    _not_send: core::marker::PhantomData<*const ()>,
}

/// Enter a read-side critical section. Pointers loaded through
/// [`RcuPointer::dereference`] stay valid until the guard drops. Sleeping
/// inside is a bug (asserted at every sleep entry).
pub fn rcu_read_lock() -> RcuReadGuard {
    crate::smp::percpu::this_cpu().inc_rcu_nesting();
    core::sync::atomic::fence(Ordering::Acquire);
    RcuReadGuard {
        _not_send: core::marker::PhantomData,
    }
}

impl Drop for RcuReadGuard {
    fn drop(&mut self) {
        core::sync::atomic::fence(Ordering::Release);
        crate::smp::percpu::this_cpu().dec_rcu_nesting();
    }
}

/// An RCU-protected pointer slot.
///
/// Readers get references scoped to their read guard; writers swap the
/// pointer and free the old object through [`call_rcu`].
pub struct RcuPointer<T> {
    ptr: AtomicPtr<T>,
}

impl<T> RcuPointer<T> {
    pub const fn null() -> Self {
        Self {
            ptr: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Acquire-load for readers; the reference lives as long as the guard.
    pub fn dereference<'g>(&self, _guard: &'g RcuReadGuard) -> Option<&'g T> {
        let p = self.ptr.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }

    /// Raw acquire-load scoped to a read section; for callers that need
    /// the pointer itself (refcount adoption).
    pub fn load_raw(&self, _guard: &RcuReadGuard) -> *mut T {
        self.ptr.load(Ordering::Acquire)
    }

    /// Release-publish a new object; returns the previous raw pointer,
    /// which the caller must retire through [`call_rcu`] (or reclaim
    /// immediately if it provably never was visible).
    pub fn assign(&self, new: Box<T>) -> *mut T {
        self.ptr.swap(Box::into_raw(new), Ordering::AcqRel)
    }

    /// Release-publish a raw pointer whose ownership convention the
    /// caller manages (e.g. an adopted `Arc` reference).
    pub fn assign_raw(&self, new: *mut T) -> *mut T {
        self.ptr.swap(new, Ordering::AcqRel)
    }

    /// Retract the pointer; same retirement duty as [`RcuPointer::assign`].
    pub fn take(&self) -> *mut T {
        self.ptr.swap(core::ptr::null_mut(), Ordering::AcqRel)
    }

    /// Raw peek without a read section; only for "is there anything here"
    /// checks under the writer-side lock.
    pub fn is_null(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }
}

/// A grace period that begins after this call; conservative by one extra
/// period when one is already in flight.
fn target_batch() -> u64 {
    GP_COMPLETED.load(Ordering::Acquire) + 1 + GP_IN_PROGRESS.load(Ordering::Acquire) as u64
}

/// Defer `func` until every hart has passed a quiescent state.
pub fn call_rcu(func: Box<dyn FnOnce() + Send>) {
    let batch = target_batch();
    let hart = crate::arch::hart_id() % MAX_HARTS;
    CALLBACKS[hart].lock().push_back(RcuCallback { batch, func });
}

/// Note that the calling hart is quiescent (idle entry, context switch,
/// or an explicit checkpoint).
pub fn note_quiescent() {
    let hart = crate::arch::hart_id() % MAX_HARTS;
    let gp = GP_SEQ.load(Ordering::Acquire);
    SEEN[hart].store(gp, Ordering::Release);
}

/// Does `hart` count toward grace-period completion?
fn hart_participates(hart: usize, me: usize) -> bool {
    if hart == me {
        return true;
    }
    crate::smp::is_hart_online(hart) && !crate::smp::percpu::cpu(hart).is_crashed()
}

/// Advance the grace-period state machine and drain this hart's ripe
/// callbacks. Called from the idle loop; cheap when nothing changed.
pub fn rcu_tick() {
    note_quiescent();

    if let Some(_g) = ADVANCE_LOCK.try_lock() {
        let me = crate::arch::hart_id() % MAX_HARTS;

        if GP_IN_PROGRESS.load(Ordering::Acquire) {
            let gp = GP_SEQ.load(Ordering::Acquire);
            let all_passed = (0..MAX_HARTS)
                .filter(|&h| hart_participates(h, me))
                // Wrap-tolerant compare: a hart is current when its stamp
                // is not behind the open period.
                .all(|h| {
                    let seen = SEEN[h].load(Ordering::Acquire);
                    gp.wrapping_sub(seen) as i64 <= 0
                });
            if all_passed {
                GP_COMPLETED.store(gp, Ordering::Release);
                GP_IN_PROGRESS.store(false, Ordering::Release);
            }
        }

        if !GP_IN_PROGRESS.load(Ordering::Acquire) && callbacks_waiting(me) {
            GP_SEQ.fetch_add(1, Ordering::AcqRel);
            GP_IN_PROGRESS.store(true, Ordering::Release);
        }
    }

    drain_ripe_callbacks();
}

fn callbacks_waiting(me: usize) -> bool {
    let completed = GP_COMPLETED.load(Ordering::Acquire);
    for hart in 0..MAX_HARTS {
        let list = if hart == me {
            CALLBACKS[hart].lock()
        } else {
            match CALLBACKS[hart].try_lock() {
                Some(g) => g,
                None => return true,
            }
        };
        if list.iter().any(|cb| cb.batch > completed) {
            return true;
        }
    }
    false
}

/// Run this hart's callbacks whose grace period has elapsed.
fn drain_ripe_callbacks() {
    let hart = crate::arch::hart_id() % MAX_HARTS;
    let completed = GP_COMPLETED.load(Ordering::Acquire);

    loop {
        let cb = {
            let mut list = CALLBACKS[hart].lock();
            let ripe = list.front().map_or(false, |cb| cb.batch <= completed);
            if ripe {
                list.pop_front()
            } else {
                None
            }
        };
        match cb {
            Some(cb) => (cb.func)(),
            None => break,
        }
    }
}

/// Block until one full grace period has elapsed.
pub fn synchronize_rcu() {
    let comp = Arc::new(Completion::new("synchronize_rcu"));
    let waker = comp.clone();
    call_rcu(Box::new(move || waker.complete()));
    comp.wait_for_completion();
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    // Drive the state machine by hand: the callback must survive until a
    // full grace period has been observed, then run exactly once.
    #[test]
    fn test_callback_runs_after_grace_period() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        call_rcu(Box::new(|| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }));

        // Starts a period; nothing ripe yet.
        rcu_tick();
        let before = FIRED.load(Ordering::SeqCst);

        // The quiescent pass completes the period and drains.
        rcu_tick();
        rcu_tick();
        assert_eq!(FIRED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_pointer_publish_and_retract() {
        let slot: RcuPointer<u32> = RcuPointer::null();
        assert!(slot.is_null());

        let old = slot.assign(Box::new(11));
        assert!(old.is_null());

        {
            let g = rcu_read_lock();
            assert_eq!(slot.dereference(&g), Some(&11));
        }

        let taken = slot.take();
        assert!(!taken.is_null());
        {
            let g = rcu_read_lock();
            assert_eq!(slot.dereference(&g), None);
        }
        // Never published to another hart in this test: reclaim directly.
        drop(unsafe { Box::from_raw(taken) });
    }
}
