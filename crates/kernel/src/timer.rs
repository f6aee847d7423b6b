//! Tickless per-hart timers
//!
//! Each hart owns an ordered expiration tree keyed by (tick, node id).
//! The tick handler fires every due callback once per tick; a callback
//! (or the thread it wakes) must call `timer_remove`, otherwise the node
//! is retried on every later tick until `retry_limit` is exhausted and
//! the node is forcibly dropped.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::lib::error::{Errno, Result};
use crate::smp::percpu::MAX_HARTS;
use crate::sync::{SleepKind, SpinLock, WaitTree};

pub type TimerCallback = fn(&Arc<Timer>, usize);

static TIMER_IDS: AtomicU64 = AtomicU64::new(1);

struct TimerState {
    expires: u64,
    retries: u32,
    /// Hart whose root holds this node, if queued
    queued_on: Option<usize>,
}

pub struct Timer {
    id: u64,
    retry_limit: u32,
    callback: TimerCallback,
    data: usize,
    state: SpinLock<TimerState>,
}

impl Timer {
    /// A caller-owned timer node, not yet queued anywhere.
    pub fn new(callback: TimerCallback, data: usize, retry_limit: u32) -> Arc<Self> {
        Arc::new(Self {
            id: TIMER_IDS.fetch_add(1, Ordering::Relaxed),
            retry_limit,
            callback,
            data,
            state: SpinLock::new(
                "timer",
                TimerState {
                    expires: 0,
                    retries: 0,
                    queued_on: None,
                },
            ),
        })
    }

    pub fn data(&self) -> usize {
        self.data
    }

    pub fn is_queued(&self) -> bool {
        self.state.lock().queued_on.is_some()
    }
}

struct TimerRoot {
    tree: BTreeMap<(u64, u64), Arc<Timer>>,
    current_tick: u64,
    next_tick: u64,
}

impl TimerRoot {
    const fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
            current_tick: 0,
            next_tick: 0,
        }
    }

    fn refresh_next(&mut self) {
        self.next_tick = self
            .tree
            .keys()
            .next()
            .map(|(exp, _)| *exp)
            .unwrap_or(0);
    }
}

static ROOTS: [SpinLock<TimerRoot>; MAX_HARTS] = [
    SpinLock::new("timer_root", TimerRoot::new()),
    SpinLock::new("timer_root", TimerRoot::new()),
    SpinLock::new("timer_root", TimerRoot::new()),
    SpinLock::new("timer_root", TimerRoot::new()),
    SpinLock::new("timer_root", TimerRoot::new()),
    SpinLock::new("timer_root", TimerRoot::new()),
    SpinLock::new("timer_root", TimerRoot::new()),
    SpinLock::new("timer_root", TimerRoot::new()),
];

/// Queue a timer on a specific hart's root.
pub fn timer_add_on(hart: usize, timer: &Arc<Timer>, expires: u64) -> Result<()> {
    if hart >= MAX_HARTS {
        return Err(Errno::EINVAL);
    }
    let mut root = ROOTS[hart].lock();
    let mut st = timer.state.lock();
    if st.queued_on.is_some() {
        return Err(Errno::EEXIST);
    }
    if expires <= root.current_tick {
        return Err(Errno::EINVAL);
    }
    st.expires = expires;
    st.retries = 0;
    st.queued_on = Some(hart);
    drop(st);
    root.tree.insert((expires, timer.id), timer.clone());
    root.refresh_next();
    Ok(())
}

/// Queue a timer on the calling hart.
pub fn timer_add(timer: &Arc<Timer>, expires: u64) -> Result<()> {
    timer_add_on(crate::arch::hart_id(), timer, expires)
}

/// Detach a timer from whichever root holds it.
pub fn timer_remove(timer: &Arc<Timer>) -> Result<()> {
    loop {
        let (hart, expires) = {
            let st = timer.state.lock();
            match st.queued_on {
                Some(h) => (h, st.expires),
                None => return Err(Errno::ENOENT),
            }
        };

        let mut root = ROOTS[hart].lock();
        let mut st = timer.state.lock();
        // Re-check: a concurrent tick may have force-removed or a racing
        // remove may have won between the peek and the root lock.
        match st.queued_on {
            Some(h) if h == hart && st.expires == expires => {
                st.queued_on = None;
                drop(st);
                root.tree.remove(&(expires, timer.id));
                root.refresh_next();
                return Ok(());
            }
            None => return Err(Errno::ENOENT),
            _ => continue,
        }
    }
}

/// Advance one hart's root by `ticks` and fire due callbacks. Each due
/// node fires at most once per call; callbacks run without the root lock
/// and must not sleep.
pub(crate) fn tick_root(hart: usize, ticks: u64) {
    let root_lock = &ROOTS[hart % MAX_HARTS];
    let mut root = root_lock.lock();
    root.current_tick = root.current_tick.wrapping_add(ticks);
    let now = root.current_tick;

    // Snapshot the due set so re-armed or retried nodes fire once.
    let due: alloc::vec::Vec<((u64, u64), Arc<Timer>)> = root
        .tree
        .range(..=(now, u64::MAX))
        .map(|(k, t)| (*k, t.clone()))
        .collect();

    for (key, timer) in due {
        let fire = {
            let mut st = timer.state.lock();
            if st.queued_on != Some(hart) {
                continue;
            }
            if st.retries >= timer.retry_limit {
                // The callback kept missing its removal duty.
                st.queued_on = None;
                drop(st);
                root.tree.remove(&key);
                crate::warn!("TIMER: node {} force-removed after retries", timer.id);
                false
            } else {
                st.retries += 1;
                true
            }
        };

        if fire {
            drop(root);
            (timer.callback)(&timer, timer.data);
            root = root_lock.lock();
        }
    }

    root.refresh_next();
}

/// Tick the calling hart's timer root. Runs in IRQ context.
pub fn timer_tick(ticks: u64) {
    let hart = crate::arch::hart_id();
    tick_root(hart, ticks);
    wake_tick_sleepers(hart);
}

/// Threads sleeping until an absolute tick, keyed by that tick.
static SLEEP_GATES: [SpinLock<()>; MAX_HARTS] = [
    SpinLock::new("tick_sleep", ()),
    SpinLock::new("tick_sleep", ()),
    SpinLock::new("tick_sleep", ()),
    SpinLock::new("tick_sleep", ()),
    SpinLock::new("tick_sleep", ()),
    SpinLock::new("tick_sleep", ()),
    SpinLock::new("tick_sleep", ()),
    SpinLock::new("tick_sleep", ()),
];

static SLEEPERS: [WaitTree; MAX_HARTS] = [
    WaitTree::new("tick_sleepers"),
    WaitTree::new("tick_sleepers"),
    WaitTree::new("tick_sleepers"),
    WaitTree::new("tick_sleepers"),
    WaitTree::new("tick_sleepers"),
    WaitTree::new("tick_sleepers"),
    WaitTree::new("tick_sleepers"),
    WaitTree::new("tick_sleepers"),
];

/// Sleep for at least `ticks` scheduler ticks. Interruptible; a signal
/// cuts the sleep short with EINTR, expiry reports ETIMEDOUT.
pub fn sleep_ticks(ticks: u64) -> Result<()> {
    let hart = crate::arch::hart_id();
    let deadline = current_tick_on(hart).wrapping_add(ticks.max(1));

    let gate = SLEEP_GATES[hart].lock();
    let (gate, res) = SLEEPERS[hart].wait_keyed(gate, deadline, SleepKind::Interruptible);
    drop(gate);

    match res {
        Err(Errno::ETIMEDOUT) | Ok(_) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Release every sleeper whose deadline has passed on this hart.
fn wake_tick_sleepers(hart: usize) {
    let now = current_tick_on(hart);
    loop {
        let earliest = match SLEEPERS[hart].find_min_ge(0) {
            Some(w) => w.key(),
            None => break,
        };
        if earliest > now {
            break;
        }
        if SLEEPERS[hart].wakeup_key_all(earliest, Errno::ETIMEDOUT.as_i32(), 0) == 0 {
            break;
        }
    }
}

pub fn current_tick_on(hart: usize) -> u64 {
    ROOTS[hart % MAX_HARTS].lock().current_tick
}

/// Earliest queued expiration on a hart (0 when idle); the tickless
/// reprogramming path reads this.
pub fn next_tick_on(hart: usize) -> u64 {
    ROOTS[hart % MAX_HARTS].lock().next_tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    // The data word carries the test's own counter so parallel tests on
    // different roots cannot see each other's fires.
    fn counter(data: usize) -> &'static AtomicUsize {
        unsafe { &*(data as *const AtomicUsize) }
    }

    fn count_only(_t: &Arc<Timer>, data: usize) {
        counter(data).fetch_add(1, Ordering::SeqCst);
    }

    fn fire_and_remove(t: &Arc<Timer>, data: usize) {
        counter(data).fetch_add(1, Ordering::SeqCst);
        timer_remove(t).unwrap();
    }

    #[test]
    fn test_add_rejects_expired_and_double_queue() {
        static FIRES: AtomicUsize = AtomicUsize::new(0);
        let hart = 3;
        let t = Timer::new(count_only, &FIRES as *const _ as usize, 1);
        let now = current_tick_on(hart);
        assert_eq!(timer_add_on(hart, &t, now), Err(Errno::EINVAL));
        assert_eq!(timer_add_on(hart, &t, now + 5), Ok(()));
        assert_eq!(timer_add_on(hart, &t, now + 9), Err(Errno::EEXIST));
        timer_remove(&t).unwrap();
        assert_eq!(timer_remove(&t), Err(Errno::ENOENT));
    }

    #[test]
    fn test_callback_that_removes_fires_once() {
        static FIRES: AtomicUsize = AtomicUsize::new(0);
        let hart = 4;
        let t = Timer::new(fire_and_remove, &FIRES as *const _ as usize, 3);
        let now = current_tick_on(hart);
        timer_add_on(hart, &t, now + 1).unwrap();

        tick_root(hart, 1);
        assert_eq!(FIRES.load(Ordering::SeqCst), 1);
        assert!(!t.is_queued());
        tick_root(hart, 1);
        assert_eq!(FIRES.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_limit_forces_removal() {
        static FIRES: AtomicUsize = AtomicUsize::new(0);
        let hart = 5;
        let t = Timer::new(count_only, &FIRES as *const _ as usize, 3);
        let now = current_tick_on(hart);
        timer_add_on(hart, &t, now + 1).unwrap();

        tick_root(hart, 1);
        tick_root(hart, 1);
        tick_root(hart, 1);
        assert_eq!(FIRES.load(Ordering::SeqCst), 3);
        assert!(t.is_queued());

        // Fourth tick: the retry budget is spent, the node goes away.
        tick_root(hart, 1);
        assert_eq!(FIRES.load(Ordering::SeqCst), 3);
        assert!(!t.is_queued());

        tick_root(hart, 1);
        assert_eq!(FIRES.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_next_tick_tracks_earliest() {
        static FIRES: AtomicUsize = AtomicUsize::new(0);
        let hart = 6;
        let a = Timer::new(count_only, &FIRES as *const _ as usize, 1);
        let b = Timer::new(count_only, &FIRES as *const _ as usize, 1);
        let now = current_tick_on(hart);
        timer_add_on(hart, &a, now + 10).unwrap();
        timer_add_on(hart, &b, now + 4).unwrap();
        assert_eq!(next_tick_on(hart), now + 4);
        timer_remove(&b).unwrap();
        assert_eq!(next_tick_on(hart), now + 10);
        timer_remove(&a).unwrap();
        assert_eq!(next_tick_on(hart), 0);
    }
}
