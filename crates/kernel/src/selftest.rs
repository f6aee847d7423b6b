//! Boot-time smoke tests
//!
//! Exercises the concurrency core end-to-end on live harts: sleep/wake,
//! sleepable locks, completions, signal cancellation and synchronous
//! consumption, timers, RCU grace periods, the work queue pool, and
//! thread reaping. Runs from a dedicated kernel thread so nothing here
//! ever sleeps on an idle thread's back.

use alloc::sync::Arc;

use crate::lib::error::Errno;
use crate::process::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SIGUSR1, SIGUSR2};
use crate::process::{self, scheduler};
use crate::sync::{Completion, Mutex, RwSemaphore, SleepKind, SpinLock, WaitQueue};

fn check(name: &str, ok: bool) {
    if ok {
        crate::info!("SELFTEST: {} ok", name);
    } else {
        crate::error!("SELFTEST: {} FAILED", name);
    }
}

/// Spawn the self-test driver. Called once from the boot hart.
pub fn spawn() {
    if process::spawn_kthread("selftest", driver, 0, 0).is_err() {
        crate::warn!("SELFTEST: could not spawn driver");
    }
}

fn driver(_a: usize, _b: usize) {
    crate::info!("SELFTEST: starting");

    test_mutex_handoff();
    test_rwsem_shared_then_exclusive();
    test_completion_rendezvous();
    test_wait_cancelled_by_signal();
    test_mask_round_trip();
    test_timer_sleep();
    test_rcu_grace_period();
    test_workqueue_pool();
    test_reap_exit_code();

    crate::info!("SELFTEST: done");
}

static SHARED: Mutex<u64> = Mutex::new("selftest_shared", 0);
static MUTEX_DONE: Completion = Completion::new("selftest_mutex_done");

fn mutex_bumper(rounds: usize, _b: usize) {
    for _ in 0..rounds {
        let mut g = SHARED.lock();
        *g += 1;
        drop(g);
        scheduler::yield_now();
    }
    MUTEX_DONE.complete();
}

fn test_mutex_handoff() {
    let t1 = process::spawn_kthread("st_bump0", mutex_bumper, 100, 0);
    let t2 = process::spawn_kthread("st_bump1", mutex_bumper, 100, 0);
    if t1.is_err() || t2.is_err() {
        check("mutex_handoff", false);
        return;
    }
    MUTEX_DONE.wait_for_completion();
    MUTEX_DONE.wait_for_completion();
    check("mutex_handoff", *SHARED.lock() == 200);
}

static RW: RwSemaphore = RwSemaphore::new("selftest_rw", true);

fn test_rwsem_shared_then_exclusive() {
    RW.acquire_read();
    let shared = RW.try_acquire_read();
    if shared {
        RW.release();
    }
    let excluded = !RW.try_acquire_write();
    RW.release();

    RW.acquire_write();
    let writer_blocks_readers = !RW.try_acquire_read();
    RW.release();

    check(
        "rwsem_shared_then_exclusive",
        shared && excluded && writer_blocks_readers,
    );
}

static RENDEZVOUS: Completion = Completion::new("selftest_rendezvous");

fn completer(_a: usize, _b: usize) {
    scheduler::yield_now();
    RENDEZVOUS.complete();
}

fn test_completion_rendezvous() {
    if process::spawn_kthread("st_completer", completer, 0, 0).is_err() {
        check("completion_rendezvous", false);
        return;
    }
    RENDEZVOUS.wait_for_completion();
    check(
        "completion_rendezvous",
        RENDEZVOUS.done() == 0 && RENDEZVOUS.waiters() == 0,
    );
}

static CANCEL_GATE: SpinLock<()> = SpinLock::new("selftest_cancel", ());
static CANCEL_WQ: WaitQueue = WaitQueue::new("selftest_cancel");
static CANCEL_RESULT: Completion = Completion::new("selftest_cancel_done");

fn cancel_sleeper(_a: usize, _b: usize) {
    // Catchable disposition so the send marks the signal pending instead
    // of killing the thread.
    let _ = signal::sigaction(
        SIGUSR1,
        Some(SigAction {
            handler: SigHandler::User(0x1000),
            flags: SaFlags::SIGINFO,
            mask: SigSet::empty(),
        }),
        None,
    );

    let gate = CANCEL_GATE.lock();
    let (gate, res) = CANCEL_WQ.wait_in_state(gate, SleepKind::Interruptible);
    drop(gate);

    let cancelled = res == Err(Errno::EINTR);
    // Consume the pending instance synchronously.
    let mut set = SigSet::empty();
    set.add(SIGUSR1);
    let consumed = crate::process::sigdeliver::sigwait(set) == Ok(SIGUSR1);

    if cancelled && consumed {
        CANCEL_RESULT.complete();
    }
    process::exit(0);
}

fn test_wait_cancelled_by_signal() {
    let sleeper = match process::spawn_kthread("st_cancel", cancel_sleeper, 0, 0) {
        Ok(t) => t,
        Err(_) => {
            check("wait_cancelled_by_signal", false);
            return;
        }
    };

    // Let the sleeper park itself, then interrupt it.
    for _ in 0..10 {
        scheduler::yield_now();
    }
    let sent = signal::tkill(sleeper.tid(), SIGUSR1).is_ok();
    check(
        "wait_cancelled_by_signal",
        sent && {
            CANCEL_RESULT.wait_for_completion();
            true
        },
    );
}

fn test_mask_round_trip() {
    let mut set = SigSet::empty();
    set.add(SIGUSR2);
    set.add(signal::SIGKILL);

    let mut old = SigSet::empty();
    let blocked = signal::sigprocmask(signal::SIG_BLOCK, Some(set), Some(&mut old)).is_ok();

    let now = signal::sigpending().is_ok();
    let mut restored = SigSet::empty();
    let reset =
        signal::sigprocmask(signal::SIG_SETMASK, Some(old), Some(&mut restored)).is_ok();

    // The unblockable bit never made it into the mask.
    let stripped = !restored.contains(signal::SIGKILL) || restored == old;
    check("mask_round_trip", blocked && now && reset && stripped);
}

fn test_timer_sleep() {
    let hart = crate::arch::hart_id();
    let start = crate::timer::current_tick_on(hart);
    let slept = crate::timer::sleep_ticks(3).is_ok();
    let elapsed = crate::timer::current_tick_on(hart).wrapping_sub(start);
    check("timer_sleep", slept && elapsed >= 3);
}

fn test_rcu_grace_period() {
    use core::sync::atomic::{AtomicBool, Ordering};
    static FREED: AtomicBool = AtomicBool::new(false);

    crate::rcu::call_rcu(alloc::boxed::Box::new(|| {
        FREED.store(true, Ordering::Release);
    }));
    crate::rcu::synchronize_rcu();
    // One full grace period has elapsed; the earlier callback is ripe and
    // runs no later than the next idle pass.
    crate::timer::sleep_ticks(2).ok();
    check("rcu_grace_period", FREED.load(Ordering::Acquire));
}

static WQ_GATE: Completion = Completion::new("selftest_wq_gate");
static WQ_SEEN: Completion = Completion::new("selftest_wq_seen");

fn blocking_work(_data: usize) {
    WQ_SEEN.complete();
    WQ_GATE.wait_for_completion();
}

fn test_workqueue_pool() {
    let wq = match crate::workqueue::workqueue_create("st_wq", 4) {
        Ok(wq) => wq,
        Err(_) => {
            check("workqueue_pool", false);
            return;
        }
    };

    let works: alloc::vec::Vec<_> = (0..8)
        .map(|i| crate::workqueue::create_work_struct(blocking_work, i))
        .collect();
    let mut queued = 0;
    for w in &works {
        if crate::workqueue::queue_work(&wq, w) {
            queued += 1;
        }
    }

    // Workers saturate at max_active; the rest of the work waits.
    for _ in 0..4 {
        WQ_SEEN.wait_for_completion();
    }
    let bounded = wq.nr_workers() <= 4 && wq.pending() >= 4;

    WQ_GATE.complete_all();
    for _ in 0..4 {
        WQ_SEEN.wait_for_completion();
    }
    crate::workqueue::workqueue_destroy(&wq);

    check("workqueue_pool", queued == 8 && bounded);
}

fn short_lived(code: usize, _b: usize) {
    process::exit(code as i32);
}

fn test_reap_exit_code() {
    let t = match process::spawn_kthread("st_exiter", short_lived, 41, 0) {
        Ok(t) => t,
        Err(_) => {
            check("reap_exit_code", false);
            return;
        }
    };
    let code = process::reap::reap(t.tid());
    check("reap_exit_code", code == Ok(41));
}
