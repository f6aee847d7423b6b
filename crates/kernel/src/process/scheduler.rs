//! Per-hart scheduler
//!
//! Each hart owns a priority-tiered run queue. Only the owning hart pops
//! its queue; remote harts may push (cross-CPU wakeup) and then send a
//! reschedule IPI. `yield_now` is the single switch point: it picks the
//! next runnable thread, falls back to the hart's idle thread, and
//! switches stacks directly with interrupts off and no locks held.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::process::thread::{Thread, ThreadState};
use crate::smp::percpu::{self, MAX_HARTS};
use crate::sync::spinlock::{self, SpinLock};

pub const NR_PRIO_TIERS: usize = 4;
pub const DEFAULT_PRIORITY: u8 = 2;
pub const IDLE_PRIORITY: u8 = (NR_PRIO_TIERS - 1) as u8;

/// Quantum within a tier, in scheduler ticks (100 Hz)
pub const QUANTUM_TICKS: u32 = 10;

pub struct RunQueue {
    tiers: [VecDeque<Arc<Thread>>; NR_PRIO_TIERS],
    quantum_left: u32,
}

impl RunQueue {
    const fn new() -> Self {
        Self {
            tiers: [const { VecDeque::new() }; NR_PRIO_TIERS],
            quantum_left: QUANTUM_TICKS,
        }
    }

    fn push_tail(&mut self, t: Arc<Thread>, priority: u8) {
        let tier = (priority as usize).min(NR_PRIO_TIERS - 1);
        self.tiers[tier].push_back(t);
    }

    fn pop_first(&mut self) -> Option<Arc<Thread>> {
        for tier in self.tiers.iter_mut() {
            if let Some(t) = tier.pop_front() {
                return Some(t);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(|t| t.len()).sum()
    }
}

static RUN_QUEUES: [SpinLock<RunQueue>; MAX_HARTS] = [
    SpinLock::new("run_queue", RunQueue::new()),
    SpinLock::new("run_queue", RunQueue::new()),
    SpinLock::new("run_queue", RunQueue::new()),
    SpinLock::new("run_queue", RunQueue::new()),
    SpinLock::new("run_queue", RunQueue::new()),
    SpinLock::new("run_queue", RunQueue::new()),
    SpinLock::new("run_queue", RunQueue::new()),
    SpinLock::new("run_queue", RunQueue::new()),
];

fn rq(hart: usize) -> &'static SpinLock<RunQueue> {
    &RUN_QUEUES[hart % MAX_HARTS]
}

/// Runnable threads queued on a hart (diagnostics)
pub fn runqueue_len(hart: usize) -> usize {
    rq(hart).lock().len()
}

/// Poke a hart so it reaches a scheduling checkpoint soon.
fn poke_hart(hart: usize) {
    if hart == crate::arch::hart_id() {
        percpu::this_cpu().set_needs_resched();
    } else {
        crate::smp::ipi::send_single(hart, crate::smp::ipi::IpiReason::RESCHEDULE);
    }
}

/// Make a sleeping thread runnable.
///
/// Wakes both interruptible and uninterruptible sleepers. `STOPPED`
/// threads defer (only a continue signal resumes them); `ZOMBIE`/`UNUSED`
/// are a no-op; a still-running target gets its `AWOKEN` flag so the
/// imminent sleep bails out.
pub fn wakeup(t: &Arc<Thread>) -> bool {
    let mut s = t.sched.lock();
    match s.state() {
        ThreadState::Zombie | ThreadState::Unused | ThreadState::Stopped => false,
        ThreadState::Running => {
            t.set_awoken();
            drop(s);
            true
        }
        ThreadState::Interruptible | ThreadState::Uninterruptible => {
            s.make_running();
            let home = s.cpu;
            if !s.on_rq {
                s.on_rq = true;
                rq(home).lock().push_tail(t.clone(), s.priority);
            }
            drop(s);
            poke_hart(home);
            true
        }
    }
}

/// Signal-side wake: only interruptible sleep is cut short. A running
/// target is poked toward its next delivery checkpoint instead.
pub fn wake_interruptible(t: &Arc<Thread>) -> bool {
    let mut s = t.sched.lock();
    match s.state() {
        ThreadState::Interruptible => {
            s.make_running();
            let home = s.cpu;
            if !s.on_rq {
                s.on_rq = true;
                rq(home).lock().push_tail(t.clone(), s.priority);
            }
            drop(s);
            poke_hart(home);
            true
        }
        ThreadState::Running => {
            let home = s.cpu;
            let on_rq = s.on_rq;
            drop(s);
            if !on_rq {
                poke_hart(home);
            }
            false
        }
        _ => false,
    }
}

/// Resume a stopped thread (continue-signal side effect).
pub fn wake_stopped(t: &Arc<Thread>) -> bool {
    let mut s = t.sched.lock();
    if s.state() != ThreadState::Stopped {
        return false;
    }
    s.make_running();
    let home = s.cpu;
    if !s.on_rq {
        s.on_rq = true;
        rq(home).lock().push_tail(t.clone(), s.priority);
    }
    drop(s);
    poke_hart(home);
    true
}

/// Timer-tick hook: charge the quantum, request a reschedule when spent.
pub fn tick() {
    let cpu = percpu::this_cpu();
    cpu.inc_ticks();

    let mut q = rq(cpu.hart_id).lock();
    if q.quantum_left > 0 {
        q.quantum_left -= 1;
    }
    if q.quantum_left == 0 {
        cpu.set_needs_resched();
    }
}

/// Yield checkpoint for trap exits and the idle loop.
pub fn preempt_checkpoint() {
    let cpu = percpu::this_cpu();
    if cpu.in_irq() {
        return;
    }
    if cpu.take_needs_resched() {
        if crate::process::current().is_some() {
            yield_now();
        }
    }
}

/// The single switch point.
///
/// Re-queues the caller if it is still runnable, picks the next thread
/// (idle as fallback) and context-switches to it. Resumes here when the
/// caller is next scheduled.
pub fn yield_now() {
    let cpu = percpu::this_cpu();
    if cpu.in_irq() {
        panic!("yield in IRQ context");
    }
    if spinlock::spin_depth() != 0 {
        panic!("yield with {} spinlocks held", spinlock::spin_depth());
    }
    if cpu.rcu_nesting() != 0 {
        panic!("yield inside an RCU read section");
    }

    spinlock::push_off();

    let cur = unsafe { cpu.current_slot() }
        .clone()
        .expect("yield with no current thread");

    let idle = unsafe { cpu.idle_slot() }.clone().expect("no idle thread");

    // A still-running, non-idle caller goes back to the tail of its tier.
    {
        let mut s = cur.sched.lock();
        if s.state() == ThreadState::Running && !s.on_rq && !Arc::ptr_eq(&cur, &idle) {
            s.on_rq = true;
            s.cpu = cpu.hart_id;
            rq(cpu.hart_id).lock().push_tail(cur.clone(), s.priority);
        }
    }

    let next = match rq(cpu.hart_id).lock().pop_first() {
        Some(n) => n,
        None => idle.clone(),
    };

    {
        let mut s = next.sched.lock();
        s.on_rq = false;
        s.cpu = cpu.hart_id;
        debug_assert_eq!(s.state(), ThreadState::Running);
    }

    rq(cpu.hart_id).lock().quantum_left = QUANTUM_TICKS;

    if Arc::ptr_eq(&next, &cur) {
        spinlock::pop_off();
        return;
    }

    // A context switch is a quiescent state.
    crate::rcu::note_quiescent();
    cpu.inc_context_switches();

    let old_ctx = cur.ctx_ptr();
    let new_ctx = next.ctx_ptr();
    unsafe {
        *cpu.current_slot() = Some(next);
    }
    drop(cur);

    unsafe {
        crate::arch::switch_context(old_ctx, new_ctx);
    }

    // Back on this thread's stack, possibly on a different hart.
    spinlock::pop_off();
}

/// Balances the switch path's interrupt-off level for threads entering
/// through the kthread stub (their first resume skips the tail of
/// `yield_now`).
#[no_mangle]
extern "C" fn kthread_land() {
    spinlock::pop_off();
}

/// Install the calling boot context as this hart's idle thread and enter
/// the idle loop. Does not return.
pub fn idle_loop() -> ! {
    let cpu = percpu::this_cpu();
    loop {
        crate::rcu::rcu_tick();
        preempt_checkpoint();

        // Drain any runnable work before sleeping.
        if runqueue_len(cpu.hart_id) > 0 {
            yield_now();
            continue;
        }
        crate::arch::wait_for_interrupt();
    }
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
    fn test_tiers_pop_in_priority_order() {
        let mut q = RunQueue::new();
        let lo = mk_thread("rq_lo");
        let hi = mk_thread("rq_hi");
        q.push_tail(lo.clone(), 3);
        q.push_tail(hi.clone(), 0);
        assert_eq!(q.len(), 2);
        assert!(Arc::ptr_eq(&q.pop_first().unwrap(), &hi));
        assert!(Arc::ptr_eq(&q.pop_first().unwrap(), &lo));
        assert!(q.pop_first().is_none());
    }

    #[test]
    fn test_wakeup_enqueues_ready_thread() {
        let t = mk_thread("rq_wake");
        t.sched.lock().cpu = 5;
        // Fresh kthreads are ready (interruptible) and queue on wakeup.
        assert!(wakeup(&t));
        assert_eq!(t.state(), ThreadState::Running);
        let popped = rq(5).lock().pop_first().unwrap();
        assert!(Arc::ptr_eq(&popped, &t));
        t.sched.lock().on_rq = false;
    }

    #[test]
    fn test_wakeup_running_sets_awoken() {
        let t = mk_thread("rq_awoken");
        t.sched.lock().make_running();
        assert!(wakeup(&t));
        assert!(t.take_awoken());
    }

    #[test]
    fn test_wakeup_ignores_stopped() {
        let t = mk_thread("rq_stopped");
        {
            let mut s = t.sched.lock();
            s.cpu = 6;
            s.make_stopped();
        }
        assert!(!wakeup(&t));
        assert_eq!(t.state(), ThreadState::Stopped);
        // Only the continue path resumes it.
        assert!(wake_stopped(&t));
        assert_eq!(t.state(), ThreadState::Running);
        let popped = rq(6).lock().pop_first().unwrap();
        assert!(Arc::ptr_eq(&popped, &t));
        t.sched.lock().on_rq = false;
    }
}
