//! Thread management

pub mod group;
pub mod reap;
pub mod scheduler;
pub mod sigdeliver;
pub mod signal;
pub mod thread;
pub mod tid;

use alloc::sync::Arc;

use crate::lib::error::Result;
use crate::smp::percpu;
use crate::sync::spinlock;

pub use thread::{Thread, ThreadFlags, ThreadState, Tid, NO_TID};

lazy_static::lazy_static! {
    /// Group and dispositions shared by every kernel thread.
    static ref KERNEL_GROUP: Arc<group::ThreadGroup> = group::ThreadGroup::new();
    static ref KERNEL_SIGACTS: Arc<signal::SigActs> = signal::SigActs::new();
}

/// The thread running on this hart, if the scheduler is up.
pub fn current() -> Option<Arc<Thread>> {
    spinlock::push_off();
    let cur = unsafe { percpu::this_cpu().current_slot() }.clone();
    spinlock::pop_off();
    cur
}

/// TID of the current thread; 0 in boot context.
pub fn current_tid() -> Tid {
    current().map(|t| t.tid()).unwrap_or(0)
}

/// Create a kernel thread. It sits ready until the first `wakeup`.
/// `stack_order` 0 selects the default kernel stack size.
pub fn create_kthread(
    name: &str,
    entry: fn(usize, usize),
    arg1: usize,
    arg2: usize,
    stack_order: usize,
) -> Result<Tid> {
    let order = if stack_order == 0 {
        thread::DEFAULT_STACK_ORDER
    } else {
        stack_order
    };
    let t = Thread::new_kthread(
        name,
        entry,
        arg1,
        arg2,
        order,
        KERNEL_GROUP.clone(),
        KERNEL_SIGACTS.clone(),
    )?;
    {
        let _pid = tid::PID_LOCK.lock();
        tid::insert(&t)?;
        KERNEL_GROUP.add_member(&t);
    }
    crate::debug!("PROC: created kthread '{}' tid {}", name, t.tid());
    Ok(t.tid())
}

/// Create and immediately wake a kernel thread, returning its TCB.
pub fn spawn_kthread(
    name: &str,
    entry: fn(usize, usize),
    arg1: usize,
    arg2: usize,
) -> Result<Arc<Thread>> {
    let tid = create_kthread(name, entry, arg1, arg2, 0)?;
    let t = tid::lookup(tid).expect("fresh kthread is published");
    scheduler::wakeup(&t);
    Ok(t)
}

/// Wake a thread by handle (kernel-facing API).
pub fn wakeup(t: &Arc<Thread>) -> bool {
    scheduler::wakeup(t)
}

/// Terminate the calling thread. Never returns.
pub fn exit(code: i32) -> ! {
    let cur = current().expect("exit without current thread");
    crate::debug!("PROC: tid {} exiting with code {}", cur.tid(), code);

    cur.exit_code
        .store(code, core::sync::atomic::Ordering::Release);

    // No preemption from here: a zombie never runs again, so the exit
    // notification below must happen before the final switch.
    crate::arch::intr_off();

    {
        let _pid = tid::PID_LOCK.lock();
        cur.group.member_dead();
        cur.sched.lock().make_zombie();
    }

    {
        let _gate = reap::EXIT_LOCK.lock();
    }
    reap::EXIT_WQ.wakeup_all(0, 0);

    drop(cur);
    scheduler::yield_now();
    unreachable!("zombie thread resumed");
}

/// Terminate the whole thread group: arm the one-shot group exit, kill
/// every other member, then exit the caller. Never returns.
pub fn exit_group(code: i32) -> ! {
    let cur = current().expect("exit_group without current thread");
    if cur.group.start_group_exit(code) {
        let kill = signal::Signal::new(signal::SIGKILL).expect("SIGKILL is valid");
        for m in cur.group.members() {
            if m.tid() != cur.tid() {
                let _ = signal::send_to_thread(&m, kill, None);
            }
        }
    }
    exit(cur.group.group_exit_code())
}

/// Adopt the calling context as this hart's idle thread and publish it.
/// Runs once per hart during bring-up.
pub fn init_hart() -> Result<()> {
    let hart = crate::arch::hart_id();
    let idle = Thread::adopt_idle(hart, KERNEL_GROUP.clone(), KERNEL_SIGACTS.clone())?;
    {
        let _pid = tid::PID_LOCK.lock();
        tid::insert(&idle)?;
        KERNEL_GROUP.add_member(&idle);
    }

    spinlock::push_off();
    let cpu = percpu::this_cpu();
    unsafe {
        *cpu.current_slot() = Some(idle.clone());
        *cpu.idle_slot() = Some(idle);
    }
    cpu.clear_flag(percpu::CpuFlags::BOOT);
    spinlock::pop_off();

    crate::info!("PROC: hart {} scheduler ready", hart);
    Ok(())
}
