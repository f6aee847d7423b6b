//! Work queues
//!
//! One manager thread per queue grows and shrinks a worker pool within
//! `[min_active, max_active]`. Pending work is a FIFO list; idle workers
//! park on a waitqueue and the manager can hand a work item straight to
//! one of them through the waiter's data slot.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::lib::error::{Errno, Result};
use crate::process::thread::{Thread, Tid};
use crate::sync::{SleepKind, SpinLock, WaitQueue};

/// Worker cap when `workqueue_create` is passed 0
pub const DEFAULT_WQ_ACTIVE: usize = 8;
/// Hard cap; larger requests are clamped
pub const MAX_WORKQUEUE_ACTIVE: usize = 16;

pub type WorkFunc = fn(usize);

/// One unit of deferred work. Caller-owned; belongs to at most one queue
/// at a time.
pub struct Work {
    func: WorkFunc,
    data: usize,
    queued: AtomicBool,
}

/// Caller-embedded initialization (the heap variant is
/// [`create_work_struct`]).
pub fn init_work_struct(work: &Work) {
    work.queued.store(false, Ordering::Release);
}

pub fn create_work_struct(func: WorkFunc, data: usize) -> Arc<Work> {
    Arc::new(Work {
        func,
        data,
        queued: AtomicBool::new(false),
    })
}

/// Drop the caller's reference to a work item. It must not be queued.
pub fn free_work_struct(work: Arc<Work>) -> Result<()> {
    if work.queued.load(Ordering::Acquire) {
        return Err(Errno::EBUSY);
    }
    drop(work);
    Ok(())
}

struct WqState {
    works: VecDeque<Arc<Work>>,
    active: bool,
    nr_workers: usize,
    min_active: usize,
    max_active: usize,
    manager: Option<Arc<Thread>>,
    workers: alloc::vec::Vec<Tid>,
}

pub struct WorkQueue {
    name: &'static str,
    state: SpinLock<WqState>,
    idle: WaitQueue,
}

impl WorkQueue {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pending(&self) -> usize {
        self.state.lock().works.len()
    }

    pub fn nr_workers(&self) -> usize {
        self.state.lock().nr_workers
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn max_active(&self) -> usize {
        self.state.lock().max_active
    }

    pub fn min_active(&self) -> usize {
        self.state.lock().min_active
    }
}

static SYSTEM_WQ: spin::Once<Arc<WorkQueue>> = spin::Once::new();

/// Create the kernel's default work queue. Called once at boot.
pub fn init_system_wq() -> Result<()> {
    let wq = workqueue_create("kevents", 0)?;
    SYSTEM_WQ.call_once(|| wq);
    Ok(())
}

/// The kernel's default work queue, once boot has created it.
pub fn system_wq() -> Option<&'static Arc<WorkQueue>> {
    SYSTEM_WQ.get()
}

/// Create a work queue and its manager thread. `max_active` 0 selects
/// the default cap; negative is an error; oversized requests clamp.
pub fn workqueue_create(name: &'static str, max_active: i32) -> Result<Arc<WorkQueue>> {
    let max_active = match max_active {
        n if n < 0 => return Err(Errno::EINVAL),
        0 => DEFAULT_WQ_ACTIVE,
        n => (n as usize).min(MAX_WORKQUEUE_ACTIVE),
    };

    let wq = Arc::new(WorkQueue {
        name,
        state: SpinLock::new(
            "workqueue",
            WqState {
                works: VecDeque::new(),
                active: true,
                nr_workers: 0,
                min_active: 1,
                max_active,
                manager: None,
                workers: alloc::vec::Vec::new(),
            },
        ),
        idle: WaitQueue::new(name),
    });

    let raw = Arc::into_raw(wq.clone()) as usize;
    let manager = crate::process::spawn_kthread(name, manager_entry, raw, 0).map_err(|e| {
        drop(unsafe { Arc::from_raw(raw as *const WorkQueue) });
        e
    })?;
    wq.state.lock().manager = Some(manager);

    crate::info!("WQ: created '{}' (max_active={})", name, max_active);
    Ok(wq)
}

/// Queue a work item. Refused when the queue is shut down or the item is
/// already queued somewhere.
pub fn queue_work(wq: &Arc<WorkQueue>, work: &Arc<Work>) -> bool {
    let manager = {
        let mut g = wq.state.lock();
        if !g.active {
            return false;
        }
        if work.queued.swap(true, Ordering::AcqRel) {
            return false;
        }
        g.works.push_back(work.clone());
        g.manager.clone()
    };

    if let Some(m) = manager {
        crate::process::scheduler::wakeup(&m);
    }
    true
}

/// Stop the queue: reject new work, let the pool drain and exit.
pub fn workqueue_destroy(wq: &Arc<WorkQueue>) {
    let manager = {
        let mut g = wq.state.lock();
        g.active = false;
        g.manager.clone()
    };
    wq.idle.wakeup_all(0, 0);
    if let Some(m) = manager {
        crate::process::scheduler::wakeup(&m);
    }
}

fn manager_entry(wq_raw: usize, _unused: usize) {
    let wq = unsafe { Arc::from_raw(wq_raw as *const WorkQueue) };
    let cur = crate::process::current().expect("manager has a thread");

    loop {
        let mut g = wq.state.lock();

        // Grow the pool: keep the floor, and add capacity while work is
        // outrunning the workers.
        while g.active
            && (g.nr_workers < g.min_active
                || (g.works.len() > g.nr_workers && g.nr_workers < g.max_active))
        {
            let raw = Arc::into_raw(wq.clone()) as usize;
            match crate::process::spawn_kthread(wq.name, worker_entry, raw, 0) {
                Ok(t) => {
                    g.nr_workers += 1;
                    g.workers.push(t.tid());
                }
                Err(e) => {
                    drop(unsafe { Arc::from_raw(raw as *const WorkQueue) });
                    crate::warn!("WQ: '{}' worker spawn failed ({:?})", wq.name, e);
                    break;
                }
            }
        }

        // Hand pending work directly to idle workers.
        while !wq.idle.is_empty() {
            let work = match g.works.pop_front() {
                Some(w) => w,
                None => break,
            };
            let raw = Arc::into_raw(work) as usize;
            if !wq.idle.wakeup_one(0, raw) {
                let work = unsafe { Arc::from_raw(raw as *const Work) };
                g.works.push_front(work);
                break;
            }
        }

        if !g.active {
            if g.nr_workers == 0 {
                drop(g);
                break;
            }
            drop(g);
            wq.idle.wakeup_all(0, 0);
            crate::process::scheduler::yield_now();
            continue;
        }

        // Sleep until queue_work pokes us again.
        let parked = cur.prepare_sleep(SleepKind::Interruptible);
        drop(g);
        if parked == crate::process::thread::SleepDecision::Sleep {
            crate::process::scheduler::yield_now();
        }
    }

    crate::info!("WQ: '{}' manager exiting", wq.name);
}

fn worker_entry(wq_raw: usize, _unused: usize) {
    let wq = unsafe { Arc::from_raw(wq_raw as *const WorkQueue) };

    loop {
        let mut g = wq.state.lock();

        if let Some(work) = g.works.pop_front() {
            drop(g);
            run_work(work);
            continue;
        }

        if !g.active {
            g.nr_workers -= 1;
            let me = crate::process::current_tid();
            g.workers.retain(|&t| t != me);
            drop(g);
            break;
        }

        // Park; the manager either hands us a work item through the data
        // slot or wakes us empty-handed to retry the pop.
        let (reacquired, res) = wq.idle.wait(g);
        g = reacquired;
        drop(g);
        if let Ok(data) = res {
            if data != 0 {
                let work = unsafe { Arc::from_raw(data as *const Work) };
                run_work(work);
            }
        }
    }
}

fn run_work(work: Arc<Work>) {
    // Cleared before the call so the function may re-queue its own work.
    work.queued.store(false, Ordering::Release);
    (work.func)(work.data);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_data: usize) {}

    #[test]
    fn test_create_clamps_and_defaults() {
        let wq = workqueue_create("wq_default", 0).unwrap();
        assert_eq!(wq.max_active(), DEFAULT_WQ_ACTIVE);
        assert_eq!(wq.min_active(), 1);

        let wq = workqueue_create("wq_big", (MAX_WORKQUEUE_ACTIVE + 50) as i32).unwrap();
        assert_eq!(wq.max_active(), MAX_WORKQUEUE_ACTIVE);

        assert!(matches!(
            workqueue_create("wq_neg", -1),
            Err(Errno::EINVAL)
        ));
    }

    #[test]
    fn test_queue_work_rules() {
        let wq = workqueue_create("wq_rules", 2).unwrap();
        let w = create_work_struct(nop, 0);

        assert!(queue_work(&wq, &w));
        // A work item belongs to at most one queue at a time.
        assert!(!queue_work(&wq, &w));
        assert_eq!(wq.pending(), 1);
        assert!(matches!(free_work_struct(w.clone()), Err(Errno::EBUSY)));

        workqueue_destroy(&wq);
        let w2 = create_work_struct(nop, 0);
        assert!(!queue_work(&wq, &w2));
        assert!(free_work_struct(w2).is_ok());
    }
}
