//! Zombie reaping
//!
//! A dead thread stays a zombie until a reaper collects its status; the
//! TCB itself outlives even that until the RCU grace period covering any
//! in-flight TID lookup has elapsed (the table retraction is deferred
//! through `call_rcu`).

use crate::lib::error::{Errno, Result};
use crate::process::thread::{ThreadState, Tid};
use crate::process::tid;
use crate::sync::{SpinLock, WaitQueue};

/// Bound lock for exit notifications: exits flip the state to zombie
/// before taking it, reapers hold it across the check-then-sleep.
pub(crate) static EXIT_LOCK: SpinLock<()> = SpinLock::new("exit_lock", ());
pub(crate) static EXIT_WQ: WaitQueue = WaitQueue::new("exit_wq");

/// Collect a dead thread: block until it is a zombie, return its exit
/// code and release its TID. Interruptible.
pub fn reap(target: Tid) -> Result<i32> {
    let t = tid::lookup(target).ok_or(Errno::ESRCH)?;

    let mut gate = EXIT_LOCK.lock();
    loop {
        if t.state() == ThreadState::Zombie {
            break;
        }
        let (reacquired, res) = EXIT_WQ.wait(gate);
        gate = reacquired;
        if let Err(e) = res {
            if e == Errno::EINTR {
                return Err(Errno::EINTR);
            }
        }
    }
    drop(gate);

    let code = t.exit_code.load(core::sync::atomic::Ordering::Acquire);

    {
        let _pid = tid::PID_LOCK.lock();
        // A concurrent reaper may have won the race for the same TID.
        match tid::remove(target) {
            Ok(()) => {}
            Err(_) => return Err(Errno::ESRCH),
        }
        t.sched.lock().make_unused();
        t.group.remove_member(target);
    }

    Ok(code)
}

/// Non-blocking probe: the exit code if the thread is already a zombie.
pub fn try_reap(target: Tid) -> Result<Option<i32>> {
    let t = tid::lookup(target).ok_or(Errno::ESRCH)?;
    if t.state() != ThreadState::Zombie {
        return Ok(None);
    }
    let code = t.exit_code.load(core::sync::atomic::Ordering::Acquire);
    {
        let _pid = tid::PID_LOCK.lock();
        if tid::remove(target).is_err() {
            return Err(Errno::ESRCH);
        }
        t.sched.lock().make_unused();
        t.group.remove_member(target);
    }
    Ok(Some(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::group::ThreadGroup;
    use crate::process::signal::SigActs;
    use crate::process::thread::Thread;

    #[test]
    fn test_try_reap_waits_for_zombie() {
        let tg = ThreadGroup::new();
        let t = Thread::new_kthread(
            "reap_t",
            |_, _| {},
            0,
            0,
            crate::process::thread::DEFAULT_STACK_ORDER,
            tg.clone(),
            SigActs::new(),
        )
        .unwrap();
        tg.add_member(&t);
        {
            let _pid = tid::PID_LOCK.lock();
            tid::insert(&t).unwrap();
        }

        assert_eq!(try_reap(t.tid()), Ok(None));
        assert_eq!(try_reap(t.tid() + 7777), Err(Errno::ESRCH));

        t.exit_code.store(5, core::sync::atomic::Ordering::Release);
        {
            let mut s = t.sched.lock();
            s.make_running();
            s.make_zombie();
        }
        assert_eq!(try_reap(t.tid()), Ok(Some(5)));
        // Gone from the table; a second reap finds nothing.
        assert_eq!(try_reap(t.tid()), Err(Errno::ESRCH));
        assert!(tg.members().is_empty());
    }
}
