//! Thread groups
//!
//! The process abstraction over threads: a TGID equal to the leader's
//! TID, a membership list with a live-thread count, a one-shot group
//! exit, and the shared pending state for process-directed signals.
//! Membership and the live count change only under `pid_lock`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::process::signal::SigPending;
use crate::process::thread::{Thread, Tid, NO_TID};
use crate::sync::SpinLock;

pub struct GroupInner {
    tgid: Tid,
    members: Vec<Arc<Thread>>,
    live_threads: usize,
    group_exit: bool,
    group_exit_code: i32,
}

pub struct ThreadGroup {
    inner: SpinLock<GroupInner>,
    /// Process-directed pending signals; nested under the sigacts lock.
    pub pending: SpinLock<SigPending>,
}

impl ThreadGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SpinLock::new(
                "thread_group",
                GroupInner {
                    tgid: NO_TID,
                    members: Vec::new(),
                    live_threads: 0,
                    group_exit: false,
                    group_exit_code: 0,
                },
            ),
            pending: SpinLock::new("group_pending", SigPending::new()),
        })
    }

    pub fn tgid(&self) -> Tid {
        self.inner.lock().tgid
    }

    /// Attach a member. The first member becomes the leader and donates
    /// its TID as the TGID. Caller holds `pid_lock`.
    pub fn add_member(&self, t: &Arc<Thread>) {
        let mut g = self.inner.lock();
        if g.members.is_empty() {
            g.tgid = t.tid();
        }
        g.members.push(t.clone());
        g.live_threads += 1;
    }

    /// A member stopped being live (became a zombie). Caller holds
    /// `pid_lock`. Returns the remaining live count.
    pub fn member_dead(&self) -> usize {
        let mut g = self.inner.lock();
        debug_assert!(g.live_threads > 0, "live count underflow");
        g.live_threads -= 1;
        g.live_threads
    }

    /// Detach a reaped member entirely. Caller holds `pid_lock`.
    pub fn remove_member(&self, tid: Tid) {
        let mut g = self.inner.lock();
        g.members.retain(|m| m.tid() != tid);
        if g.members.is_empty() {
            debug_assert!(
                self.pending.lock().is_empty(),
                "destroying group with queued signals"
            );
        }
    }

    pub fn live_threads(&self) -> usize {
        self.inner.lock().live_threads
    }

    pub fn members(&self) -> Vec<Arc<Thread>> {
        self.inner.lock().members.clone()
    }

    pub fn leader(&self) -> Option<Arc<Thread>> {
        let g = self.inner.lock();
        let tgid = g.tgid;
        g.members.iter().find(|m| m.tid() == tgid).cloned()
    }

    /// Arm the one-shot group exit. Returns false if it was already set.
    pub fn start_group_exit(&self, code: i32) -> bool {
        let mut g = self.inner.lock();
        if g.group_exit {
            return false;
        }
        g.group_exit = true;
        g.group_exit_code = code;
        true
    }

    pub fn group_exiting(&self) -> bool {
        self.inner.lock().group_exit
    }

    pub fn group_exit_code(&self) -> i32 {
        self.inner.lock().group_exit_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn test_leader_donates_tgid() {
        let tg = ThreadGroup::new();
        let a = mk_thread("tg_a");
        let b = mk_thread("tg_b");
        tg.add_member(&a);
        tg.add_member(&b);
        assert_eq!(tg.tgid(), a.tid());
        assert_eq!(tg.live_threads(), 2);
        assert_eq!(tg.leader().unwrap().tid(), a.tid());
    }

    #[test]
    fn test_live_count_tracks_deaths() {
        let tg = ThreadGroup::new();
        let a = mk_thread("tg_c");
        tg.add_member(&a);
        assert_eq!(tg.live_threads(), 1);
        assert_eq!(tg.member_dead(), 0);
        tg.remove_member(a.tid());
        assert!(tg.members().is_empty());
    }

    #[test]
    fn test_group_exit_is_one_shot() {
        let tg = ThreadGroup::new();
        assert!(tg.start_group_exit(9));
        assert!(!tg.start_group_exit(15));
        assert_eq!(tg.group_exit_code(), 9);
        assert!(tg.group_exiting());
    }
}
