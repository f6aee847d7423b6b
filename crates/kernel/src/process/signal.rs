//! Signal state and sending
//!
//! Dispositions, masks and pending queues. The sigacts spinlock is the
//! unified signal lock: every send and delivery takes it first, then the
//! short per-container pending locks nested inside. Wakeups and IPIs
//! happen only after the locks drop.

use alloc::sync::Arc;

use bitflags::bitflags;
use heapless::Deque;

use crate::lib::error::{Errno, Result};
use crate::process::group::ThreadGroup;
use crate::process::thread::{Thread, Tid};
use crate::sync::SpinLock;

/// Signal numbers (POSIX standard)
pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;

/// One past the largest signal number
pub const NSIG: u32 = 32;

/// Per-signal info queue cap; overflow drops the oldest record
pub const MAX_SIGINFO_PER_SIGNAL: usize = 8;

/// Sender recorded for kernel-originated signals
pub const SI_KERNEL: Tid = 0;

/// A validated signal number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal(u32);

impl Signal {
    pub fn new(signo: u32) -> Option<Self> {
        if signo >= 1 && signo < NSIG {
            Some(Self(signo))
        } else {
            None
        }
    }

    pub fn number(self) -> u32 {
        self.0
    }

    /// SIGKILL and SIGSTOP can never be caught, blocked or ignored.
    pub fn is_catchable(self) -> bool {
        !matches!(self.0, SIGKILL | SIGSTOP)
    }

    pub fn default_action(self) -> DefaultAction {
        match self.0 {
            SIGCHLD => DefaultAction::Ignore,
            SIGCONT => DefaultAction::Continue,
            SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
            _ => DefaultAction::Terminate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
    Continue,
}

/// A set of signals, bit `signo - 1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigSet(u64);

impl SigSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn single(signo: u32) -> Self {
        Self(1 << (signo - 1))
    }

    pub fn add(&mut self, signo: u32) {
        self.0 |= 1 << (signo - 1);
    }

    pub fn remove(&mut self, signo: u32) {
        self.0 &= !(1 << (signo - 1));
    }

    pub fn contains(self, signo: u32) -> bool {
        self.0 & (1 << (signo - 1)) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn subtract(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Lowest-numbered signal in the set
    pub fn first(self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() + 1)
        }
    }

    /// Strip the signals no mask may ever contain.
    pub fn strip_unblockable(self) -> Self {
        let mut s = self;
        s.remove(SIGKILL);
        s.remove(SIGSTOP);
        s
    }
}

/// Signals whose default action stops the thread
pub fn stop_sigset() -> SigSet {
    let mut s = SigSet::empty();
    s.add(SIGSTOP);
    s.add(SIGTSTP);
    s.add(SIGTTIN);
    s.add(SIGTTOU);
    s
}

/// Signals that resume a stopped thread
pub fn cont_sigset() -> SigSet {
    SigSet::single(SIGCONT)
}

/// Accompanying data for a queued signal instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: u32,
    pub code: i32,
    pub sender: Tid,
    pub value: usize,
}

impl SigInfo {
    pub fn user(signo: u32, sender: Tid) -> Self {
        Self {
            signo,
            code: 0,
            sender,
            value: 0,
        }
    }

    pub fn kernel(signo: u32) -> Self {
        Self {
            signo,
            code: 0x80,
            sender: SI_KERNEL,
            value: 0,
        }
    }
}

/// Pending signals: a bitmask plus bounded per-signal info queues.
/// The queues are fixed-capacity so senders in IRQ context never
/// allocate under the signal lock.
pub struct SigPending {
    set: SigSet,
    queues: [Deque<SigInfo, MAX_SIGINFO_PER_SIGNAL>; NSIG as usize],
}

impl SigPending {
    pub fn new() -> Self {
        Self {
            set: SigSet::empty(),
            queues: [const { Deque::new() }; NSIG as usize],
        }
    }

    pub fn set(&self) -> SigSet {
        self.set
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Mark a signal pending; queue its info when the disposition asked
    /// for it. The queue cap drops the oldest record.
    pub fn add(&mut self, sig: Signal, info: Option<SigInfo>) {
        let signo = sig.number();
        self.set.add(signo);
        if let Some(info) = info {
            let q = &mut self.queues[signo as usize];
            if q.is_full() {
                q.pop_front();
            }
            let _ = q.push_back(info);
        }
    }

    /// Dequeue one instance. The bit stays set while more queued records
    /// of the same signal remain.
    pub fn take(&mut self, signo: u32) -> Option<SigInfo> {
        if !self.set.contains(signo) {
            return None;
        }
        let q = &mut self.queues[signo as usize];
        let info = q.pop_front();
        if q.is_empty() {
            self.set.remove(signo);
        }
        info.or(Some(SigInfo::user(signo, SI_KERNEL)))
    }

    /// Discard every pending instance of the signals in `mask`.
    pub fn discard(&mut self, mask: SigSet) {
        self.set = self.set.subtract(mask);
        let mut bits = mask;
        while let Some(signo) = bits.first() {
            bits.remove(signo);
            self.queues[signo as usize].clear();
        }
    }

    pub fn queued(&self, signo: u32) -> usize {
        self.queues[signo as usize].len()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SaFlags: u32 {
        const SIGINFO = 1 << 0;
        const NODEFER = 1 << 1;
        const RESETHAND = 1 << 2;
        const ONSTACK = 1 << 3;
        const RESTART = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigHandler {
    Default,
    Ignore,
    User(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub handler: SigHandler,
    pub flags: SaFlags,
    pub mask: SigSet,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            handler: SigHandler::Default,
            flags: SaFlags::empty(),
            mask: SigSet::empty(),
        }
    }
}

/// Disposition table plus the four derived classifier masks, kept
/// consistent on every change.
pub struct SigActsInner {
    actions: [SigAction; NSIG as usize],
    pub sigterm: SigSet,
    pub sigstop: SigSet,
    pub sigcont: SigSet,
    pub sigignore: SigSet,
}

impl SigActsInner {
    fn new() -> Self {
        let mut inner = Self {
            actions: [SigAction::default(); NSIG as usize],
            sigterm: SigSet::empty(),
            sigstop: SigSet::empty(),
            sigcont: SigSet::empty(),
            sigignore: SigSet::empty(),
        };
        inner.recompute_all();
        inner
    }

    pub fn action(&self, signo: u32) -> SigAction {
        self.actions[signo as usize]
    }

    /// Change a disposition. Refused for SIGKILL/SIGSTOP.
    pub fn set_action(&mut self, sig: Signal, act: SigAction) -> Result<SigAction> {
        if !sig.is_catchable() {
            return Err(Errno::EINVAL);
        }
        let signo = sig.number();
        let old = self.actions[signo as usize];
        let mut act = act;
        act.mask = act.mask.strip_unblockable();
        self.actions[signo as usize] = act;
        self.reclassify(sig);
        Ok(old)
    }

    fn reclassify(&mut self, sig: Signal) {
        let signo = sig.number();
        self.sigterm.remove(signo);
        self.sigstop.remove(signo);
        self.sigcont.remove(signo);
        self.sigignore.remove(signo);

        match self.actions[signo as usize].handler {
            SigHandler::User(_) => {}
            SigHandler::Ignore => self.sigignore.add(signo),
            SigHandler::Default => match sig.default_action() {
                DefaultAction::Terminate => self.sigterm.add(signo),
                DefaultAction::Ignore => self.sigignore.add(signo),
                DefaultAction::Stop => self.sigstop.add(signo),
                DefaultAction::Continue => self.sigcont.add(signo),
            },
        }
    }

    fn recompute_all(&mut self) {
        for signo in 1..NSIG {
            self.reclassify(Signal(signo));
        }
    }
}

/// Shared signal dispositions; the embedded spinlock is the unified
/// signal lock for the whole thread group.
pub struct SigActs {
    pub lock: SpinLock<SigActsInner>,
}

impl SigActs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: SpinLock::new("sigacts", SigActsInner::new()),
        })
    }

    /// A private copy of the dispositions (fork without CLONE_SIGHAND).
    pub fn fork(&self) -> Arc<Self> {
        let src = self.lock.lock();
        let mut inner = SigActsInner::new();
        inner.actions = src.actions;
        drop(src);
        inner.recompute_all();
        Arc::new(Self {
            lock: SpinLock::new("sigacts", inner),
        })
    }
}

/// Per-thread signal state; nested under the sigacts lock.
pub struct ThreadSig {
    pub mask: SigSet,
    pub saved_mask: Option<SigSet>,
    pub pending: SigPending,
    /// Alternate stack for SA_ONSTACK handlers
    pub altstack_sp: usize,
    pub altstack_size: usize,
    /// Head of the in-flight signal-frame chain on the user stack
    pub frame_chain: usize,
}

/// Smallest usable alternate signal stack
pub const MINSIGSTKSZ: usize = 2048;

impl ThreadSig {
    pub fn new() -> Self {
        Self {
            mask: SigSet::empty(),
            saved_mask: None,
            pending: SigPending::new(),
            altstack_sp: 0,
            altstack_size: 0,
            frame_chain: 0,
        }
    }
}

/// Recompute the fast-path SIGPENDING flag from the real sets. Caller
/// holds the sigacts lock and both pending locks' containers.
pub fn recompute_sigpending(t: &Thread, tsig: &ThreadSig, group_pending: &SigPending) {
    let deliverable = tsig
        .pending
        .set()
        .union(group_pending.set())
        .subtract(tsig.mask);
    t.update_sigpending(!deliverable.is_empty());
}

/// Thread-directed send.
pub fn send_to_thread(t: &Arc<Thread>, sig: Signal, info: Option<SigInfo>) -> Result<()> {
    let signo = sig.number();
    let sigacts = t.sigacts.clone();
    let acts = sigacts.lock.lock();

    // Ignored dispositions drop the signal outright; SIGKILL/SIGSTOP
    // cannot be ignored and SIGCONT must still run its side effects.
    if acts.sigignore.contains(signo) && sig.is_catchable() && signo != SIGCONT {
        return Ok(());
    }

    let queue_info = acts.action(signo).flags.contains(SaFlags::SIGINFO);
    let is_term = acts.sigterm.contains(signo);
    let is_cont = acts.sigcont.contains(signo) || signo == SIGCONT;
    let is_stop = acts.sigstop.contains(signo);

    let masked;
    {
        let gp = t.group.pending.lock();
        let mut tsig = t.sig.lock();

        if is_cont {
            // Continue cancels pending stops even when already pending.
            tsig.pending.discard(stop_sigset());
        }
        if is_stop {
            tsig.pending.discard(cont_sigset());
        }

        tsig.pending.add(sig, if queue_info { info } else { None });
        masked = tsig.mask.contains(signo);
        recompute_sigpending(t, &tsig, &gp);
    }
    drop(acts);

    // Poke the target outside the signal lock.
    if !masked {
        if is_term || signo == SIGKILL {
            t.set_killed();
            crate::process::scheduler::wake_stopped(t);
        }
        if is_cont {
            crate::process::scheduler::wake_stopped(t);
        }
        crate::process::scheduler::wake_interruptible(t);
    }

    Ok(())
}

/// Group-directed send: pick one eligible recipient after recording the
/// signal in the shared pending state.
pub fn send_to_group(tg: &Arc<ThreadGroup>, sig: Signal, info: Option<SigInfo>) -> Result<()> {
    let signo = sig.number();
    let members = tg.members();
    let leader = tg.leader();
    let first = members.first().cloned().ok_or(Errno::ESRCH)?;

    // SIGKILL fans out to every member, bypassing the shared queue but
    // still recording the bit.
    if signo == SIGKILL {
        {
            let _acts = first.sigacts.lock.lock();
            let mut gp = tg.pending.lock();
            gp.add(sig, None);
        }
        for m in &members {
            let _ = send_to_thread(m, sig, None);
        }
        return Ok(());
    }

    let sigacts = first.sigacts.clone();
    let acts = sigacts.lock.lock();

    let is_cont = acts.sigcont.contains(signo) || signo == SIGCONT;
    let is_stop = acts.sigstop.contains(signo);
    let queue_info = acts.action(signo).flags.contains(SaFlags::SIGINFO);
    let ignored = acts.sigignore.contains(signo) && sig.is_catchable() && signo != SIGCONT;

    let mut stopped_members = alloc::vec::Vec::new();
    {
        let mut gp = tg.pending.lock();

        if is_cont {
            // Always run the continue side effects, even when SIGCONT is
            // already pending or ignored.
            gp.discard(stop_sigset());
            for m in &members {
                let mut tsig = m.sig.lock();
                tsig.pending.discard(stop_sigset());
                recompute_sigpending(m, &tsig, &gp);
                stopped_members.push(m.clone());
            }
        }
        if is_stop {
            gp.discard(cont_sigset());
            for m in &members {
                let mut tsig = m.sig.lock();
                tsig.pending.discard(cont_sigset());
                recompute_sigpending(m, &tsig, &gp);
            }
        }

        if !ignored {
            gp.add(sig, if queue_info { info } else { None });
        }
    }

    // Elect a recipient: the leader if it does not mask the signal, else
    // any member that does not.
    let recipient = if ignored {
        None
    } else {
        let unmasked = |m: &Arc<Thread>| !m.sig.lock().mask.contains(signo);
        match leader {
            Some(l) if unmasked(&l) => Some(l),
            _ => members.iter().find(|m| unmasked(m)).cloned(),
        }
    };

    if let Some(r) = &recipient {
        let gp = tg.pending.lock();
        let tsig = r.sig.lock();
        recompute_sigpending(r, &tsig, &gp);
    }
    drop(acts);

    for m in &stopped_members {
        crate::process::scheduler::wake_stopped(m);
    }
    if let Some(r) = &recipient {
        crate::process::scheduler::wake_interruptible(r);
    }

    Ok(())
}

/// kill(2): `pid` names a thread group.
pub fn kill(pid: Tid, signo: u32) -> Result<()> {
    let sig = Signal::new(signo).ok_or(Errno::EINVAL)?;
    let tg = crate::process::tid::lookup_group(pid).ok_or(Errno::ESRCH)?;
    let sender = crate::process::current_tid();
    send_to_group(&tg, sig, Some(SigInfo::user(signo, sender)))
}

/// tkill(2): directly signal one thread.
pub fn tkill(tid: Tid, signo: u32) -> Result<()> {
    let sig = Signal::new(signo).ok_or(Errno::EINVAL)?;
    let t = crate::process::tid::lookup(tid).ok_or(Errno::ESRCH)?;
    let sender = crate::process::current_tid();
    send_to_thread(&t, sig, Some(SigInfo::user(signo, sender)))
}

/// tgkill(2): signal a thread, checking its group membership.
pub fn tgkill(tgid: Tid, tid: Tid, signo: u32) -> Result<()> {
    let sig = Signal::new(signo).ok_or(Errno::EINVAL)?;
    let t = crate::process::tid::lookup(tid).ok_or(Errno::ESRCH)?;
    if t.group.tgid() != tgid {
        return Err(Errno::ESRCH);
    }
    let sender = crate::process::current_tid();
    send_to_thread(&t, sig, Some(SigInfo::user(signo, sender)))
}

/// Interrupt-context producers: sender recorded as the kernel.
pub fn kill_from_kernel(pid: Tid, signo: u32) -> Result<()> {
    let sig = Signal::new(signo).ok_or(Errno::EINVAL)?;
    let tg = crate::process::tid::lookup_group(pid).ok_or(Errno::ESRCH)?;
    send_to_group(&tg, sig, Some(SigInfo::kernel(signo)))
}

/// sigaction(2)
pub fn sigaction(signo: u32, act: Option<SigAction>, oldact: Option<&mut SigAction>) -> Result<()> {
    let sig = Signal::new(signo).ok_or(Errno::EINVAL)?;
    let cur = crate::process::current().ok_or(Errno::ESRCH)?;
    let sigacts = cur.sigacts.clone();
    let mut acts = sigacts.lock.lock();

    let old = acts.action(signo);
    if let Some(new) = act {
        acts.set_action(sig, new)?;

        // Newly-ignored dispositions flush matching pending instances.
        if acts.sigignore.contains(signo) {
            let mut gp = cur.group.pending.lock();
            let mut tsig = cur.sig.lock();
            tsig.pending.discard(SigSet::single(signo));
            gp.discard(SigSet::single(signo));
            recompute_sigpending(&cur, &tsig, &gp);
        }
    }
    if let Some(out) = oldact {
        *out = old;
    }
    Ok(())
}

/// sigprocmask(2) `how` values
pub const SIG_BLOCK: i32 = 0;
pub const SIG_UNBLOCK: i32 = 1;
pub const SIG_SETMASK: i32 = 2;

/// sigprocmask(2): adjust the calling thread's mask. SIGKILL/SIGSTOP are
/// silently stripped from every blocking request.
pub fn sigprocmask(how: i32, set: Option<SigSet>, oldset: Option<&mut SigSet>) -> Result<()> {
    let cur = crate::process::current().ok_or(Errno::ESRCH)?;
    let sigacts = cur.sigacts.clone();
    let _acts = sigacts.lock.lock();
    let gp = cur.group.pending.lock();
    let mut tsig = cur.sig.lock();

    let old = tsig.mask;
    if let Some(set) = set {
        tsig.mask = match how {
            SIG_BLOCK => tsig.mask.union(set.strip_unblockable()),
            SIG_UNBLOCK => tsig.mask.subtract(set),
            SIG_SETMASK => set.strip_unblockable(),
            _ => return Err(Errno::EINVAL),
        };
        recompute_sigpending(&cur, &tsig, &gp);
    }
    if let Some(out) = oldset {
        *out = old;
    }
    Ok(())
}

/// sigaltstack(2): install (or clear, with `size` 0) the calling
/// thread's alternate signal stack for SA_ONSTACK handlers.
pub fn sigaltstack(sp: usize, size: usize) -> Result<()> {
    if size != 0 && (sp == 0 || size < MINSIGSTKSZ) {
        return Err(Errno::EINVAL);
    }
    let cur = crate::process::current().ok_or(Errno::ESRCH)?;
    let sigacts = cur.sigacts.clone();
    let _acts = sigacts.lock.lock();
    let mut tsig = cur.sig.lock();
    if tsig.frame_chain != 0 {
        // Swapping stacks under a live handler frame would corrupt it.
        return Err(Errno::EBUSY);
    }
    tsig.altstack_sp = sp;
    tsig.altstack_size = size;
    Ok(())
}

/// sigpending(2): signals pending while blocked.
pub fn sigpending() -> Result<SigSet> {
    let cur = crate::process::current().ok_or(Errno::ESRCH)?;
    let sigacts = cur.sigacts.clone();
    let _acts = sigacts.lock.lock();
    let gp = cur.group.pending.lock();
    let tsig = cur.sig.lock();
    Ok(tsig.pending.set().union(gp.set()).intersect(tsig.mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_masks_disjoint_and_complete() {
        let inner = SigActsInner::new();
        let all = inner
            .sigterm
            .union(inner.sigstop)
            .union(inner.sigcont)
            .union(inner.sigignore);
        // Pairwise disjoint.
        assert!(inner.sigterm.intersect(inner.sigstop).is_empty());
        assert!(inner.sigterm.intersect(inner.sigcont).is_empty());
        assert!(inner.sigterm.intersect(inner.sigignore).is_empty());
        assert!(inner.sigstop.intersect(inner.sigcont).is_empty());
        assert!(inner.sigstop.intersect(inner.sigignore).is_empty());
        assert!(inner.sigcont.intersect(inner.sigignore).is_empty());
        // All defaults covered.
        for signo in 1..NSIG {
            assert!(all.contains(signo), "signal {} unclassified", signo);
        }
    }

    #[test]
    fn test_classifier_follows_disposition_changes() {
        let mut inner = SigActsInner::new();
        assert!(inner.sigterm.contains(SIGTERM));

        inner
            .set_action(
                Signal::new(SIGTERM).unwrap(),
                SigAction {
                    handler: SigHandler::User(0x1000),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!inner.sigterm.contains(SIGTERM));

        inner
            .set_action(
                Signal::new(SIGTERM).unwrap(),
                SigAction {
                    handler: SigHandler::Ignore,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(inner.sigignore.contains(SIGTERM));

        inner
            .set_action(
                Signal::new(SIGTERM).unwrap(),
                SigAction::default(),
            )
            .unwrap();
        assert!(inner.sigterm.contains(SIGTERM));
    }

    #[test]
    fn test_kill_stop_dispositions_frozen() {
        let mut inner = SigActsInner::new();
        for signo in [SIGKILL, SIGSTOP] {
            let res = inner.set_action(
                Signal::new(signo).unwrap(),
                SigAction {
                    handler: SigHandler::Ignore,
                    ..Default::default()
                },
            );
            assert!(matches!(res, Err(Errno::EINVAL)));
        }
        assert!(!inner.sigignore.contains(SIGKILL));
        assert!(!inner.sigignore.contains(SIGSTOP));
    }

    #[test]
    fn test_mask_strips_kill_and_stop() {
        let mut m = SigSet::empty();
        m.add(SIGKILL);
        m.add(SIGSTOP);
        m.add(SIGUSR1);
        let stripped = m.strip_unblockable();
        assert!(!stripped.contains(SIGKILL));
        assert!(!stripped.contains(SIGSTOP));
        assert!(stripped.contains(SIGUSR1));
    }

    #[test]
    fn test_siginfo_queue_drops_oldest() {
        let mut p = SigPending::new();
        let sig = Signal::new(SIGUSR1).unwrap();
        for i in 0..(MAX_SIGINFO_PER_SIGNAL + 1) {
            p.add(sig, Some(SigInfo {
                signo: SIGUSR1,
                code: 0,
                sender: 1,
                value: i,
            }));
        }
        assert_eq!(p.queued(SIGUSR1), MAX_SIGINFO_PER_SIGNAL);
        // Record 0 was dropped; the head is record 1.
        assert_eq!(p.take(SIGUSR1).unwrap().value, 1);

        // Each further overflow drops the then-oldest in turn.
        p.add(sig, Some(SigInfo { signo: SIGUSR1, code: 0, sender: 1, value: 100 }));
        p.add(sig, Some(SigInfo { signo: SIGUSR1, code: 0, sender: 1, value: 101 }));
        assert_eq!(p.take(SIGUSR1).unwrap().value, 3);
    }

    #[test]
    fn test_pending_bit_clears_with_queue() {
        let mut p = SigPending::new();
        let sig = Signal::new(SIGUSR2).unwrap();
        p.add(sig, Some(SigInfo::user(SIGUSR2, 1)));
        p.add(sig, Some(SigInfo::user(SIGUSR2, 2)));
        assert!(p.set().contains(SIGUSR2));
        assert!(p.take(SIGUSR2).is_some());
        assert!(p.set().contains(SIGUSR2));
        assert!(p.take(SIGUSR2).is_some());
        assert!(!p.set().contains(SIGUSR2));
        assert!(p.take(SIGUSR2).is_none());
    }

    #[test]
    fn test_fifo_per_signal_queue() {
        let mut p = SigPending::new();
        let sig = Signal::new(SIGINT).unwrap();
        p.add(sig, Some(SigInfo::user(SIGINT, 10)));
        p.add(sig, Some(SigInfo::user(SIGINT, 11)));
        assert_eq!(p.take(SIGINT).unwrap().sender, 10);
        assert_eq!(p.take(SIGINT).unwrap().sender, 11);
    }

    #[test]
    fn test_discard_clears_bits_and_queues() {
        let mut p = SigPending::new();
        p.add(Signal::new(SIGTSTP).unwrap(), Some(SigInfo::user(SIGTSTP, 1)));
        p.add(Signal::new(SIGSTOP).unwrap(), None);
        p.add(Signal::new(SIGUSR1).unwrap(), None);
        p.discard(stop_sigset());
        assert!(!p.set().contains(SIGTSTP));
        assert!(!p.set().contains(SIGSTOP));
        assert_eq!(p.queued(SIGTSTP), 0);
        assert!(p.set().contains(SIGUSR1));
    }

    #[test]
    fn test_sigset_first_is_lowest() {
        let mut s = SigSet::empty();
        s.add(SIGTERM);
        s.add(SIGINT);
        assert_eq!(s.first(), Some(SIGINT));
    }

    use crate::process::group::ThreadGroup;
    use crate::process::thread::{Thread, ThreadFlags};

    fn mk_target(name: &str) -> (Arc<Thread>, Arc<ThreadGroup>) {
        let tg = ThreadGroup::new();
        let t = Thread::new_kthread(
            name,
            |_, _| {},
            0,
            0,
            crate::process::thread::DEFAULT_STACK_ORDER,
            tg.clone(),
            SigActs::new(),
        )
        .unwrap();
        // Park wakes on an offline hart so the send paths cannot disturb
        // live run queues.
        t.sched.lock().cpu = 7;
        tg.add_member(&t);
        (t, tg)
    }

    #[test]
    fn test_send_marks_pending_and_flag() {
        let (t, _tg) = mk_target("sig_send");
        send_to_thread(&t, Signal::new(SIGHUP).unwrap(), None).unwrap();
        // SIGHUP defaults to terminate: the kill mark is set eagerly.
        assert!(t.sig.lock().pending.set().contains(SIGHUP));
        assert!(t.test_flag(ThreadFlags::SIGPENDING));
        assert!(t.is_killed());
    }

    #[test]
    fn test_ignored_disposition_drops_send() {
        let (t, _tg) = mk_target("sig_ign");
        // SIGCHLD defaults to ignore.
        send_to_thread(&t, Signal::new(SIGCHLD).unwrap(), None).unwrap();
        assert!(!t.sig.lock().pending.set().contains(SIGCHLD));
        assert!(!t.test_flag(ThreadFlags::SIGPENDING));
    }

    #[test]
    fn test_cont_cancels_stop_even_when_already_pending() {
        let (t, tg) = mk_target("sig_cont");

        // Pend a stop, then send continue twice; the side effects must
        // fire both times and the stop bits stay clear.
        send_to_group(&tg, Signal::new(SIGSTOP).unwrap(), None).unwrap();
        assert!(tg.pending.lock().set().contains(SIGSTOP));

        send_to_group(&tg, Signal::new(SIGCONT).unwrap(), None).unwrap();
        assert!(!tg.pending.lock().set().contains(SIGSTOP));

        send_to_group(&tg, Signal::new(SIGCONT).unwrap(), None).unwrap();
        send_to_group(&tg, Signal::new(SIGSTOP).unwrap(), None).unwrap();
        // The later stop cancelled the pending continue, and vice versa
        // earlier; the thread-side stop bits are clear as well.
        assert!(!tg.pending.lock().set().contains(SIGCONT));
        assert!(tg.pending.lock().set().contains(SIGSTOP));
        assert!(!t.sig.lock().pending.set().contains(SIGCONT));
    }

    #[test]
    fn test_group_kill_fans_out() {
        let (t, tg) = mk_target("sig_kill");
        send_to_group(&tg, Signal::new(SIGKILL).unwrap(), None).unwrap();
        // Recorded in the shared set and marked on every member.
        assert!(tg.pending.lock().set().contains(SIGKILL));
        assert!(t.is_killed());
        assert!(t.sig.lock().pending.set().contains(SIGKILL));
    }

    #[test]
    fn test_masked_send_sets_no_fast_flag() {
        let (t, _tg) = mk_target("sig_masked");
        {
            let mut tsig = t.sig.lock();
            tsig.mask.add(SIGUSR1);
        }
        // Install a handler so the send is not classified as terminating.
        {
            let sigacts = t.sigacts.clone();
            let mut acts = sigacts.lock.lock();
            acts.set_action(
                Signal::new(SIGUSR1).unwrap(),
                SigAction {
                    handler: SigHandler::User(0x1000),
                    ..Default::default()
                },
            )
            .unwrap();
        }
        send_to_thread(&t, Signal::new(SIGUSR1).unwrap(), None).unwrap();
        assert!(t.sig.lock().pending.set().contains(SIGUSR1));
        // Masked: pending but not deliverable.
        assert!(!t.test_flag(ThreadFlags::SIGPENDING));
        assert!(!t.is_killed());
    }
}
