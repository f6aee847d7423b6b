//! Signal delivery at the user-return checkpoint
//!
//! The victim thread runs this loop itself: termination marks `KILLED`
//! and exits, continue cancels stops, stop parks the thread, and anything
//! with a user handler gets a frame pushed on the user stack with a
//! trampoline return. Senders never touch the victim's registers.

use alloc::sync::Arc;

use crate::arch::TrapFrame;
use crate::lib::error::{Errno, Result};
use crate::process::signal::{
    cont_sigset, recompute_sigpending, stop_sigset, SaFlags, SigAction, SigHandler, SigInfo,
    SigSet, MINSIGSTKSZ,
};
use crate::process::thread::Thread;
use crate::sync::SleepKind;

/// User-mapped return stub; the process loader maps the real code there.
pub const SIGRETURN_TRAMPOLINE: usize = 0x0000_003f_ffff_f000;

/// Machine context saved across a handler invocation
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UContext {
    /// Previous frame in the chain (0 at the outermost handler)
    pub link: usize,
    /// Mask to restore at sigreturn
    pub mask: u64,
    pub frame: TrapFrame,
}

/// What delivery pushes on the user stack
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SignalFrame {
    pub info: SigInfo,
    pub uc: UContext,
}

enum Decision {
    Quiet,
    Killed(u32),
    Stop(u32),
    Deliver(u32, SigAction, SigInfo),
}

/// One pass over the pending sets under the signal lock.
fn next_decision(cur: &Arc<Thread>) -> Decision {
    let sigacts = cur.sigacts.clone();
    let mut acts = sigacts.lock.lock();
    let mut gp = cur.group.pending.lock();
    let mut tsig = cur.sig.lock();

    loop {
        let pending = tsig.pending.set().union(gp.set()).subtract(tsig.mask);
        if pending.is_empty() {
            recompute_sigpending(cur, &tsig, &gp);
            return Decision::Quiet;
        }

        // Termination wins over everything else.
        let term = pending.intersect(acts.sigterm);
        if let Some(signo) = term.first() {
            recompute_sigpending(cur, &tsig, &gp);
            return Decision::Killed(signo);
        }

        // A pending continue cancels stops. Without a user handler it is
        // consumed right here; with one it goes on to handler delivery.
        let mut chosen = None;
        let cont = pending.intersect(cont_sigset());
        if let Some(signo) = cont.first() {
            tsig.pending.discard(stop_sigset());
            gp.discard(stop_sigset());
            if matches!(acts.action(signo).handler, SigHandler::User(_)) {
                chosen = Some(signo);
            } else {
                tsig.pending.discard(cont_sigset());
                gp.discard(cont_sigset());
                continue;
            }
        }

        if chosen.is_none() {
            let stop = pending.intersect(acts.sigstop);
            if let Some(signo) = stop.first() {
                tsig.pending.discard(SigSet::single(signo));
                gp.discard(SigSet::single(signo));
                recompute_sigpending(cur, &tsig, &gp);
                return Decision::Stop(signo);
            }
        }

        let signo = match chosen.or_else(|| pending.first()) {
            Some(s) => s,
            None => continue,
        };
        let act = acts.action(signo);

        // Dequeue from the per-thread queue first, else the shared one.
        let info = tsig
            .pending
            .take(signo)
            .or_else(|| gp.take(signo))
            .unwrap_or(SigInfo::user(signo, crate::process::signal::SI_KERNEL));

        match act.handler {
            SigHandler::Ignore | SigHandler::Default => {
                // Stale instance from before a disposition change.
                continue;
            }
            SigHandler::User(_) => {
                // Block further instances per the handler mask.
                let restore = tsig.saved_mask.take().unwrap_or(tsig.mask);
                let mut blocked = tsig.mask.union(act.mask);
                if !act.flags.contains(SaFlags::NODEFER) {
                    blocked.add(signo);
                }
                tsig.mask = blocked.strip_unblockable();

                if act.flags.contains(SaFlags::RESETHAND) {
                    if let Some(sig) = crate::process::signal::Signal::new(signo) {
                        let _ = acts.set_action(sig, SigAction::default());
                    }
                }

                recompute_sigpending(cur, &tsig, &gp);
                return Decision::Deliver(
                    signo,
                    SigAction {
                        mask: restore,
                        ..act
                    },
                    info,
                );
            }
        }
    }
}

/// Deliver every actionable pending signal. Runs with no locks held, on
/// the thread's own stack, just before returning to user mode.
pub fn deliver_pending(tf: &mut TrapFrame) {
    let cur = match crate::process::current() {
        Some(c) => c,
        None => return,
    };

    // Fast path: flag says "maybe"; the loop rechecks under the lock.
    if !cur.signal_pending() && cur.group.pending.lock().is_empty() {
        return;
    }

    loop {
        match next_decision(&cur) {
            Decision::Quiet => break,
            Decision::Killed(signo) => {
                cur.set_killed();
                cur.exit_code
                    .store(128 + signo as i32, core::sync::atomic::Ordering::Relaxed);
                break;
            }
            Decision::Stop(_signo) => {
                {
                    let mut s = cur.sched.lock();
                    s.make_stopped();
                }
                crate::process::scheduler::yield_now();
                // Re-enter the loop once continued.
            }
            Decision::Deliver(signo, act, info) => {
                if let SigHandler::User(handler) = act.handler {
                    if setup_frame(&cur, tf, signo, handler, &act, info).is_err() {
                        // Unwritable stack: the default action for a
                        // failed delivery is termination.
                        cur.set_killed();
                        cur.exit_code
                            .store(128 + signo as i32, core::sync::atomic::Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
    }

    if cur.is_killed() {
        let code = cur.exit_code.load(core::sync::atomic::Ordering::Relaxed);
        crate::process::exit(code);
    }
}

/// Push a `SignalFrame` on the user stack and point the trap frame at
/// the handler, returning through the trampoline.
fn setup_frame(
    cur: &Arc<Thread>,
    tf: &mut TrapFrame,
    signo: u32,
    handler: usize,
    act: &SigAction,
    info: SigInfo,
) -> Result<()> {
    let frame_size = core::mem::size_of::<SignalFrame>();

    let (chain, alt_sp, alt_size) = {
        let tsig = cur.sig.lock();
        (tsig.frame_chain, tsig.altstack_sp, tsig.altstack_size)
    };

    // SA_ONSTACK switches to the alternate stack when one is installed,
    // large enough, and not already in use.
    let on_alt_now = alt_sp != 0 && tf.sp >= alt_sp && tf.sp < alt_sp + alt_size;
    let base = if act.flags.contains(SaFlags::ONSTACK)
        && alt_sp != 0
        && alt_size >= MINSIGSTKSZ
        && !on_alt_now
    {
        alt_sp + alt_size
    } else {
        tf.sp
    };

    let sp = match base.checked_sub(frame_size) {
        Some(sp) => sp & !0xf,
        None => return Err(Errno::EINVAL),
    };

    let frame = SignalFrame {
        info,
        uc: UContext {
            link: chain,
            mask: act.mask.bits(),
            frame: *tf,
        },
    };

    let bytes = unsafe {
        core::slice::from_raw_parts(&frame as *const SignalFrame as *const u8, frame_size)
    };
    unsafe { crate::arch::copy_to_user(sp, bytes)? };

    {
        let mut tsig = cur.sig.lock();
        tsig.frame_chain = sp;
    }

    tf.sp = sp;
    tf.sepc = handler;
    tf.ra = SIGRETURN_TRAMPOLINE;
    tf.a0 = signo as usize;
    tf.a1 = sp + core::mem::offset_of!(SignalFrame, info);
    tf.a2 = sp + core::mem::offset_of!(SignalFrame, uc);
    Ok(())
}

/// sigreturn(2): restore the context and mask saved at delivery and
/// rewind the frame chain.
pub fn sigreturn(tf: &mut TrapFrame) -> Result<isize> {
    let cur = crate::process::current().ok_or(Errno::ESRCH)?;

    let frame_addr = {
        let tsig = cur.sig.lock();
        tsig.frame_chain
    };
    if frame_addr == 0 {
        return Err(Errno::EINVAL);
    }

    let mut frame = SignalFrame {
        info: SigInfo::user(0, 0),
        uc: UContext {
            link: 0,
            mask: 0,
            frame: TrapFrame::zeroed(),
        },
    };
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(
            &mut frame as *mut SignalFrame as *mut u8,
            core::mem::size_of::<SignalFrame>(),
        )
    };
    unsafe { crate::arch::copy_from_user(bytes, frame_addr)? };

    *tf = frame.uc.frame;
    // A forged frame must not hand out supervisor mode.
    tf.sstatus &= !crate::arch::SSTATUS_SPP;

    {
        let sigacts = cur.sigacts.clone();
        let _acts = sigacts.lock.lock();
        let gp = cur.group.pending.lock();
        let mut tsig = cur.sig.lock();
        tsig.mask = SigSet::from_bits(frame.uc.mask).strip_unblockable();
        tsig.frame_chain = frame.uc.link;
        recompute_sigpending(&cur, &tsig, &gp);
    }

    Ok(0)
}

/// sigsuspend(2): install a temporary mask and sleep until a signal is
/// deliverable. The original mask comes back only through the handler's
/// sigreturn.
pub fn sigsuspend(mask: SigSet) -> Errno {
    let cur = match crate::process::current() {
        Some(c) => c,
        None => return Errno::ESRCH,
    };

    {
        let sigacts = cur.sigacts.clone();
        let _acts = sigacts.lock.lock();
        let gp = cur.group.pending.lock();
        let mut tsig = cur.sig.lock();
        tsig.saved_mask = Some(tsig.mask);
        tsig.mask = mask.strip_unblockable();
        recompute_sigpending(&cur, &tsig, &gp);
    }

    while !cur.signal_pending() {
        if cur.prepare_sleep(SleepKind::Interruptible)
            == crate::process::thread::SleepDecision::Sleep
        {
            crate::process::scheduler::yield_now();
        }
    }

    Errno::EINTR
}

/// pause(2): sleep until any signal arrives.
pub fn pause() -> Errno {
    let cur = match crate::process::current() {
        Some(c) => c,
        None => return Errno::ESRCH,
    };
    while !cur.signal_pending() {
        if cur.prepare_sleep(SleepKind::Interruptible)
            == crate::process::thread::SleepDecision::Sleep
        {
            crate::process::scheduler::yield_now();
        }
    }
    Errno::EINTR
}

/// sigwait(2): temporarily unblock `set`, sleep until one of its signals
/// is pending, and consume it without running a handler.
pub fn sigwait(set: SigSet) -> Result<u32> {
    let cur = crate::process::current().ok_or(Errno::ESRCH)?;
    let set = {
        let mut s = set;
        s.remove(crate::process::signal::SIGKILL);
        s.remove(crate::process::signal::SIGSTOP);
        s
    };
    if set.is_empty() {
        return Err(Errno::EINVAL);
    }

    let sigacts = cur.sigacts.clone();

    // Unblock the wait set so senders mark SIGPENDING and poke us.
    let old_mask = {
        let _acts = sigacts.lock.lock();
        let gp = cur.group.pending.lock();
        let mut tsig = cur.sig.lock();
        let old = tsig.mask;
        tsig.mask = tsig.mask.subtract(set);
        recompute_sigpending(&cur, &tsig, &gp);
        old
    };

    loop {
        // Synchronous dequeue of the first matching pending signal.
        {
            let _acts = sigacts.lock.lock();
            let mut gp = cur.group.pending.lock();
            let mut tsig = cur.sig.lock();
            let matching = tsig.pending.set().union(gp.set()).intersect(set);
            if let Some(signo) = matching.first() {
                let _ = tsig.pending.take(signo).or_else(|| gp.take(signo));
                tsig.mask = old_mask;
                recompute_sigpending(&cur, &tsig, &gp);
                return Ok(signo);
            }
        }

        if cur.is_killed() {
            let _acts = sigacts.lock.lock();
            let gp = cur.group.pending.lock();
            let mut tsig = cur.sig.lock();
            tsig.mask = old_mask;
            recompute_sigpending(&cur, &tsig, &gp);
            return Err(Errno::EINTR);
        }

        if cur.prepare_sleep(SleepKind::Interruptible)
            == crate::process::thread::SleepDecision::Sleep
        {
            crate::process::scheduler::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout_round_trip() {
        // The frame written at delivery must read back identically; the
        // chain link and mask live at fixed offsets consumed by user code.
        let tf = TrapFrame::zeroed();
        let frame = SignalFrame {
            info: SigInfo::user(7, 42),
            uc: UContext {
                link: 0xdead0,
                mask: 0xff,
                frame: tf,
            },
        };
        let size = core::mem::size_of::<SignalFrame>();
        let bytes = unsafe {
            core::slice::from_raw_parts(&frame as *const SignalFrame as *const u8, size)
        };
        let mut copy = SignalFrame {
            info: SigInfo::user(0, 0),
            uc: UContext {
                link: 0,
                mask: 0,
                frame: TrapFrame::zeroed(),
            },
        };
        let out = unsafe {
            core::slice::from_raw_parts_mut(&mut copy as *mut SignalFrame as *mut u8, size)
        };
        out.copy_from_slice(bytes);
        assert_eq!(copy.info.signo, 7);
        assert_eq!(copy.uc.link, 0xdead0);
        assert_eq!(copy.uc.mask, 0xff);
    }

    #[test]
    fn test_trampoline_is_user_addressable() {
        // Sv39 user half.
        assert!(SIGRETURN_TRAMPOLINE < 1 << 38);
        assert_eq!(SIGRETURN_TRAMPOLINE % 4096, 0);
    }

    use crate::process::group::ThreadGroup;
    use crate::process::signal::{
        Signal, SigActs, SIGCONT, SIGTERM, SIGTSTP, SIGUSR1,
    };

    fn mk_victim(name: &str) -> Arc<Thread> {
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
        t.sched.lock().cpu = 7;
        tg.add_member(&t);
        t
    }

    fn pend(t: &Arc<Thread>, signo: u32) {
        t.sig
            .lock()
            .pending
            .add(Signal::new(signo).unwrap(), None);
    }

    fn install_handler(t: &Arc<Thread>, signo: u32, flags: SaFlags, mask: SigSet) {
        let sigacts = t.sigacts.clone();
        let mut acts = sigacts.lock.lock();
        acts.set_action(
            Signal::new(signo).unwrap(),
            SigAction {
                handler: SigHandler::User(0x4000),
                flags,
                mask,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_termination_wins_over_handlers() {
        let t = mk_victim("dlv_term");
        install_handler(&t, SIGUSR1, SaFlags::empty(), SigSet::empty());
        pend(&t, SIGUSR1);
        pend(&t, SIGTERM);
        assert!(matches!(next_decision(&t), Decision::Killed(SIGTERM)));
    }

    #[test]
    fn test_stop_is_consumed_once() {
        let t = mk_victim("dlv_stop");
        pend(&t, SIGTSTP);
        assert!(matches!(next_decision(&t), Decision::Stop(SIGTSTP)));
        // The bit was cleared on the way out.
        assert!(matches!(next_decision(&t), Decision::Quiet));
    }

    #[test]
    fn test_cont_cancels_pending_stop_quietly() {
        let t = mk_victim("dlv_cont");
        pend(&t, SIGTSTP);
        pend(&t, SIGCONT);
        // No handler on SIGCONT: both the stop and the continue dissolve.
        assert!(matches!(next_decision(&t), Decision::Quiet));
        assert!(!t.sig.lock().pending.set().contains(SIGTSTP));
        assert!(!t.sig.lock().pending.set().contains(SIGCONT));
    }

    #[test]
    fn test_handler_delivery_blocks_further_instances() {
        let t = mk_victim("dlv_block");
        let mut extra = SigSet::empty();
        extra.add(SIGTERM);
        install_handler(&t, SIGUSR1, SaFlags::empty(), extra);
        pend(&t, SIGUSR1);

        match next_decision(&t) {
            Decision::Deliver(signo, _act, info) => {
                assert_eq!(signo, SIGUSR1);
                assert_eq!(info.signo, SIGUSR1);
            }
            _ => panic!("expected handler delivery"),
        }

        // The handler mask plus the signal itself are now blocked.
        let mask = t.sig.lock().mask;
        assert!(mask.contains(SIGUSR1));
        assert!(mask.contains(SIGTERM));

        // A second instance stays pending until the mask clears.
        pend(&t, SIGUSR1);
        assert!(matches!(next_decision(&t), Decision::Quiet));
        t.sig.lock().mask = SigSet::empty();
        assert!(matches!(
            next_decision(&t),
            Decision::Deliver(SIGUSR1, _, _)
        ));
    }

    #[test]
    fn test_resethand_restores_default() {
        let t = mk_victim("dlv_reset");
        install_handler(&t, SIGUSR1, SaFlags::RESETHAND | SaFlags::NODEFER, SigSet::empty());
        pend(&t, SIGUSR1);
        assert!(matches!(
            next_decision(&t),
            Decision::Deliver(SIGUSR1, _, _)
        ));
        // Disposition snapped back to default-terminate; the next
        // instance kills.
        pend(&t, SIGUSR1);
        assert!(matches!(next_decision(&t), Decision::Killed(SIGUSR1)));
    }

    #[test]
    fn test_frame_pushed_onto_stack() {
        let t = mk_victim("dlv_frame");
        let stack = alloc::vec![0u8; 4096];
        let top = stack.as_ptr() as usize + stack.len();

        let mut tf = TrapFrame::zeroed();
        tf.sp = top;

        let mut restore = SigSet::empty();
        restore.add(SIGTERM);
        let act = SigAction {
            handler: SigHandler::User(0x4000),
            flags: SaFlags::empty(),
            mask: restore,
        };

        setup_frame(&t, &mut tf, SIGUSR1, 0x4000, &act, SigInfo::user(SIGUSR1, 3)).unwrap();

        assert_eq!(tf.sepc, 0x4000);
        assert_eq!(tf.ra, SIGRETURN_TRAMPOLINE);
        assert_eq!(tf.a0, SIGUSR1 as usize);
        assert!(tf.sp < top && tf.sp % 16 == 0);
        assert_eq!(t.sig.lock().frame_chain, tf.sp);

        // The saved context on the stack carries the restore mask and the
        // interrupted frame (sp was still `top` when captured).
        let written = unsafe { &*(tf.sp as *const SignalFrame) };
        assert_eq!(written.uc.mask, restore.bits());
        assert_eq!(written.uc.frame.sp, top);
        assert_eq!(written.info.sender, 3);
    }
}
