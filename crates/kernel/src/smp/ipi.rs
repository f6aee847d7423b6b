//! Inter-processor interrupts
//!
//! Senders OR a reason bit into the target hart's pending mask and raise
//! a software interrupt through the firmware. Coalescing is intentional:
//! two RESCHEDULE requests that arrive before the receiver drains collapse
//! into one handler pass. CALL_FUNC would need a queue and is reserved.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use super::MAX_HARTS;

bitflags! {
    /// Pending IPI reasons, one bit each
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpiReason: u32 {
        /// Another hart panicked; print state and halt
        const CRASH = 1 << 0;
        /// Remote function call (reserved, needs a message queue)
        const CALL_FUNC = 1 << 1;
        /// Reach a scheduling checkpoint
        const RESCHEDULE = 1 << 2;
        /// TLB shootdown (no-op: user return flushes)
        const TLB_FLUSH = 1 << 3;
        /// Generic wakeup
        const GENERIC = 1 << 4;
    }
}

/// Per-hart pending reason masks
static PENDING: [AtomicU32; MAX_HARTS] = [
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
];

/// IPI receive counters for a single hart
pub struct IpiStats {
    pub crash: AtomicU64,
    pub reschedule: AtomicU64,
    pub tlb_flush: AtomicU64,
    pub generic: AtomicU64,
}

impl IpiStats {
    const fn new() -> Self {
        Self {
            crash: AtomicU64::new(0),
            reschedule: AtomicU64::new(0),
            tlb_flush: AtomicU64::new(0),
            generic: AtomicU64::new(0),
        }
    }

    fn inc(&self, reason: IpiReason) {
        if reason == IpiReason::CRASH {
            self.crash.fetch_add(1, Ordering::Relaxed);
        } else if reason == IpiReason::RESCHEDULE {
            self.reschedule.fetch_add(1, Ordering::Relaxed);
        } else if reason == IpiReason::TLB_FLUSH {
            self.tlb_flush.fetch_add(1, Ordering::Relaxed);
        } else {
            self.generic.fetch_add(1, Ordering::Relaxed);
        }
    }
}

static IPI_STATS: [IpiStats; MAX_HARTS] = [
    IpiStats::new(),
    IpiStats::new(),
    IpiStats::new(),
    IpiStats::new(),
    IpiStats::new(),
    IpiStats::new(),
    IpiStats::new(),
    IpiStats::new(),
];

/// Post a reason without raising the software interrupt. Used by the
/// crash path after the firmware may already be unreliable, and by tests.
pub fn post_reason(target: usize, reason: IpiReason) {
    if target >= MAX_HARTS {
        return;
    }
    PENDING[target].fetch_or(reason.bits(), Ordering::AcqRel);
}

/// Send an IPI to one hart
pub fn send_single(target: usize, reason: IpiReason) {
    if target >= MAX_HARTS {
        crate::warn!("IPI: invalid target hart {}", target);
        return;
    }
    if !super::is_hart_online(target) {
        return;
    }
    post_reason(target, reason);
    crate::arch::sbi::send_ipi(1usize << target, 0);
}

/// Send an IPI to every hart whose bit is set in `mask`
pub fn send_mask(mask: usize, reason: IpiReason) {
    let mut fire = 0usize;
    for hart in 0..MAX_HARTS {
        if mask & (1 << hart) == 0 {
            continue;
        }
        if !super::is_hart_online(hart) {
            continue;
        }
        post_reason(hart, reason);
        fire |= 1 << hart;
    }
    if fire != 0 {
        crate::arch::sbi::send_ipi(fire, 0);
    }
}

/// Send an IPI to every online hart except the caller
pub fn send_all_but_self(reason: IpiReason) {
    let me = crate::arch::hart_id();
    let mask = (0..MAX_HARTS)
        .filter(|&h| h != me)
        .fold(0usize, |m, h| m | (1 << h));
    send_mask(mask, reason);
}

/// Send an IPI to every online hart including the caller
pub fn send_all(reason: IpiReason) {
    let mask = (0..MAX_HARTS).fold(0usize, |m, h| m | (1 << h));
    send_mask(mask, reason);
}

/// Drain this hart's pending mask. Returns the reasons taken.
pub fn take_pending(hart: usize) -> IpiReason {
    IpiReason::from_bits_truncate(PENDING[hart % MAX_HARTS].swap(0, Ordering::AcqRel))
}

/// Software-interrupt handler: acknowledge, swap the pending mask to
/// zero, process each set reason. Runs in IRQ context.
pub fn handle_ipi() {
    crate::arch::clear_soft_pending();

    let me = crate::arch::hart_id();
    let reasons = take_pending(me);

    for reason in reasons.iter() {
        IPI_STATS[me % MAX_HARTS].inc(reason);

        if reason == IpiReason::CRASH {
            handle_crash();
        } else if reason == IpiReason::RESCHEDULE {
            super::percpu::this_cpu().set_needs_resched();
        } else if reason == IpiReason::TLB_FLUSH {
            // Architecture flushes on user return.
        } else {
            crate::debug!("IPI: hart {} ignoring {:?}", me, reason);
        }
    }
}

/// Crash propagation: print once, pass it on, halt with interrupts off.
fn handle_crash() -> ! {
    let cpu = super::percpu::this_cpu();
    crate::arch::intr_off();

    if !cpu.is_crashed() {
        cpu.set_crashed();
        crate::error!("hart {}: crash requested by remote hart", cpu.hart_id);
        crate::lib::panic::print_backtrace();
        send_all_but_self(IpiReason::CRASH);
    }

    crate::lib::panic::halt();
}

/// Receive counters for one hart (reschedule, tlb, crash, generic)
pub fn stats(hart: usize) -> Option<(u64, u64, u64, u64)> {
    if hart >= MAX_HARTS {
        return None;
    }
    let s = &IPI_STATS[hart];
    Some((
        s.reschedule.load(Ordering::Relaxed),
        s.tlb_flush.load(Ordering::Relaxed),
        s.crash.load(Ordering::Relaxed),
        s.generic.load(Ordering::Relaxed),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasons_coalesce_into_mask() {
        post_reason(5, IpiReason::RESCHEDULE);
        post_reason(5, IpiReason::RESCHEDULE);
        post_reason(5, IpiReason::TLB_FLUSH);

        let taken = take_pending(5);
        assert_eq!(taken, IpiReason::RESCHEDULE | IpiReason::TLB_FLUSH);
        // Drained: a second take sees nothing.
        assert!(take_pending(5).is_empty());
    }

    #[test]
    fn test_out_of_range_target_ignored() {
        post_reason(MAX_HARTS + 1, IpiReason::GENERIC);
        assert!(take_pending(1).is_empty());
    }
}
