//! SMP bring-up and hart bookkeeping

pub mod ipi;
pub mod percpu;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub use percpu::MAX_HARTS;

/// Number of harts online
static HART_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Online bitmap (entry N = hart N is online)
static HART_ONLINE: [AtomicBool; MAX_HARTS] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];

pub fn num_harts() -> usize {
    HART_COUNT.load(Ordering::Acquire)
}

pub fn is_hart_online(hart_id: usize) -> bool {
    if hart_id >= MAX_HARTS {
        return false;
    }
    HART_ONLINE[hart_id].load(Ordering::Acquire)
}

pub fn mark_hart_online(hart_id: usize) {
    if hart_id >= MAX_HARTS {
        crate::warn!("SMP: hart ID {} exceeds MAX_HARTS", hart_id);
        return;
    }
    if !HART_ONLINE[hart_id].swap(true, Ordering::AcqRel) {
        HART_COUNT.fetch_add(1, Ordering::AcqRel);
        crate::info!("SMP: hart {} is now online", hart_id);
    }
}

pub fn mark_hart_offline(hart_id: usize) {
    if hart_id >= MAX_HARTS {
        return;
    }
    if HART_ONLINE[hart_id].swap(false, Ordering::AcqRel) {
        HART_COUNT.fetch_sub(1, Ordering::AcqRel);
        crate::info!("SMP: hart {} is now offline", hart_id);
    }
}

/// Ask the firmware to start every stopped hart at `start_addr`.
///
/// Each started hart receives its stack top as the opaque argument and
/// lands in the secondary boot stub with interrupts off.
pub fn start_secondary_harts(start_addr: usize, stack_for: impl Fn(usize) -> usize) {
    let boot_hart = crate::arch::hart_id();

    for hart in 0..MAX_HARTS {
        if hart == boot_hart {
            continue;
        }
        // Status 1 = stopped and startable.
        let status = crate::arch::sbi::hart_status(hart);
        if !status.is_ok() || status.value != 1 {
            continue;
        }
        let ret = crate::arch::sbi::hart_start(hart, start_addr, stack_for(hart));
        if ret.is_ok() {
            crate::info!("SMP: requested start of hart {}", hart);
        } else {
            crate::warn!("SMP: hart {} start failed ({})", hart, ret.error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_bitmap_bounds() {
        assert!(!is_hart_online(MAX_HARTS));
        assert!(!is_hart_online(MAX_HARTS + 3));
    }
}
