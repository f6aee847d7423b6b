//! Per-hart control blocks
//!
//! One `PerCpu` per hart, found through the hart ID kept in `tp`. Fields
//! with plain-cell semantics (`current`, `idle`) are touched only by the
//! owning hart with interrupts off; counters are atomics so remote harts
//! may read statistics.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use alloc::sync::Arc;
use bitflags::bitflags;

use crate::process::thread::Thread;

/// Maximum number of harts supported
pub const MAX_HARTS: usize = 8;

bitflags! {
    /// Per-hart state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFlags: u32 {
        /// The current thread should yield at its next checkpoint
        const NEEDS_RESCHED = 1 << 0;
        /// The hart is inside an interrupt handler
        const IN_IRQ = 1 << 1;
        /// The hart has not finished bring-up
        const BOOT = 1 << 2;
        /// The hart took a crash IPI or panicked
        const CRASHED = 1 << 3;
    }
}

pub struct PerCpu {
    pub hart_id: usize,

    flags: AtomicU32,

    /// Spinlock (interrupt-off) depth, and the interrupt-enable state
    /// saved when the depth left zero.
    noff: AtomicU32,
    intena: AtomicBool,

    /// Interrupt nesting depth; must stay <= 1
    irq_depth: AtomicU32,

    /// RCU read-side nesting on this hart
    rcu_nesting: AtomicU32,

    /// The running thread, and the idle thread to fall back on
    current: UnsafeCell<Option<Arc<Thread>>>,
    idle: UnsafeCell<Option<Arc<Thread>>>,

    /// Statistics
    pub context_switches: AtomicU64,
    pub ticks: AtomicU64,
}

// Owning-hart discipline for the UnsafeCell fields; everything else is atomic.
unsafe impl Sync for PerCpu {}

/// Interrupt stack tops, indexed by hart; read by the trap vector asm.
#[no_mangle]
pub static IRQ_STACK_TOPS: [AtomicUsize; MAX_HARTS] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

static PER_CPU: [PerCpu; MAX_HARTS] = [
    PerCpu::new(0),
    PerCpu::new(1),
    PerCpu::new(2),
    PerCpu::new(3),
    PerCpu::new(4),
    PerCpu::new(5),
    PerCpu::new(6),
    PerCpu::new(7),
];

impl PerCpu {
    const fn new(hart_id: usize) -> Self {
        Self {
            hart_id,
            flags: AtomicU32::new(CpuFlags::BOOT.bits()),
            noff: AtomicU32::new(0),
            intena: AtomicBool::new(false),
            irq_depth: AtomicU32::new(0),
            rcu_nesting: AtomicU32::new(0),
            current: UnsafeCell::new(None),
            idle: UnsafeCell::new(None),
            context_switches: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn flags(&self) -> CpuFlags {
        CpuFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, flag: CpuFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: CpuFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn test_flag(&self, flag: CpuFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn set_needs_resched(&self) {
        self.set_flag(CpuFlags::NEEDS_RESCHED);
    }

    pub fn take_needs_resched(&self) -> bool {
        let old = self
            .flags
            .fetch_and(!CpuFlags::NEEDS_RESCHED.bits(), Ordering::AcqRel);
        old & CpuFlags::NEEDS_RESCHED.bits() != 0
    }

    pub fn set_crashed(&self) {
        self.set_flag(CpuFlags::CRASHED);
    }

    pub fn is_crashed(&self) -> bool {
        self.test_flag(CpuFlags::CRASHED)
    }

    pub fn spin_depth(&self) -> u32 {
        self.noff.load(Ordering::Relaxed)
    }

    pub fn inc_spin_depth(&self) {
        self.noff.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_spin_depth(&self) {
        self.noff.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn intena(&self) -> bool {
        self.intena.load(Ordering::Relaxed)
    }

    pub fn set_intena(&self, on: bool) {
        self.intena.store(on, Ordering::Relaxed);
    }

    /// Enter an interrupt handler; nested external interrupts are a bug.
    pub fn enter_irq(&self) {
        let depth = self.irq_depth.fetch_add(1, Ordering::Relaxed);
        if depth >= 1 {
            panic!("hart {}: nested interrupt", self.hart_id);
        }
        self.set_flag(CpuFlags::IN_IRQ);
    }

    pub fn exit_irq(&self) {
        self.clear_flag(CpuFlags::IN_IRQ);
        self.irq_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_irq(&self) -> bool {
        self.irq_depth.load(Ordering::Relaxed) > 0
    }

    pub fn rcu_nesting(&self) -> u32 {
        self.rcu_nesting.load(Ordering::Relaxed)
    }

    pub fn inc_rcu_nesting(&self) {
        self.rcu_nesting.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_rcu_nesting(&self) {
        let old = self.rcu_nesting.fetch_sub(1, Ordering::Relaxed);
        if old == 0 {
            panic!("hart {}: unbalanced rcu_read_unlock", self.hart_id);
        }
    }

    /// Current thread slot. Owning hart only, interrupts off.
    pub unsafe fn current_slot(&self) -> &mut Option<Arc<Thread>> {
        &mut *self.current.get()
    }

    /// Idle thread slot. Owning hart only, interrupts off.
    pub unsafe fn idle_slot(&self) -> &mut Option<Arc<Thread>> {
        &mut *self.idle.get()
    }

    pub fn inc_context_switches(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ticks(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-CPU block of the calling hart
pub fn this_cpu() -> &'static PerCpu {
    &PER_CPU[crate::arch::hart_id() % MAX_HARTS]
}

/// Per-CPU block of an arbitrary hart
pub fn cpu(hart_id: usize) -> &'static PerCpu {
    &PER_CPU[hart_id % MAX_HARTS]
}

/// Install the per-hart interrupt stack top for the trap vector
pub fn set_irq_stack_top(hart_id: usize, top: usize) {
    IRQ_STACK_TOPS[hart_id % MAX_HARTS].store(top, Ordering::Release);
}

/// Statistics for a single hart
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuStat {
    pub hart_id: usize,
    pub context_switches: u64,
    pub ticks: u64,
    pub crashed: bool,
}

/// Snapshot statistics for all harts
pub fn stats() -> [CpuStat; MAX_HARTS] {
    let mut out = [CpuStat::default(); MAX_HARTS];
    for (i, slot) in out.iter_mut().enumerate() {
        let c = cpu(i);
        *slot = CpuStat {
            hart_id: i,
            context_switches: c.context_switches.load(Ordering::Relaxed),
            ticks: c.ticks.load(Ordering::Relaxed),
            crashed: c.is_crashed(),
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_set_clear() {
        let cpu = PerCpu::new(7);
        assert!(cpu.test_flag(CpuFlags::BOOT));
        cpu.set_flag(CpuFlags::NEEDS_RESCHED);
        assert!(cpu.take_needs_resched());
        assert!(!cpu.take_needs_resched());
    }

    #[test]
    fn test_crash_flag_latches() {
        let cpu = PerCpu::new(6);
        assert!(!cpu.is_crashed());
        cpu.set_crashed();
        assert!(cpu.is_crashed());
    }
}
