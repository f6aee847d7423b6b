//! Time and tick management
//!
//! Each hart programs its own next timer event through the firmware; the
//! tick handler advances the hart-local timer wheel and charges the
//! scheduler quantum.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timebase frequency of the platform counter (QEMU virt: 10 MHz)
pub const TIMEBASE_FREQ: u64 = 10_000_000;

/// Scheduler tick rate
pub const TICK_HZ: u64 = 100;

/// Counter increments per tick
pub const CYCLES_PER_TICK: u64 = TIMEBASE_FREQ / TICK_HZ;

static BOOT_TIMESTAMP_US: AtomicU64 = AtomicU64::new(0);

/// Current timestamp in microseconds, from the monotonic counter
pub fn timestamp_us() -> u64 {
    let cycles = crate::arch::read_time();
    cycles / (TIMEBASE_FREQ / 1_000_000)
}

/// Initialize boot timestamp
pub fn init_boot_timestamp() {
    BOOT_TIMESTAMP_US.store(timestamp_us(), Ordering::Relaxed);
}

/// Time since boot in microseconds
pub fn uptime_us() -> u64 {
    timestamp_us().saturating_sub(BOOT_TIMESTAMP_US.load(Ordering::Relaxed))
}

/// Time since boot in milliseconds
pub fn uptime_ms() -> u64 {
    uptime_us() / 1000
}

/// Arm this hart's timer for the next tick
pub fn arm_tick() {
    crate::arch::sbi::set_timer(crate::arch::read_time() + CYCLES_PER_TICK);
}

/// Timer interrupt on this hart: re-arm, then drive the timer wheel and
/// the scheduler quantum. Runs in IRQ context.
pub fn handle_tick() {
    arm_tick();
    crate::timer::timer_tick(1);
    crate::process::scheduler::tick();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycles_per_tick() {
        assert_eq!(CYCLES_PER_TICK, 100_000);
    }
}
