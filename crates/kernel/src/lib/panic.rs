// Kernel panic path
//
// A panicking hart prints its diagnostics once, propagates a crash IPI to
// every other hart, and halts with interrupts off.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

/// Global panic state - prevents recursive panics
static PANICKING: AtomicBool = AtomicBool::new(false);

const MAX_RECENT_LOGS: usize = 20;

pub fn panic_handler(info: &PanicInfo) -> ! {
    crate::arch::intr_off();

    if PANICKING.swap(true, Ordering::SeqCst) {
        crate::arch::console_write(b"\n!!! RECURSIVE PANIC !!!\n");
        halt();
    }

    let hart = crate::arch::hart_id();
    crate::smp::percpu::this_cpu().set_crashed();

    crate::arch::console_write(b"\n================= KERNEL PANIC =================\n");

    {
        let msg = alloc::format!("hart {}: {}\n", hart, info.message());
        crate::arch::console_write(msg.as_bytes());
    }
    if let Some(location) = info.location() {
        let loc = alloc::format!(
            "  at {}:{}:{}\n",
            location.file(),
            location.line(),
            location.column()
        );
        crate::arch::console_write(loc.as_bytes());
    }

    print_backtrace();

    crate::arch::console_write(b"RECENT LOGS:\n");
    crate::lib::printk::replay_recent(MAX_RECENT_LOGS);

    // Take the other harts down before halting this one.
    crate::smp::ipi::send_all_but_self(crate::smp::ipi::IpiReason::CRASH);

    halt();
}

/// Frame-pointer walk of the current kernel stack.
///
/// Requires `-C force-frame-pointers=yes`; prints raw return addresses
/// for offline symbolization.
pub fn print_backtrace() {
    crate::arch::console_write(b"BACKTRACE:\n");

    #[cfg(target_arch = "riscv64")]
    unsafe {
        let mut fp: usize;
        core::arch::asm!("mv {}, s0", out(reg) fp);

        for i in 0..16 {
            if fp == 0 || fp % 8 != 0 {
                break;
            }
            // RISC-V frame layout: ra at fp-8, previous fp at fp-16.
            let ra = (fp as *const usize).offset(-1).read_volatile();
            let prev = (fp as *const usize).offset(-2).read_volatile();
            if ra < 0x8000_0000 {
                break;
            }
            let line = alloc::format!("  #{}: {:016x}\n", i, ra);
            crate::arch::console_write(line.as_bytes());
            if prev <= fp {
                break;
            }
            fp = prev;
        }
    }

    #[cfg(not(target_arch = "riscv64"))]
    crate::arch::console_write(b"  [no frame-pointer walk on this target]\n");
}

/// Halt this hart forever with interrupts off.
pub fn halt() -> ! {
    crate::arch::console_write(b"hart halted.\n");
    loop {
        crate::arch::wait_for_interrupt();
    }
}

pub fn is_panicking() -> bool {
    PANICKING.load(Ordering::Relaxed)
}
