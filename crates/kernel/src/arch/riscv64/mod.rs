//! RISC-V 64-bit architecture support
//!
//! CSR access, per-hart identification through `tp`, interrupt enable
//! discipline, and memory barriers. Everything behind a
//! `target_arch = "riscv64"` gate carries a host fallback so that
//! pure-logic unit tests build on the development machine.

pub mod context;
pub mod sbi;
pub mod trap;

pub use context::{switch_context, CpuContext, TrapFrame};

/// sstatus.SIE - supervisor interrupt enable
pub const SSTATUS_SIE: usize = 1 << 1;
/// sstatus.SPP - previous privilege (1 = supervisor)
pub const SSTATUS_SPP: usize = 1 << 8;
/// sstatus.SPIE - previous interrupt enable
pub const SSTATUS_SPIE: usize = 1 << 5;

/// sip.SSIP - supervisor software interrupt pending
pub const SIP_SSIP: usize = 1 << 1;
/// sie bits: software, timer, external
pub const SIE_SSIE: usize = 1 << 1;
pub const SIE_STIE: usize = 1 << 5;
pub const SIE_SEIE: usize = 1 << 9;

/// Get current hart ID (kept in `tp` for kernel code)
#[inline]
pub fn hart_id() -> usize {
    #[cfg(target_arch = "riscv64")]
    {
        let id: usize;
        unsafe {
            core::arch::asm!("mv {}, tp", out(reg) id);
        }
        id
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

/// Install the hart ID into `tp`. Called once per hart, before anything
/// consults per-CPU state.
#[inline]
pub fn set_hart_id(id: usize) {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("mv tp, {}", in(reg) id);
    }

    #[cfg(not(target_arch = "riscv64"))]
    let _ = id;
}

/// Read sstatus
#[inline]
pub fn read_sstatus() -> usize {
    #[cfg(target_arch = "riscv64")]
    {
        let v: usize;
        unsafe {
            core::arch::asm!("csrr {}, sstatus", out(reg) v);
        }
        v
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

/// Enable supervisor interrupts on this hart
#[inline]
pub fn intr_on() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("csrs sstatus, {}", in(reg) SSTATUS_SIE);
    }
}

/// Disable supervisor interrupts on this hart
#[inline]
pub fn intr_off() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("csrc sstatus, {}", in(reg) SSTATUS_SIE);
    }
}

/// Are supervisor interrupts enabled on this hart?
#[inline]
pub fn intr_get() -> bool {
    #[cfg(target_arch = "riscv64")]
    {
        read_sstatus() & SSTATUS_SIE != 0
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        false
    }
}

/// Clear the pending supervisor software interrupt (IPI acknowledge)
#[inline]
pub fn clear_soft_pending() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("csrc sip, {}", in(reg) SIP_SSIP);
    }
}

/// Enable the supervisor interrupt sources this core uses
#[inline]
pub fn enable_interrupt_sources() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("csrs sie, {}", in(reg) SIE_SSIE | SIE_STIE | SIE_SEIE);
    }
}

/// Monotonic counter register (time CSR, SBI timebase units)
#[inline]
pub fn read_time() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let t: u64;
        unsafe {
            core::arch::asm!("rdtime {}", out(reg) t);
        }
        t
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

/// Stall until the next interrupt
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "riscv64")]
    riscv::asm::wfi();

    #[cfg(not(target_arch = "riscv64"))]
    core::hint::spin_loop();
}

/// Write bytes to the firmware console
pub fn console_write(bytes: &[u8]) {
    for &b in bytes {
        sbi::console_putchar(b);
    }
}

/// Copy kernel bytes out to a user address.
///
/// The VM layer validates the mapping before the core is entered; here the
/// address is trusted and written through directly.
pub unsafe fn copy_to_user(dst: usize, src: &[u8]) -> crate::lib::error::Result<()> {
    if dst == 0 {
        return Err(crate::lib::error::Errno::EINVAL);
    }
    core::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len());
    Ok(())
}

/// Copy bytes in from a user address.
pub unsafe fn copy_from_user(dst: &mut [u8], src: usize) -> crate::lib::error::Result<()> {
    if src == 0 {
        return Err(crate::lib::error::Errno::EINVAL);
    }
    core::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
    Ok(())
}

/// Architecture-specific memory barriers
pub mod barriers {
    /// Full memory barrier
    #[inline]
    pub fn mb() {
        #[cfg(target_arch = "riscv64")]
        unsafe {
            core::arch::asm!("fence rw, rw");
        }

        #[cfg(not(target_arch = "riscv64"))]
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    /// Read barrier
    #[inline]
    pub fn rmb() {
        #[cfg(target_arch = "riscv64")]
        unsafe {
            core::arch::asm!("fence r, r");
        }

        #[cfg(not(target_arch = "riscv64"))]
        core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
    }

    /// Write barrier
    #[inline]
    pub fn wmb() {
        #[cfg(target_arch = "riscv64")]
        unsafe {
            core::arch::asm!("fence w, w");
        }

        #[cfg(not(target_arch = "riscv64"))]
        core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
    }
}
