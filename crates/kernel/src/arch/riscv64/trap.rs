//! Trap entry and routing
//!
//! All supervisor traps land in `kernel_trap_vector`. The full register
//! frame is saved on the interrupted thread's kernel stack; the Rust
//! handler then runs on the per-hart interrupt stack, and the exit
//! checkpoint (signal delivery, preemption) runs back on the thread stack
//! where yielding is legal.

use super::context::TrapFrame;

/// scause interrupt codes
pub const IRQ_S_SOFT: usize = 1;
pub const IRQ_S_TIMER: usize = 5;
pub const IRQ_S_EXT: usize = 9;

/// scause exception codes
pub const EXC_ILLEGAL_INSN: usize = 2;
pub const EXC_LOAD_FAULT: usize = 5;
pub const EXC_STORE_FAULT: usize = 7;
pub const EXC_USER_ECALL: usize = 8;
pub const EXC_INSN_PAGE_FAULT: usize = 12;
pub const EXC_LOAD_PAGE_FAULT: usize = 13;
pub const EXC_STORE_PAGE_FAULT: usize = 15;

const SCAUSE_INTERRUPT: usize = 1 << 63;

/// PLIC claim/complete register for this hart's S-mode context
/// (QEMU virt layout; programming the PLIC itself is the platform
/// layer's job, the core only claims and completes).
const PLIC_BASE: usize = 0x0c00_0000;

#[inline]
#[cfg_attr(not(target_arch = "riscv64"), allow(dead_code))]
fn plic_claim_reg() -> *mut u32 {
    let hart = super::hart_id();
    (PLIC_BASE + 0x201004 + hart * 0x2000) as *mut u32
}

fn plic_claim() -> u32 {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        plic_claim_reg().read_volatile()
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

fn plic_complete(irq: u32) {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        plic_claim_reg().write_volatile(irq);
    }

    #[cfg(not(target_arch = "riscv64"))]
    let _ = irq;
}

#[inline]
fn read_scause() -> usize {
    #[cfg(target_arch = "riscv64")]
    {
        let v: usize;
        unsafe {
            core::arch::asm!("csrr {}, scause", out(reg) v);
        }
        v
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

#[inline]
fn read_stval() -> usize {
    #[cfg(target_arch = "riscv64")]
    {
        let v: usize;
        unsafe {
            core::arch::asm!("csrr {}, stval", out(reg) v);
        }
        v
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

/// Install the trap vector on this hart (direct mode)
pub fn init_hart() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("csrw stvec, {}", in(reg) kernel_trap_vector as usize);
    }
}

#[cfg(target_arch = "riscv64")]
extern "C" {
    fn kernel_trap_vector();
}

#[cfg(not(target_arch = "riscv64"))]
#[allow(dead_code)]
fn kernel_trap_vector() {}

/// First stage: interrupt routing. Runs on the per-hart interrupt stack
/// with interrupts off.
#[no_mangle]
extern "C" fn kernel_trap_handler(tf: &mut TrapFrame) {
    let scause = read_scause();

    if scause & SCAUSE_INTERRUPT != 0 {
        let cpu = crate::smp::percpu::this_cpu();
        cpu.enter_irq();

        match scause & !SCAUSE_INTERRUPT {
            IRQ_S_SOFT => {
                crate::smp::ipi::handle_ipi();
            }
            IRQ_S_TIMER => {
                crate::time::handle_tick();
            }
            IRQ_S_EXT => {
                let irq = plic_claim();
                if irq != 0 {
                    let _ = crate::irq::do_irq(irq as usize + crate::irq::PLIC_IRQ_OFFSET);
                    plic_complete(irq);
                }
            }
            other => {
                crate::warn!("TRAP: unexpected interrupt cause {}", other);
            }
        }

        cpu.exit_irq();
        return;
    }

    if tf.from_user() {
        handle_user_exception(tf, scause);
        return;
    }

    panic!(
        "kernel trap: scause={} stval={:#x} sepc={:#x}",
        scause,
        read_stval(),
        tf.sepc
    );
}

/// Faulting user context: turn the exception into a signal so the thread
/// dies (or handles it) at the delivery checkpoint. The syscall path
/// (EXC_USER_ECALL) belongs to the dispatch layer and is not routed here.
fn handle_user_exception(tf: &mut TrapFrame, scause: usize) {
    use crate::process::signal::{Signal, SIGILL, SIGSEGV};

    let signo = match scause {
        EXC_ILLEGAL_INSN => SIGILL,
        EXC_LOAD_FAULT | EXC_STORE_FAULT | EXC_INSN_PAGE_FAULT | EXC_LOAD_PAGE_FAULT
        | EXC_STORE_PAGE_FAULT => SIGSEGV,
        other => {
            crate::warn!(
                "TRAP: unhandled user exception {} stval={:#x} sepc={:#x}",
                other,
                read_stval(),
                tf.sepc
            );
            SIGILL
        }
    };

    if let Some(cur) = crate::process::current() {
        let _ = crate::process::signal::send_to_thread(&cur, Signal::new(signo).unwrap(), None);
    }
}

/// Second stage, back on the interrupted thread's stack: signal delivery
/// for user returns, preemption for kernel returns.
#[no_mangle]
extern "C" fn trap_exit_checkpoint(tf: &mut TrapFrame) {
    if tf.from_user() {
        crate::process::sigdeliver::deliver_pending(tf);
        crate::process::scheduler::preempt_checkpoint();
        return;
    }

    // Kernel return: only preempt if the interrupted context was itself
    // interruptible (it held no spinlock, or the trap could not have fired).
    if tf.sstatus & super::SSTATUS_SPIE != 0 {
        crate::process::scheduler::preempt_checkpoint();
    }
}

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    r#"
    .section .text
    .globl kernel_trap_vector
    .align 4
kernel_trap_vector:
    addi sp, sp, -272
    sd x1, 0(sp)
    sd x3, 16(sp)
    sd x4, 24(sp)
    sd x5, 32(sp)
    sd x6, 40(sp)
    sd x7, 48(sp)
    sd x8, 56(sp)
    sd x9, 64(sp)
    sd x10, 72(sp)
    sd x11, 80(sp)
    sd x12, 88(sp)
    sd x13, 96(sp)
    sd x14, 104(sp)
    sd x15, 112(sp)
    sd x16, 120(sp)
    sd x17, 128(sp)
    sd x18, 136(sp)
    sd x19, 144(sp)
    sd x20, 152(sp)
    sd x21, 160(sp)
    sd x22, 168(sp)
    sd x23, 176(sp)
    sd x24, 184(sp)
    sd x25, 192(sp)
    sd x26, 200(sp)
    sd x27, 208(sp)
    sd x28, 216(sp)
    sd x29, 224(sp)
    sd x30, 232(sp)
    sd x31, 240(sp)
    addi t0, sp, 272
    sd t0, 8(sp)
    csrr t1, sepc
    sd t1, 248(sp)
    csrr t2, sstatus
    sd t2, 256(sp)

    # Run the handler on this hart's interrupt stack (if installed).
    mv s1, sp
    mv a0, sp
    la t0, IRQ_STACK_TOPS
    slli t1, tp, 3
    add t0, t0, t1
    ld t0, 0(t0)
    beqz t0, 1f
    mv sp, t0
1:
    call kernel_trap_handler

    # Back on the interrupted thread's stack for the exit checkpoint.
    mv sp, s1
    mv a0, sp
    call trap_exit_checkpoint

    ld t1, 248(sp)
    csrw sepc, t1
    ld t2, 256(sp)
    csrw sstatus, t2
    ld x1, 0(sp)
    ld x3, 16(sp)
    ld x4, 24(sp)
    ld x5, 32(sp)
    ld x6, 40(sp)
    ld x7, 48(sp)
    ld x8, 56(sp)
    ld x9, 64(sp)
    ld x10, 72(sp)
    ld x11, 80(sp)
    ld x12, 88(sp)
    ld x13, 96(sp)
    ld x14, 104(sp)
    ld x15, 112(sp)
    ld x16, 120(sp)
    ld x17, 128(sp)
    ld x18, 136(sp)
    ld x19, 144(sp)
    ld x20, 152(sp)
    ld x21, 160(sp)
    ld x22, 168(sp)
    ld x23, 176(sp)
    ld x24, 184(sp)
    ld x25, 192(sp)
    ld x26, 200(sp)
    ld x27, 208(sp)
    ld x28, 216(sp)
    ld x29, 224(sp)
    ld x30, 232(sp)
    ld x31, 240(sp)
    ld sp, 8(sp)
    sret
"#
);
