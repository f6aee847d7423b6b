#![cfg_attr(all(not(test), target_arch = "riscv64"), no_std)]
#![cfg_attr(all(not(test), target_arch = "riscv64"), no_main)]
#![cfg_attr(all(not(test), target_arch = "riscv64"), feature(alloc_error_handler))]
// CI lint gate: when built with `--features strict`, fail on any warning
#![cfg_attr(feature = "strict", deny(warnings))]
// During early bringup, suppress warnings to keep logs clean
#![cfg_attr(all(feature = "bringup", not(feature = "strict")), allow(warnings))]

// Required for heap allocation
extern crate alloc;

// Core library (error handling, logging, panics)
#[allow(special_module_name)]
pub mod lib;
// Architecture support (CSRs, SBI, context switch, traps)
pub mod arch;
// IRQ descriptor table and routing
pub mod irq;
// Thread, scheduler and signal management
pub mod process;
// Read-copy-update
pub mod rcu;
// Boot-time smoke tests for the concurrency core
pub mod selftest;
// SMP bring-up, per-hart state, IPIs
pub mod smp;
// Synchronization primitives
pub mod sync;
// Time and tick management
pub mod time;
// Per-hart timer wheels
pub mod timer;
// Deferred work execution
pub mod workqueue;

use smp::percpu::MAX_HARTS;

/// Boot/idle stack per hart (16 KiB)
const BOOT_STACK_SIZE: usize = 16 * 1024;
/// Dedicated interrupt stack per hart (8 KiB)
const IRQ_STACK_SIZE: usize = 8192;

#[repr(C, align(16))]
struct Stack<const N: usize>([u8; N]);

static BOOT_STACKS: [Stack<BOOT_STACK_SIZE>; MAX_HARTS] = [
    Stack([0; BOOT_STACK_SIZE]),
    Stack([0; BOOT_STACK_SIZE]),
    Stack([0; BOOT_STACK_SIZE]),
    Stack([0; BOOT_STACK_SIZE]),
    Stack([0; BOOT_STACK_SIZE]),
    Stack([0; BOOT_STACK_SIZE]),
    Stack([0; BOOT_STACK_SIZE]),
    Stack([0; BOOT_STACK_SIZE]),
];

static IRQ_STACKS: [Stack<IRQ_STACK_SIZE>; MAX_HARTS] = [
    Stack([0; IRQ_STACK_SIZE]),
    Stack([0; IRQ_STACK_SIZE]),
    Stack([0; IRQ_STACK_SIZE]),
    Stack([0; IRQ_STACK_SIZE]),
    Stack([0; IRQ_STACK_SIZE]),
    Stack([0; IRQ_STACK_SIZE]),
    Stack([0; IRQ_STACK_SIZE]),
    Stack([0; IRQ_STACK_SIZE]),
];

fn boot_stack_top(hart: usize) -> usize {
    &BOOT_STACKS[hart % MAX_HARTS] as *const _ as usize + BOOT_STACK_SIZE
}

fn irq_stack_top(hart: usize) -> usize {
    &IRQ_STACKS[hart % MAX_HARTS] as *const _ as usize + IRQ_STACK_SIZE
}

/// Kernel heap backing store (4 MiB)
#[cfg(all(not(test), target_arch = "riscv64"))]
const HEAP_SIZE: usize = 4 * 1024 * 1024;
#[cfg(all(not(test), target_arch = "riscv64"))]
static mut HEAP_MEM: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

#[cfg(all(not(test), target_arch = "riscv64"))]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[cfg(all(not(test), target_arch = "riscv64"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    lib::panic::panic_handler(info)
}

#[cfg(all(not(test), target_arch = "riscv64"))]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted allocating {:?}", layout);
}

// Boot entry points. The firmware hands the boot hart to `_start` with
// the hart ID in a0; secondaries started through HSM land in
// `_secondary_start` with their stack top as the opaque argument.
#[cfg(all(target_arch = "riscv64", not(test)))]
core::arch::global_asm!(
    r#"
    .section .text.boot
    .globl _start
_start:
    mv tp, a0
    la t0, {boot_stacks}
    li t1, {stack_size}
    addi t2, a0, 1
    mul t2, t1, t2
    add sp, t0, t2
    call kernel_main
1:
    wfi
    j 1b

    .globl _secondary_start
    .align 4
_secondary_start:
    mv tp, a0
    mv sp, a1
    call secondary_main
1:
    wfi
    j 1b
"#,
    boot_stacks = sym BOOT_STACKS,
    stack_size = const BOOT_STACK_SIZE,
);

/// Per-hart pieces shared by the boot and secondary paths.
fn init_this_hart() {
    let hart = arch::hart_id();
    arch::trap::init_hart();
    smp::percpu::set_irq_stack_top(hart, irq_stack_top(hart));
    process::init_hart().expect("hart init");
    smp::mark_hart_online(hart);
    arch::enable_interrupt_sources();
    time::arm_tick();
}

#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    #[cfg(all(not(test), target_arch = "riscv64"))]
    unsafe {
        ALLOCATOR
            .lock()
            .init(core::ptr::addr_of_mut!(HEAP_MEM) as *mut u8, HEAP_SIZE);
    }

    time::init_boot_timestamp();
    crate::info!("BOOT: helium starting on hart {}", arch::hart_id());

    init_this_hart();

    // System work queue for kernel-internal deferred work.
    workqueue::init_system_wq().expect("system workqueue");

    selftest::spawn();

    // Bring up the remaining harts; each gets its boot stack top.
    #[cfg(target_arch = "riscv64")]
    {
        extern "C" {
            fn _secondary_start();
        }
        smp::start_secondary_harts(_secondary_start as usize, boot_stack_top);
    }

    crate::info!(
        "BOOT: hart {} entering idle ({} online)",
        arch::hart_id(),
        smp::num_harts()
    );
    arch::intr_on();
    process::scheduler::idle_loop();
}

#[no_mangle]
pub extern "C" fn secondary_main() -> ! {
    init_this_hart();
    crate::info!("BOOT: secondary hart {} up", arch::hart_id());
    arch::intr_on();
    process::scheduler::idle_loop();
}

// Host builds (tests, cross-checks) link against std and never boot.
#[cfg(any(test, not(target_arch = "riscv64")))]
fn main() {}
