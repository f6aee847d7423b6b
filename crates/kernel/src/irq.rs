//! IRQ descriptor table
//!
//! A fixed table maps small IRQ indices (CPU causes below
//! `CLINT_IRQ_CNT`, external controller lines offset by
//! `PLIC_IRQ_OFFSET`) to RCU-published descriptors. Registration is
//! serialized by a write lock; dispatch runs lock-free in a read section
//! so unregistration can retire the descriptor after a grace period while
//! in-flight handlers finish normally.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::lib::error::{Errno, Result};
use crate::rcu::{call_rcu, rcu_read_lock, RcuPointer};
use crate::sync::SpinLock;

/// Local (CLINT/cause) interrupt index space
pub const CLINT_IRQ_CNT: usize = 16;
/// External controller lines start here
pub const PLIC_IRQ_OFFSET: usize = 16;
/// External lines supported
pub const PLIC_IRQ_CNT: usize = 64;
pub const MAX_IRQS: usize = CLINT_IRQ_CNT + PLIC_IRQ_CNT;

/// Handler signature: (irq index, opaque data, device pointer)
pub type IrqHandler = fn(usize, usize, usize) -> i32;

pub struct IrqDesc {
    pub irq: usize,
    pub handler: Option<IrqHandler>,
    pub data: usize,
    pub dev: usize,
    pub count: AtomicU64,
}

static TABLE: [RcuPointer<IrqDesc>; MAX_IRQS] = [const { RcuPointer::null() }; MAX_IRQS];

/// Serializes registration and unregistration
static TABLE_LOCK: SpinLock<()> = SpinLock::new("irq_table", ());

/// Install a handler on `irq`. The slot must be free.
pub fn register_irq_handler(
    irq: usize,
    handler: Option<IrqHandler>,
    data: usize,
    dev: usize,
) -> Result<()> {
    if irq >= MAX_IRQS {
        return Err(Errno::EINVAL);
    }

    let _g = TABLE_LOCK.lock();
    if !TABLE[irq].is_null() {
        return Err(Errno::EEXIST);
    }

    let desc = Box::new(IrqDesc {
        irq,
        handler,
        data,
        dev,
        count: AtomicU64::new(0),
    });
    let old = TABLE[irq].assign(desc);
    debug_assert!(old.is_null());
    crate::debug!("IRQ: registered handler for irq {}", irq);
    Ok(())
}

/// Retract the handler for `irq`. In-flight dispatches that already
/// loaded the descriptor complete; the memory is freed one grace period
/// later.
pub fn unregister_irq_handler(irq: usize) -> Result<()> {
    if irq >= MAX_IRQS {
        return Err(Errno::EINVAL);
    }

    let _g = TABLE_LOCK.lock();
    let raw = TABLE[irq].take();
    if raw.is_null() {
        return Err(Errno::ENOENT);
    }

    struct Retired(*mut IrqDesc);
    unsafe impl Send for Retired {}
    let retired = Retired(raw);

    call_rcu(Box::new(move || {
        let r = retired;
        drop(unsafe { Box::from_raw(r.0) });
    }));
    crate::debug!("IRQ: unregistered handler for irq {}", irq);
    Ok(())
}

/// Route one interrupt. Called from the trap path with the external
/// controller claim already held.
pub fn do_irq(irq: usize) -> Result<i32> {
    if irq >= MAX_IRQS {
        return Err(Errno::EINVAL);
    }

    let guard = rcu_read_lock();
    let desc = match TABLE[irq].dereference(&guard) {
        Some(d) => d,
        None => {
            crate::warn!("IRQ: spurious irq {} with no descriptor", irq);
            return Err(Errno::ENODEV);
        }
    };

    desc.count.fetch_add(1, Ordering::Relaxed);
    match desc.handler {
        Some(handler) => Ok(handler(irq, desc.data, desc.dev)),
        None => {
            crate::warn!("IRQ: irq {} registered without a handler", irq);
            Err(Errno::ENODEV)
        }
    }
}

/// Invocation count for one line (0 when the slot is empty).
pub fn irq_count(irq: usize) -> u64 {
    if irq >= MAX_IRQS {
        return 0;
    }
    let guard = rcu_read_lock();
    TABLE[irq]
        .dereference(&guard)
        .map(|d| d.count.load(Ordering::Relaxed))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_two(_irq: usize, data: usize, _dev: usize) -> i32 {
        data as i32 * 2
    }

    #[test]
    fn test_register_dispatch_unregister() {
        let irq = PLIC_IRQ_OFFSET + 40;
        register_irq_handler(irq, Some(count_two), 21, 0).unwrap();
        assert_eq!(do_irq(irq), Ok(42));
        assert_eq!(do_irq(irq), Ok(42));
        assert_eq!(irq_count(irq), 2);

        unregister_irq_handler(irq).unwrap();
        assert_eq!(do_irq(irq), Err(Errno::ENODEV));
        assert_eq!(unregister_irq_handler(irq), Err(Errno::ENOENT));
    }

    #[test]
    fn test_occupied_slot_refused() {
        let irq = PLIC_IRQ_OFFSET + 41;
        register_irq_handler(irq, Some(count_two), 0, 0).unwrap();
        assert_eq!(
            register_irq_handler(irq, Some(count_two), 0, 0),
            Err(Errno::EEXIST)
        );
        unregister_irq_handler(irq).unwrap();
    }

    #[test]
    fn test_bounds_checked() {
        assert_eq!(
            register_irq_handler(MAX_IRQS, Some(count_two), 0, 0),
            Err(Errno::EINVAL)
        );
        assert_eq!(do_irq(MAX_IRQS + 5), Err(Errno::EINVAL));
        assert_eq!(unregister_irq_handler(MAX_IRQS), Err(Errno::EINVAL));
    }

    #[test]
    fn test_descriptor_without_handler_reports_enodev() {
        let irq = PLIC_IRQ_OFFSET + 42;
        register_irq_handler(irq, None, 0, 0).unwrap();
        assert_eq!(do_irq(irq), Err(Errno::ENODEV));
        // The miss still counts the arrival.
        assert_eq!(irq_count(irq), 1);
        unregister_irq_handler(irq).unwrap();
    }
}
