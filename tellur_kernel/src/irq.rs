//! Device interrupt number space and the interrupt-to-task wake path.
//!
//! The trap stub publishes a wakeup into a per-vector slot; a driver task
//! consumes it with [`irq_wait`]. Both sides are lock-free and allocation
//! free, which is what makes the stub legal in interrupt context.

use crate::globals;

use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::task::{Context, Poll};

use futures_util::task::AtomicWaker;

/// The scheduler tick. Vectors at or below this one never reach the IRQ
/// dispatch.
pub const TIMER: usize = 32;

/// First vector wired to an IOAPIC line.
pub const IRQ_BASE: usize = 32;

/// ISA line numbers.
pub const IRQ_KBD: usize = 1;
pub const IRQ_COM1: usize = 4;
pub const IRQ_DISK: usize = 14;

pub const INT_KBD: usize = IRQ_BASE + IRQ_KBD;
pub const INT_COM1: usize = IRQ_BASE + IRQ_COM1;
pub const INT_DISK: usize = IRQ_BASE + IRQ_DISK;

/// Message-signalled vectors; these bypass the IOAPIC entirely.
pub const INT_MSI0: usize = 56;
pub const INT_MSI3: usize = INT_MSI0 + 3;
pub const INT_MSI7: usize = INT_MSI0 + 7;

/// Highest vector the IRQ dispatch accepts.
pub const IRQ_LAST: usize = INT_MSI7;

/// Size of the per-vector slot table.
pub const NVEC: usize = IRQ_LAST + 1;

pub struct IrqLine {
    pending: AtomicBool,
    waker: AtomicWaker,
    hits: AtomicUsize,
}

impl IrqLine {
    const fn new() -> IrqLine {
        IrqLine {
            pending: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            hits: AtomicUsize::new(0),
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const LINE_INIT: IrqLine = IrqLine::new();
static LINES: [IrqLine; NVEC] = [LINE_INIT; NVEC];

/// Post a wakeup for `vec`. Idempotent within one interrupt; safe in ISR
/// context (no allocation, no locks, no suspension).
pub fn irq_wake(vec: usize) {
    let line = &LINES[vec];
    line.hits.fetch_add(1, Ordering::Relaxed);
    line.pending.store(true, Ordering::Release);
    line.waker.wake();
}

/// Block the calling task until the stub wakes `vec`. Each wakeup satisfies
/// one waiter; a spurious return only happens if the driver re-arms without
/// consuming the device condition.
pub fn irq_wait(vec: usize) -> IrqWait {
    assert!(vec < NVEC);
    IrqWait { vec }
}

pub struct IrqWait {
    vec: usize,
}

impl Future for IrqWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let line = &LINES[self.vec];
        if line.pending.swap(false, Ordering::AcqRel) {
            return Poll::Ready(());
        }
        line.waker.register(cx.waker());
        // re-check: the interrupt may have fired between the first check and
        // the registration
        if line.pending.swap(false, Ordering::AcqRel) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Whether a wakeup is pending for `vec` (test and diagnostics hook).
pub fn pending(vec: usize) -> bool {
    LINES[vec].pending.load(Ordering::Acquire)
}

/// Total interrupts seen on `vec`.
pub fn hits(vec: usize) -> usize {
    LINES[vec].hits.load(Ordering::Relaxed)
}

#[cfg(test)]
pub fn reset(vec: usize) {
    LINES[vec].pending.store(false, Ordering::Release);
}

/// Serialises tests that poke the shared per-vector slots.
#[cfg(test)]
pub static TEST_LOCK: spin::Mutex<()> = spin::Mutex::new(());

/// Reopen an IOAPIC line after the driver has consumed the device condition.
pub fn irq_unmask(irq: usize) {
    unsafe { globals::IOAPIC.set_line_masked(irq as u32, false) }
}

/// End-of-interrupt from driver context. The line was masked by the trap
/// stub; reopening it is all that is left to do, the LAPIC EOI was already
/// sent by the scheduler.
pub fn irq_eoi(irq: usize) {
    irq_unmask(irq);
}
