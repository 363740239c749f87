//! The hardware trap stub.
//!
//! This is the only kernel code that runs in true interrupt context, on the
//! tiny per-CPU interrupt stack. It must not allocate, log, lock, or do
//! anything else that could suspend; all it may do is flip atomics, poke the
//! IOAPIC mask, and halt on undefined input. The LAPIC EOI is *not* sent
//! here: the scheduler emits it after switching off the interrupt stack.

use crate::globals;
use crate::irq::{self, INT_COM1, INT_DISK, INT_KBD, INT_MSI0, INT_MSI7, IRQ_BASE, IRQ_LAST, TIMER};

use amd64::trapframe::TrapFrame;

use core::sync::atomic::{AtomicUsize, Ordering};

/// What the stub does for a given trap number.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum TrapDecision {
    /// Legacy IOAPIC line: mask the line, then wake the vector's waiter.
    /// Masking must happen before the LAPIC EOI, or a LAPIC that broadcasts
    /// EOIs to the IOAPIC will re-raise the line immediately.
    WakeAndMask { irq_line: u32 },
    /// MSI or disk vector: no IOAPIC involvement, just wake.
    Wake,
    /// Not an IRQ this kernel ever expects: the CPU is in an undefined state
    /// and must not continue.
    Fatal,
}

/// Pure decision function; the stub acts on its result.
pub fn classify(trapno: usize) -> TrapDecision {
    if trapno <= TIMER || trapno > IRQ_LAST {
        return TrapDecision::Fatal;
    }
    match trapno {
        INT_KBD | INT_COM1 => TrapDecision::WakeAndMask {
            irq_line: (trapno - IRQ_BASE) as u32,
        },
        INT_DISK => TrapDecision::Wake,
        n if (INT_MSI0..=INT_MSI7).contains(&n) => TrapDecision::Wake,
        _ => TrapDecision::Fatal,
    }
}

/// Count of IRQs dispatched since boot.
static IRQS: AtomicUsize = AtomicUsize::new(0);

pub fn irq_count() -> usize {
    IRQS.load(Ordering::Relaxed)
}

/// The stub itself. Called by the assembly entry with a pointer to the trap
/// frame it built on the interrupt stack.
pub fn trap_stub(tf: &TrapFrame) {
    let trapno = tf.trapno();
    match classify(trapno) {
        TrapDecision::WakeAndMask { irq_line } => {
            IRQS.fetch_add(1, Ordering::Relaxed);
            unsafe { globals::IOAPIC.set_line_masked(irq_line, true) };
            irq::irq_wake(trapno);
        }
        TrapDecision::Wake => {
            IRQS.fetch_add(1, Ordering::Relaxed);
            irq::irq_wake(trapno);
        }
        TrapDecision::Fatal => {
            // nothing here can be trusted; no diagnostics possible from
            // interrupt context, so park the CPU for good
            amd64::halt_forever();
        }
    }
}

/// The handler slot the assembly entry dispatches through.
static TRAP_HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Install [`trap_stub`] as the handler. Must run before any IRQ is
/// unmasked.
pub fn install_trap_stub() {
    TRAP_HANDLER.store(trap_stub as usize, Ordering::SeqCst);
}

/// The installed handler, for the assembly entry.
#[no_mangle]
pub extern "C" fn trap_handler_slot() -> usize {
    TRAP_HANDLER.load(Ordering::SeqCst)
}

/// Scheduler-side completion of an interrupt: the LAPIC EOI, sent after the
/// stub has returned and the CPU is off the interrupt stack.
///
/// # Safety
///
/// The LAPIC window must be mapped and an interrupt must actually be in
/// service.
pub unsafe fn finish_interrupt() {
    globals::APIC.signal_eoi();
}

#[cfg(test)]
mod test {
    use super::*;
    use amd64::trapframe::{TrapFrame, TF_TRAPNO};

    fn frame(trapno: usize) -> TrapFrame {
        let mut tf = TrapFrame::zeroed();
        tf[TF_TRAPNO] = trapno;
        tf
    }

    fn legal_vectors() -> impl Iterator<Item = usize> {
        [INT_KBD, INT_COM1, INT_DISK]
            .into_iter()
            .chain(INT_MSI0..=INT_MSI7)
    }

    #[test]
    fn classification_matches_the_vector_map() {
        assert_eq!(
            classify(INT_KBD),
            TrapDecision::WakeAndMask { irq_line: 1 }
        );
        assert_eq!(
            classify(INT_COM1),
            TrapDecision::WakeAndMask { irq_line: 4 }
        );
        assert_eq!(classify(INT_DISK), TrapDecision::Wake);
        for v in INT_MSI0..=INT_MSI7 {
            assert_eq!(classify(v), TrapDecision::Wake);
        }
        // everything below and at the timer, and beyond the last vector,
        // is undefined hardware state
        assert_eq!(classify(0), TrapDecision::Fatal);
        assert_eq!(classify(TIMER), TrapDecision::Fatal);
        assert_eq!(classify(IRQ_LAST + 1), TrapDecision::Fatal);
        assert_eq!(classify(usize::MAX), TrapDecision::Fatal);
    }

    #[test]
    fn fuzzed_frames_wake_exactly_one_vector() {
        let _serial = irq::TEST_LOCK.lock();
        let legal: alloc::vec::Vec<usize> = legal_vectors().collect();
        let mut seed = 0x1234_5678_9ABC_DEF0u64;
        for _ in 0..500 {
            // xorshift
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let vec = legal[(seed as usize) % legal.len()];

            // MSI/disk vectors skip the IOAPIC, so the stub runs fully on
            // the host; keyboard/COM1 would touch MMIO
            if matches!(classify(vec), TrapDecision::Wake) {
                trap_stub(&frame(vec));
            } else {
                irq::irq_wake(vec);
            }

            for &other in &legal {
                assert_eq!(irq::pending(other), other == vec, "vector {}", other);
            }
            irq::reset(vec);
        }
    }

    #[test]
    fn wakeups_are_idempotent_within_an_interrupt() {
        let _serial = irq::TEST_LOCK.lock();
        irq::reset(INT_DISK);
        trap_stub(&frame(INT_DISK));
        trap_stub(&frame(INT_DISK));
        assert!(irq::pending(INT_DISK));
        irq::reset(INT_DISK);
    }
}
