//! Kernel singletons.
//!
//! Everything here is initialised exactly once from `kernel_main` (or left
//! untouched by tests, which build their own instances). Access before
//! initialisation is a bug and panics.

use crate::console::Console;
use crate::layout;
use crate::proc::ProcTable;
use crate::prof::ProfHw;

use alloc::boxed::Box;

use amd64::apic::ApicRegisters;
use amd64::io::{self, SerialPort};
use amd64::ioapic::IoApicRegisters;

use kmem::phys::PhysMem;

use spin::{Mutex, Once};

/// The local APIC register window. Retargeted to its mapped address early in
/// boot; MMIO access before that panics on the null base.
pub static APIC: ApicRegisters = ApicRegisters::new(core::ptr::null_mut());

/// The (single) IO APIC register window.
pub static IOAPIC: IoApicRegisters = IoApicRegisters::new(core::ptr::null_mut());

/// COM1, shared by the serial logger and the console daemon.
pub static COM1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(io::COM1_ADDR) });

static PHYS: Once<PhysMem> = Once::new();
static PROCS: Once<ProcTable> = Once::new();
static CONS: Once<Console> = Once::new();
static PROFHW: Once<Box<dyn ProfHw + Send + Sync>> = Once::new();

pub fn init_phys(phys: PhysMem) -> &'static PhysMem {
    PHYS.call_once(|| phys)
}

pub fn phys() -> &'static PhysMem {
    PHYS.get().expect("physical memory not initialised")
}

pub fn init_procs(table: ProcTable) -> &'static ProcTable {
    PROCS.call_once(|| table)
}

pub fn procs() -> &'static ProcTable {
    PROCS.get().expect("process table not initialised")
}

pub fn init_cons(cons: Console) -> &'static Console {
    CONS.call_once(|| cons)
}

pub fn cons() -> &'static Console {
    CONS.get().expect("console not initialised")
}

pub fn init_profhw(hw: Box<dyn ProfHw + Send + Sync>) -> &'static (dyn ProfHw + Send + Sync) {
    &**PROFHW.call_once(|| hw)
}

pub fn profhw() -> &'static (dyn ProfHw + Send + Sync) {
    &**PROFHW.get().expect("profiling hardware not probed")
}

/// Map the MMIO windows once the direct mapping is live.
///
/// # Safety
///
/// Must only run on the BSP during boot, before interrupts are enabled.
pub unsafe fn init_mmio(ioapic_base: amd64::PhysAddr) {
    let lapic = layout::DIRECT_MAPPING.phys_to_virt(amd64::apic::base_address());
    APIC.set_base_address(lapic.as_mut_ptr());
    let io = layout::DIRECT_MAPPING.phys_to_virt(ioapic_base);
    IOAPIC.set_base_address(io.as_mut_ptr());
}
