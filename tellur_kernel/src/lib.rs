//! Boot and runtime core of the tellur research kernel.
//!
//! The boot path runs once on the BSP: probe the platform, take over
//! physical memory, install the trap stub, bring the console and the
//! application processors up, create the first process, and hand the CPU to
//! the task executor. Everything after that is interrupt driven.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate static_assertions;

pub mod circbuf;
pub mod console;
pub mod diagnostics;
pub mod globals;
pub mod heap;
pub mod irq;
pub mod layout;
pub mod panic;
pub mod passfd;
pub mod poll;
pub mod proc;
pub mod prof;
pub mod smp;
pub mod task;
pub mod trap;
pub mod userio;
pub mod vga;

pub mod err {
    pub use kmem::err::{KErr, KResult};
}

use alloc::sync::Arc;

use amd64::{cpuid, PhysAddr};

use kmem::phys::{FrameSource, PhysMem, DEFAULT_RESERVE};
use kmem::PAGE_SIZE;

use crate::console::ConsoleFops;
use crate::proc::{Fd, FdPerms, Proc, ProcTable, SysLimits};
use crate::smp::BootInfo;
use crate::task::Executor;

/// How many APs the kernel will drive. The scheduler width is `1 + APLIM`
/// whether or not that many join.
pub const APLIM: usize = 7;

/// What the loader hands the 64-bit entry point.
#[repr(C)]
pub struct KernelArgs {
    /// Physical address of the saved e820 map.
    pub e820_map: usize,
    /// Physical address of the kernel page-map root.
    pub pmap_root: usize,
    /// One free physical page per call; may skip holes.
    pub get_phys: extern "C" fn() -> usize,
    /// Contiguous span reserved for the early kernel heap.
    pub heap_base: usize,
    pub heap_pages: usize,
    /// CPUs the loader counted while walking the ACPI tables.
    pub ncpu: usize,
    /// Physical base of the (single) IO APIC.
    pub ioapic_base: usize,
    /// The AP real-mode trampoline image.
    pub trampoline_ptr: *const u8,
    pub trampoline_len: usize,
}

struct BootFrames {
    get_phys: extern "C" fn() -> usize,
}

impl FrameSource for BootFrames {
    fn next_phys(&mut self) -> Option<PhysAddr> {
        Some(PhysAddr((self.get_phys)()))
    }
}

static LOGGER: diagnostics::FanOutLogger<diagnostics::SerialLogger, diagnostics::VgaLogger> =
    diagnostics::FanOutLogger(diagnostics::SerialLogger, diagnostics::VgaLogger);

/// Refuse to run on hardware that cannot hold the kernel's baseline
/// assumptions. Missing invariant TSC is only worth a warning; no VM has it.
fn cpu_check() {
    if !cpuid::has_long_mode() {
        panic!("CPU lacks long mode");
    }
    let fm = cpuid::family_model();
    log::info!("CPUID: family {:#x}, model {:#x}", fm.family, fm.model);
    if !cpuid::sysenter_usable() {
        panic!("sysenter not supported");
    }
    if !cpuid::has_invariant_tsc() {
        log::warn!("invariant TSC not supported");
    }
    if !cpuid::has_local_apic() {
        panic!("no local APIC");
    }
}

/// The Rust entry point, called by the assembly boot code in long mode with
/// interrupts disabled.
pub extern "C" fn kernel_main(args: &KernelArgs) -> ! {
    unsafe { vga::init(layout::DIRECT_MAPPING.phys_to_virt(layout::VGA_TEXT)) };
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(log::LevelFilter::Trace))
        .expect("logger installs once");

    log::info!("tellur starting");
    cpu_check();

    // the heap must exist before the frame table can
    unsafe {
        heap::init(
            layout::DIRECT_MAPPING
                .phys_to_virt(PhysAddr(args.heap_base))
                .as_mut_ptr(),
            args.heap_pages * PAGE_SIZE,
        )
    };

    let mut boot_frames = BootFrames {
        get_phys: args.get_phys,
    };
    let phys = globals::init_phys(PhysMem::reserve(
        layout::DIRECT_MAPPING,
        &mut boot_frames,
        DEFAULT_RESERVE,
    ));

    unsafe {
        globals::init_mmio(PhysAddr(args.ioapic_base));
        if !amd64::apic::is_enabled() {
            log::info!("enabling the local APIC");
            amd64::apic::set_enabled(true);
            assert!(amd64::apic::is_enabled(), "APIC would not enable");
        }
        globals::APIC.set_spurious_vector(0xFF, true);
        globals::APIC.set_task_priority(0);
        log::info!("BSP APIC id {:?}", globals::APIC.id());
    }

    globals::init_profhw(prof::probe());

    // must precede any irq_unmask
    trap::install_trap_stub();

    let mut executor = Executor::new();
    let cons = console::console_init(&mut executor);

    let kernel_root = kmem::paging::MapRoot(PhysAddr(args.pmap_root));
    let boot = BootInfo {
        e820_map: args.e820_map,
        pmap_root: PhysAddr(args.pmap_root),
        first_free: PhysAddr((args.get_phys)()),
    };
    let trampoline =
        unsafe { core::slice::from_raw_parts(args.trampoline_ptr, args.trampoline_len) };
    unsafe { smp::cpus_start(phys, kernel_root, &boot, trampoline, args.ncpu, APLIM) };

    let table = globals::init_procs(ProcTable::new(SysLimits::default()));
    let init = spawn_first_proc(table, cons);
    log::info!("first process {:?} ({})", init.pid, init.name);

    executor.run()
}

/// Create the first process with the console wired to fds 0..2. The exec
/// loader takes over from here; until a file system attaches, the working
/// directory is the console device.
pub fn spawn_first_proc(table: &ProcTable, cons: &'static console::Console) -> Arc<Proc> {
    let cwd = Fd::new(Arc::new(ConsoleFops::new(cons)), FdPerms::READ);
    let fds = console::std_fds(cons);
    table
        .proc_new("init", &cwd, &fds)
        .expect("first process fits under any limit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[test]
    fn first_process_gets_console_stdio() {
        let table = ProcTable::new(SysLimits::default());
        let cons: &'static console::Console =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(console::Console::new()));
        let p = spawn_first_proc(&table, cons);
        assert_eq!(p.pid.0, 1);
        assert_eq!(p.tid0.0, 2);
        let fds = p.fds.lock();
        assert!(fds.get(0).unwrap().perms.contains(FdPerms::READ));
        assert!(fds.get(1).unwrap().perms.contains(FdPerms::WRITE));
        assert!(fds.get(2).unwrap().perms.contains(FdPerms::WRITE));
        assert_eq!(fds.count(), 3);
    }

    /// A driver-shaped task: wait for the vector, probe, service. Checks
    /// that an IRQ wakeup travels from the stub's wake slot through the
    /// executor into a parked task.
    #[test]
    fn irq_wakeup_reaches_a_parked_driver() {
        use core::sync::atomic::{AtomicUsize, Ordering};

        let _serial = irq::TEST_LOCK.lock();
        static SERVICED: AtomicUsize = AtomicUsize::new(0);
        SERVICED.store(0, Ordering::SeqCst);
        irq::reset(irq::INT_MSI3);

        let mut ex = Executor::new();
        ex.spawn(Task::new(async {
            loop {
                irq::irq_wait(irq::INT_MSI3).await;
                if SERVICED.fetch_add(1, Ordering::SeqCst) == 1 {
                    break;
                }
            }
        }));

        ex.run_until_idle();
        assert_eq!(SERVICED.load(Ordering::SeqCst), 0, "no interrupt yet");

        irq::irq_wake(irq::INT_MSI3);
        ex.run_until_idle();
        assert_eq!(SERVICED.load(Ordering::SeqCst), 1);

        irq::irq_wake(irq::INT_MSI3);
        ex.run_until_idle();
        assert_eq!(SERVICED.load(Ordering::SeqCst), 2);
        assert_eq!(ex.live_tasks(), 0);
    }
}
