//! Application-processor bring-up.
//!
//! The BSP parks boot parameters in the secret-storage page, copies the
//! real-mode trampoline below 1 MiB, and kicks the APs with the
//! INIT/STARTUP sequence. APs count themselves in, spin on the proceed word
//! until their stacks exist, and then enter [`ap_entry`].

use crate::err::KResult;
use crate::layout;
use crate::task;

use amd64::apic::{DeliveryMode, DestShorthand, IcrLow, TriggerMode};
use amd64::{dt, pit, PhysAddr};

use kmem::paging::{self, MapRoot, PteFlags};
use kmem::phys::PhysMem;
use kmem::PAGE_SIZE;

use core::sync::atomic::{AtomicUsize, Ordering};

/// The parameter block the AP trampoline reads, at physical
/// [`layout::SECRET_STORAGE`]. Field order is the trampoline's contract.
#[repr(C)]
pub struct SecretStorage {
    pub e820_map: AtomicUsize,
    pub pmap_root: AtomicUsize,
    pub first_free: AtomicUsize,
    /// Long-mode entry the trampoline jumps to.
    pub ap_entry: AtomicUsize,
    pub gdt_lo: AtomicUsize,
    pub gdt_hi: AtomicUsize,
    pub idt_lo: AtomicUsize,
    pub idt_hi: AtomicUsize,
    /// Incremented by each AP as it arrives.
    pub ap_count: AtomicUsize,
    /// Stack pool base; each AP claims a window.
    pub stack_base: AtomicUsize,
    /// Written last by the BSP; APs hold in the trampoline until it is
    /// non-zero.
    pub proceed: AtomicUsize,
}

assert_eq_size!(SecretStorage, [usize; 11]);

const_assert_eq!(core::mem::offset_of!(SecretStorage, ap_entry), 3 * 8);
const_assert_eq!(core::mem::offset_of!(SecretStorage, gdt_lo), 4 * 8);
const_assert_eq!(core::mem::offset_of!(SecretStorage, idt_lo), 6 * 8);
const_assert_eq!(core::mem::offset_of!(SecretStorage, ap_count), 8 * 8);
const_assert_eq!(core::mem::offset_of!(SecretStorage, stack_base), 9 * 8);
const_assert_eq!(core::mem::offset_of!(SecretStorage, proceed), 10 * 8);

impl SecretStorage {
    /// The block at its fixed physical location.
    ///
    /// # Safety
    ///
    /// The page must be identity/direct mapped and no longer used by the
    /// bootloader.
    pub unsafe fn at(dm: &kmem::direct::DirectMapping) -> &'static SecretStorage {
        &*dm.phys_to_virt(layout::SECRET_STORAGE).as_ptr()
    }
}

/// Boot parameters forwarded to the APs.
pub struct BootInfo {
    pub e820_map: usize,
    pub pmap_root: PhysAddr,
    pub first_free: PhysAddr,
}

/// What a given CPU/limit configuration results in.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub struct SmpPlan {
    /// Scheduler worker width, fixed before any AP runs.
    pub width: usize,
    /// APs that can actually join: the machine has `ncpu - 1`, the limit
    /// caps them.
    pub expected_aps: usize,
}

pub fn plan(ncpu: usize, aplim: usize) -> SmpPlan {
    SmpPlan {
        width: 1 + aplim,
        expected_aps: (ncpu - 1).min(aplim),
    }
}

/// Map the interrupt and NMI stacks for `apcnt` APs, leaving the guard page
/// after each unmapped.
pub fn map_ap_stacks(phys: &PhysMem, root: MapRoot, apcnt: usize) -> KResult<()> {
    for ap in 0..apcnt {
        let window = layout::ap_stack_window(ap);
        for stack in [0usize, 2] {
            let frame = phys.alloc()?;
            paging::map_page(
                phys,
                root,
                window + stack * PAGE_SIZE,
                frame,
                PteFlags::WRITABLE,
            )?;
            // the adjacent guard page must stay unmapped
            debug_assert!(paging::resolve(phys, root, window + (stack + 1) * PAGE_SIZE).is_none());
        }
    }
    Ok(())
}

/// C entry of an AP, reached from the trampoline with a logical id (from 1)
/// and interrupts still cleared. Per-CPU state was set up on the way here;
/// all that is left is to open interrupts and wait for the timer to pull
/// this CPU into the scheduler.
pub extern "C" fn ap_entry(_myid: usize) -> ! {
    let fl = amd64::interrupts::push_cli();
    amd64::interrupts::pop_cli(fl | amd64::interrupts::FLAGS_IF);
    loop {
        amd64::hlt();
    }
}

/// Bring the application processors up. Runs once, on the BSP, after the
/// trap stub is installed.
///
/// # Safety
///
/// Issues INIT/STARTUP IPIs and rewrites low physical memory; the machine
/// must be in the single-CPU boot state.
pub unsafe fn cpus_start(
    phys: &PhysMem,
    kernel_root: MapRoot,
    boot: &BootInfo,
    trampoline: &[u8],
    ncpu: usize,
    aplim: usize,
) {
    let plan = plan(ncpu, aplim);
    // the width is fixed before any AP can possibly run
    task::set_width(plan.width);

    log::info!("found {} CPUs", ncpu);
    if ncpu <= 1 {
        log::info!("uniprocessor");
        return;
    }

    let dm = phys.direct_map();

    // the APs start in real mode, so their code must sit below 1 MiB;
    // the old bootloader pages are free for reuse by now
    assert!(layout::TRAMPOLINE.0 + trampoline.len() < 0x10_0000);
    core::ptr::copy_nonoverlapping(
        trampoline.as_ptr(),
        dm.phys_to_virt(layout::TRAMPOLINE).as_mut_ptr::<u8>(),
        trampoline.len(),
    );

    let ss = SecretStorage::at(dm);
    ss.e820_map.store(boot.e820_map, Ordering::SeqCst);
    ss.pmap_root.store(boot.pmap_root.0, Ordering::SeqCst);
    ss.first_free.store(boot.first_free.0, Ordering::SeqCst);
    ss.ap_entry.store(ap_entry as usize, Ordering::SeqCst);
    let (lo, hi) = dt::sgdt().as_words();
    ss.gdt_lo.store(lo, Ordering::SeqCst);
    ss.gdt_hi.store(hi, Ordering::SeqCst);
    let (lo, hi) = dt::sidt().as_words();
    ss.idt_lo.store(lo, Ordering::SeqCst);
    ss.idt_hi.store(hi, Ordering::SeqCst);
    ss.ap_count.store(0, Ordering::SeqCst);
    ss.stack_base.store(layout::AP_STACK_BASE.0, Ordering::SeqCst);
    ss.proceed.store(0, Ordering::SeqCst);

    let apic = &crate::globals::APIC;
    assert!(apic.base_address_valid(), "LAPIC window not mapped");
    assert!(apic.version() >= 0x10, "discrete 82489DX LAPICs unsupported");

    // Only one STARTUP IPI is accepted after RESET/INIT assertion, and the
    // firmware has usually spent it, so assert INIT first. The deassert
    // step is unnecessary on integrated (version >= 1.x) LAPICs.
    apic.send_ipi(
        0,
        IcrLow::new(
            DestShorthand::AllButSelf,
            TriggerMode::Edge,
            true,
            DeliveryMode::Init,
            0,
        ),
    );
    pit::busy_sleep_ms(10);

    let vector = (layout::TRAMPOLINE.0 >> 12) as u8;
    let startup = IcrLow::new(
        DestShorthand::AllButSelf,
        TriggerMode::Edge,
        true,
        DeliveryMode::Startup,
        vector,
    );
    apic.send_ipi(0, startup);
    pit::busy_sleep_ms(10);
    apic.send_ipi(0, startup);

    // generous settle time for every AP to count itself in
    pit::busy_sleep_ms(500);

    let arrived = ss.ap_count.load(Ordering::SeqCst);
    let joined = arrived.min(aplim);

    map_ap_stacks(phys, kernel_root, joined).expect("AP stacks must map");

    // publish only after the stacks exist; the trampolines hold until then
    ss.proceed.store(joined, Ordering::SeqCst);

    log::info!("{} APs found ({} joined)", arrived, joined);
}

#[cfg(test)]
mod tests {
    use super::*;
    use amd64::VirtAddr;
    use kmem::testmem::HostFrames;

    #[test]
    fn four_cpus_with_limit_seven() {
        let p = plan(4, 7);
        assert_eq!(p.width, 8);
        assert_eq!(p.expected_aps, 3);
    }

    #[test]
    fn limit_clamps_a_big_machine() {
        let p = plan(64, 7);
        assert_eq!(p.width, 8);
        assert_eq!(p.expected_aps, 7);
    }

    #[test]
    fn uniprocessor_plan() {
        let p = plan(1, 7);
        assert_eq!(p.expected_aps, 0);
        assert_eq!(p.width, 8);
    }

    #[test]
    fn ap_stacks_map_with_guards() {
        let mut src = HostFrames::new(128);
        let phys = PhysMem::reserve(HostFrames::direct_map(), &mut src, 128);
        let root = paging::create_root(&phys).unwrap();

        map_ap_stacks(&phys, root, 3).unwrap();

        for ap in 0..3 {
            let base = layout::ap_stack_window(ap);
            assert_eq!(base.0, 0xA1_0000_4000 + ap * 0x4000);
            // interrupt stack and NMI stack are mapped writable
            for stack in [0usize, 2] {
                let (_, flags) =
                    paging::resolve(&phys, root, base + stack * PAGE_SIZE).expect("stack mapped");
                assert!(flags.contains(PteFlags::WRITABLE));
            }
            // both guard pages are holes
            for guard in [1usize, 3] {
                assert!(paging::resolve(&phys, root, base + guard * PAGE_SIZE).is_none());
            }
        }
        // no fourth window was touched
        assert!(paging::resolve(&phys, root, layout::ap_stack_window(3)).is_none());
    }

    #[test]
    fn secret_storage_is_eleven_words() {
        assert_eq!(core::mem::size_of::<SecretStorage>(), 11 * 8);
    }

    #[test]
    fn stack_windows_match_the_trampoline_stride() {
        // each AP claims interrupt stack, guard, NMI stack, guard
        assert_eq!(layout::AP_STACK_SPAN, 0x4000);
        let va: VirtAddr = layout::ap_stack_window(2);
        assert_eq!(va.0, 0xA1_0000_4000 + 2 * 0x4000);
    }
}
