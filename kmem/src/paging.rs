//! Four-level page tables built from allocator frames.
//!
//! Table pages are reached through the direct mapping, so these routines work
//! on any address space, not just the active one. Intermediate tables are
//! allocated on demand; user-visible leaves hold allocator references that
//! are dropped again by [`unmap_user`].

use crate::err::{KErr, KResult};
use crate::phys::PhysMem;
use crate::{PAGE_SHIFT, PAGE_SIZE};

use amd64::{Alignable, PhysAddr, VirtAddr};

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        /// Cache-disable, required for MMIO mappings such as the LAPIC page.
        const PCD = 1 << 4;
    }
}

/// Mask of the physical-address bits in a table entry.
const PTE_ADDR: u64 = 0x000F_FFFF_FFFF_F000;

/// Bits of virtual address translated per table level.
const INDEX_BITS: u32 = 9;

const ENTRIES: usize = PAGE_SIZE / 8;

/// The root of a page-map hierarchy.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub struct MapRoot(pub PhysAddr);

/// Index into the table at `level` (0 = leaf tables, 3 = root).
pub fn index_at_level(level: u32, va: VirtAddr) -> usize {
    (va.0 >> (PAGE_SHIFT + INDEX_BITS * level)) & (ENTRIES - 1)
}

unsafe fn table_mut<'a>(phys: &'a PhysMem, table: PhysAddr) -> &'a mut [u64; ENTRIES] {
    &mut *phys.direct_map().phys_to_virt(table).as_mut_ptr()
}

/// Allocate an empty address space and register its root on the page-map
/// list.
pub fn create_root(phys: &PhysMem) -> KResult<MapRoot> {
    phys.alloc_map_root().map(MapRoot)
}

/// Map one 4 KiB page. Fails with `EINVAL` if the slot is already mapped and
/// with `ENOMEM` if an intermediate table cannot be allocated.
pub fn map_page(
    phys: &PhysMem,
    root: MapRoot,
    va: VirtAddr,
    pa: PhysAddr,
    flags: PteFlags,
) -> KResult<()> {
    assert!(va.is_aligned(PAGE_SIZE) && pa.is_aligned(PAGE_SIZE));
    let mut table = root.0;
    for level in (1..=3).rev() {
        let entry = unsafe { &mut table_mut(phys, table)[index_at_level(level, va)] };
        if *entry & PteFlags::PRESENT.bits() == 0 {
            let fresh = phys.alloc()?;
            *entry = fresh.0 as u64
                | (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER).bits();
        }
        table = PhysAddr((*entry & PTE_ADDR) as usize);
    }
    let leaf = unsafe { &mut table_mut(phys, table)[index_at_level(0, va)] };
    if *leaf & PteFlags::PRESENT.bits() != 0 {
        return Err(KErr::Einval);
    }
    *leaf = pa.0 as u64 | (flags | PteFlags::PRESENT).bits();
    Ok(())
}

/// Walk the tables for `va`; `None` when any level is not present.
pub fn resolve(phys: &PhysMem, root: MapRoot, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
    let mut table = root.0;
    for level in (1..=3).rev() {
        let entry = unsafe { table_mut(phys, table)[index_at_level(level, va)] };
        if entry & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        table = PhysAddr((entry & PTE_ADDR) as usize);
    }
    let leaf = unsafe { table_mut(phys, table)[index_at_level(0, va)] };
    if leaf & PteFlags::PRESENT.bits() == 0 {
        return None;
    }
    Some((
        PhysAddr((leaf & PTE_ADDR) as usize),
        PteFlags::from_bits_truncate(leaf),
    ))
}

/// Number of user-present table pages and leaves below `root`. Used by the
/// page accounting diagnostics.
pub fn count_user_pages(phys: &PhysMem, root: MapRoot) -> usize {
    count_rec(phys, root.0, 3)
}

fn count_rec(phys: &PhysMem, table: PhysAddr, level: u32) -> usize {
    let user_present = (PteFlags::PRESENT | PteFlags::USER).bits();
    let mut n = 0;
    for i in 0..ENTRIES {
        let entry = unsafe { table_mut(phys, table)[i] };
        if entry & user_present == user_present {
            n += 1;
            if level > 0 {
                n += count_rec(phys, PhysAddr((entry & PTE_ADDR) as usize), level - 1);
            }
        }
    }
    n
}

/// Tear down every user mapping below `root`, dropping the reference each
/// leaf holds and freeing the intermediate tables, then release the root.
pub fn unmap_user(phys: &PhysMem, root: MapRoot) {
    unmap_rec(phys, root.0, 3);
    phys.release_map_root(root.0);
}

fn unmap_rec(phys: &PhysMem, table: PhysAddr, level: u32) {
    let user_present = (PteFlags::PRESENT | PteFlags::USER).bits();
    for i in 0..ENTRIES {
        let entry = unsafe { table_mut(phys, table)[i] };
        if entry & user_present != user_present {
            continue;
        }
        let child = PhysAddr((entry & PTE_ADDR) as usize);
        if level > 0 {
            unmap_rec(phys, child, level - 1);
        }
        phys.refdown(child);
        unsafe { table_mut(phys, table)[i] = 0 };
    }
}
