//! Fixed addresses of the kernel memory layout and boot handshake.

use amd64::{PhysAddr, VirtAddr};
use kmem::direct::DirectMapping;
use kmem::PAGE_SIZE;

/// Physical page the AP real-mode trampoline is copied to. Must be below
/// 1 MiB and page aligned; the STARTUP vector encodes it as `addr >> 12`.
pub const TRAMPOLINE: PhysAddr = PhysAddr(0x8000);

/// Physical address of the secret-storage parameter block (the old
/// bootloader page, free once the kernel runs).
pub const SECRET_STORAGE: PhysAddr = PhysAddr(0x7C00);

/// Physical address of the LAPIC register window. The boot contract maps it
/// with caching disabled.
pub const LAPIC_MMIO: PhysAddr = PhysAddr(0xFEE0_0000);

/// Physical address of the VGA text buffer.
pub const VGA_TEXT: PhysAddr = PhysAddr(0xB_8000);

/// Base of the per-CPU interrupt/NMI stack area. The BSP owns the first
/// four pages; AP stacks follow at [`AP_STACK_BASE`].
pub const BSP_STACK_BASE: VirtAddr = VirtAddr(0xA1_0000_0000);

/// First AP stack page. Each AP owns a window of [`AP_STACK_SPAN`] bytes:
/// interrupt stack, guard, NMI stack, guard.
pub const AP_STACK_BASE: VirtAddr = VirtAddr(0xA1_0000_4000);

/// Bytes of stack window per AP: two mapped stacks, each with an unmapped
/// guard page after it.
pub const AP_STACK_SPAN: usize = 4 * PAGE_SIZE;

/// The boot path identity-maps all the physical memory the kernel manages,
/// so translation is the identity.
pub const DIRECT_MAPPING: DirectMapping =
    DirectMapping::new(VirtAddr(0), PhysAddr(0), 1 << 47);

/// Stack window of AP number `ap` (numbering from 0).
pub fn ap_stack_window(ap: usize) -> VirtAddr {
    VirtAddr(AP_STACK_BASE.0 + ap * AP_STACK_SPAN)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ap_stack_windows_are_disjoint() {
        assert_eq!(ap_stack_window(0).0, 0xA1_0000_4000);
        assert_eq!(ap_stack_window(1).0, 0xA1_0000_8000);
        assert_eq!(ap_stack_window(2) - ap_stack_window(1), AP_STACK_SPAN);
        // the first AP window starts right after the BSP's four pages
        assert_eq!(ap_stack_window(0) - BSP_STACK_BASE, AP_STACK_SPAN);
    }
}
