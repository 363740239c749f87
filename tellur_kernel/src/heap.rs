//! Kernel heap, fed from physical frames during boot.

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;

#[cfg(not(test))]
#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

/// Seed the allocator with a contiguous span of frames.
///
/// # Safety
///
/// `start..start + size` must be mapped, unused memory, and this must run
/// once, before the first allocation.
#[cfg(not(test))]
pub unsafe fn init(start: *mut u8, size: usize) {
    HEAP.lock().init(start, size);
}

#[cfg(test)]
pub unsafe fn init(_start: *mut u8, _size: usize) {
    // the host allocator serves tests
}
