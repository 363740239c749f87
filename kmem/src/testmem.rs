//! Host-backed frame sources for tests.
//!
//! Frames come from one contiguous, page-aligned arena on the host heap, so
//! the allocator's dense frame array lines up the same way it does over real
//! physical memory. The matching direct mapping is the identity, making the
//! "physical" addresses directly dereferenceable in the test process.

use crate::direct::DirectMapping;
use crate::phys::FrameSource;
use crate::PAGE_SIZE;

use alloc::vec;
use alloc::vec::Vec;

use amd64::{Alignable, PhysAddr, VirtAddr};

pub struct HostFrames {
    // kept alive for the duration of the test; frames point into it
    _arena: Vec<u8>,
    base: usize,
    total: usize,
    next: usize,
    skip: Vec<usize>,
    handed: Vec<PhysAddr>,
}

impl HostFrames {
    /// An arena of exactly `pages` frames, no holes.
    pub fn new(pages: usize) -> HostFrames {
        Self::with_holes(pages, &[])
    }

    /// An arena where the frames at the given indices are skipped, the way a
    /// boot environment skips reserved regions. The skipped frames still
    /// occupy address space, producing holes in the page-number span.
    pub fn with_holes(pages: usize, holes: &[usize]) -> HostFrames {
        let arena = vec![0u8; (pages + holes.len() + 1) * PAGE_SIZE];
        let base = (arena.as_ptr() as usize).align_up(PAGE_SIZE);
        HostFrames {
            _arena: arena,
            base,
            total: pages + holes.len(),
            next: 0,
            skip: holes.to_vec(),
            handed: Vec::new(),
        }
    }

    /// Identity mapping wide enough for any host address.
    pub fn direct_map() -> DirectMapping {
        DirectMapping::new(VirtAddr(0), PhysAddr(0), 1 << 47)
    }

    /// Every frame handed out so far, in order.
    pub fn handed_out(&self) -> &[PhysAddr] {
        &self.handed
    }
}

impl FrameSource for HostFrames {
    fn next_phys(&mut self) -> Option<PhysAddr> {
        while self.skip.contains(&self.next) {
            self.next += 1;
        }
        if self.next >= self.total {
            return None;
        }
        let pa = PhysAddr(self.base + self.next * PAGE_SIZE);
        self.next += 1;
        self.handed.push(pa);
        Some(pa)
    }
}
