//! The physical page-frame allocator.
//!
//! A fixed population of frames is reserved from the boot environment once,
//! up front. Each frame is described by a reference count and a free-list
//! link in a dense array indexed by page number; the boot environment may
//! skip holes, whose entries keep a sentinel count and are never handed out.
//!
//! Page-map root pages live on their own list so that walking every process
//! address space is a separate traversal from "all allocated pages".

use crate::direct::DirectMapping;
use crate::err::{KErr, KResult};
use crate::{PageNum, PAGE_SIZE};

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use amd64::PhysAddr;

use core::panic::Location;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

/// Default number of reserved frames: 2^16 pages, 256 MiB.
pub const DEFAULT_RESERVE: usize = 1 << 16;

/// Free-list terminator.
const NIL: u32 = u32::MAX;

/// Reference count of a frame the allocator does not own.
const HOLE: i32 = -10;

/// One free physical page per call, possibly skipping holes. This is the
/// boot contract's page hand-out facility.
pub trait FrameSource {
    fn next_phys(&mut self) -> Option<PhysAddr>;
}

struct Frame {
    refcnt: i32,
    nexti: u32,
}

struct Frames {
    frames: Box<[Frame]>,
    /// Page number of `frames[0]`.
    startn: usize,
    /// Head of the general free list.
    freei: u32,
    /// Head of the page-map root list.
    maps: u32,
    /// Call sites already failed by the injection hook.
    failed_sites: BTreeSet<u64>,
    inject: bool,
}

impl Frames {
    fn idx_of(&self, addr: PhysAddr) -> usize {
        let pgn = PageNum::of(addr).0;
        assert!(pgn >= self.startn, "address below reserved span");
        let idx = pgn - self.startn;
        assert!(idx < self.frames.len(), "address beyond reserved span");
        idx
    }

    fn push_free(&mut self, idx: usize) {
        self.frames[idx].nexti = self.freei;
        self.freei = idx as u32;
    }
}

/// The allocator singleton. All list and count updates happen under one lock;
/// zero-filling happens outside it.
pub struct PhysMem {
    dm: DirectMapping,
    inner: Mutex<Frames>,
    /// Depth of [`PhysMem::nofail_scope`] guards; injection is suppressed
    /// while non-zero.
    nofail: AtomicUsize,
}

impl PhysMem {
    /// Reserve `respgs` frames from the boot environment. The first page
    /// returned anchors the dense array; later pages that fall outside it
    /// stay holes. Gives up early only if the source skips a large part of
    /// the span.
    pub fn reserve(dm: DirectMapping, src: &mut dyn FrameSource, respgs: usize) -> PhysMem {
        let mut frames = Vec::with_capacity(respgs);
        frames.resize_with(respgs, || Frame {
            refcnt: HOLE,
            nexti: NIL,
        });
        let mut frames = frames.into_boxed_slice();

        let first = src.next_phys().expect("boot environment is out of pages");
        let startn = PageNum::of(first).0;
        frames[0].refcnt = 0;
        frames[0].nexti = NIL;

        let mut last = 0usize;
        let mut got = 1usize;
        for _ in 1..respgs {
            let pa = match src.next_phys() {
                Some(pa) => pa,
                None => break,
            };
            let idx = PageNum::of(pa).0 - startn;
            if idx >= respgs {
                // the source skips holes and may run past the span
                let missing = respgs - got;
                assert!(
                    missing <= respgs / 100,
                    "boot environment skipped too many pages"
                );
                break;
            }
            frames[idx].refcnt = 0;
            frames[idx].nexti = NIL;
            frames[last].nexti = idx as u32;
            last = idx;
            got += 1;
        }
        log::info!("reserved {} pages ({} MiB)", got, got >> 8);

        PhysMem {
            dm,
            inner: Mutex::new(Frames {
                frames,
                startn,
                freei: 0,
                maps: NIL,
                failed_sites: BTreeSet::new(),
                inject: false,
            }),
            nofail: AtomicUsize::new(0),
        }
    }

    pub fn direct_map(&self) -> &DirectMapping {
        &self.dm
    }

    /// Allocate a zero-filled frame.
    #[track_caller]
    pub fn alloc(&self) -> KResult<PhysAddr> {
        let pa = self.pop_free(Location::caller())?;
        unsafe { self.page_bytes(pa).fill(0) };
        Ok(pa)
    }

    /// Allocate a frame without zeroing it. For buffers that are fully
    /// overwritten before being read.
    #[track_caller]
    pub fn alloc_nozero(&self) -> KResult<PhysAddr> {
        self.pop_free(Location::caller())
    }

    fn pop_free(&self, caller: &Location) -> KResult<PhysAddr> {
        let mut inner = self.inner.lock();
        if inner.inject && self.nofail.load(Ordering::Relaxed) == 0 {
            let site = site_hash(caller);
            if inner.failed_sites.insert(site) {
                log::warn!("failing allocation at {}:{}", caller.file(), caller.line());
                return Err(KErr::Enomem);
            }
        }
        let idx = inner.freei;
        if idx == NIL {
            return Err(KErr::Enomem);
        }
        let idx = idx as usize;
        debug_assert_eq!(inner.frames[idx].refcnt, 0, "allocated frame on free list");
        inner.freei = inner.frames[idx].nexti;
        inner.frames[idx].nexti = NIL;
        inner.frames[idx].refcnt = 1;
        Ok(PageNum(inner.startn + idx).start_address())
    }

    /// Take another reference to an allocated frame.
    pub fn refup(&self, addr: PhysAddr) {
        let mut inner = self.inner.lock();
        let idx = inner.idx_of(addr);
        let cnt = inner.frames[idx].refcnt;
        assert!(cnt >= 1, "refup of unallocated frame");
        inner.frames[idx].refcnt = cnt + 1;
    }

    /// Drop a reference; the frame returns to the free list when the last
    /// holder lets go. Returns whether the frame was freed.
    pub fn refdown(&self, addr: PhysAddr) -> bool {
        let mut inner = self.inner.lock();
        let idx = inner.idx_of(addr);
        let cnt = inner.frames[idx].refcnt - 1;
        assert!(cnt >= 0, "refdown below zero");
        inner.frames[idx].refcnt = cnt;
        if cnt == 0 {
            inner.push_free(idx);
            true
        } else {
            false
        }
    }

    /// Allocate a zeroed frame and link it onto the page-map root list.
    #[track_caller]
    pub fn alloc_map_root(&self) -> KResult<PhysAddr> {
        let pa = self.pop_free(Location::caller())?;
        unsafe { self.page_bytes(pa).fill(0) };
        let mut inner = self.inner.lock();
        let idx = inner.idx_of(pa);
        inner.frames[idx].nexti = inner.maps;
        inner.maps = idx as u32;
        Ok(pa)
    }

    /// Unlink a page-map root and drop its reference.
    pub fn release_map_root(&self, root: PhysAddr) {
        let mut inner = self.inner.lock();
        let idx = inner.idx_of(root) as u32;
        if inner.maps == idx {
            inner.maps = inner.frames[idx as usize].nexti;
        } else {
            let mut cur = inner.maps;
            while cur != NIL {
                let next = inner.frames[cur as usize].nexti;
                if next == idx {
                    inner.frames[cur as usize].nexti = inner.frames[idx as usize].nexti;
                    break;
                }
                cur = next;
            }
            assert!(cur != NIL, "releasing an unknown map root");
        }
        inner.frames[idx as usize].nexti = NIL;
        drop(inner);
        self.refdown(root);
    }

    /// Snapshot of all live page-map roots, for address-space traversals.
    pub fn map_roots(&self) -> Vec<PhysAddr> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        let mut cur = inner.maps;
        while cur != NIL {
            out.push(PageNum(inner.startn + cur as usize).start_address());
            cur = inner.frames[cur as usize].nexti;
        }
        out
    }

    /// Number of frames currently on the free list.
    pub fn free_count(&self) -> usize {
        let inner = self.inner.lock();
        let mut n = 0;
        let mut cur = inner.freei;
        while cur != NIL {
            n += 1;
            cur = inner.frames[cur as usize].nexti;
        }
        n
    }

    /// The bytes of an allocator-owned frame through the direct mapping.
    ///
    /// # Safety
    ///
    /// `addr` must be a frame this allocator handed out, and the caller must
    /// not create overlapping mutable views of the same frame.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page_bytes(&self, addr: PhysAddr) -> &mut [u8; PAGE_SIZE] {
        &mut *self.dm.phys_to_virt(addr).as_mut_ptr()
    }

    /// Enable or disable allocation-failure injection. Test hook: every
    /// distinct call site of `alloc`/`alloc_nozero`/`alloc_map_root` fails
    /// exactly once while enabled.
    pub fn set_fail_injection(&self, on: bool) {
        self.inner.lock().inject = on;
    }

    /// Suppress failure injection for the lifetime of the guard. Held by
    /// callers that must be able to allocate to make progress, such as
    /// process teardown.
    pub fn nofail_scope(&self) -> NofailGuard<'_> {
        self.nofail.fetch_add(1, Ordering::Relaxed);
        NofailGuard { phys: self }
    }
}

pub struct NofailGuard<'a> {
    phys: &'a PhysMem,
}

impl Drop for NofailGuard<'_> {
    fn drop(&mut self) {
        self.phys.nofail.fetch_sub(1, Ordering::Relaxed);
    }
}

fn site_hash(loc: &Location) -> u64 {
    // FNV-1a over file:line:column
    let mut h: u64 = 0xCBF2_9CE4_8422_2325;
    let mut eat = |b: u8| {
        h ^= b as u64;
        h = h.wrapping_mul(0x100_0000_01B3);
    };
    for b in loc.file().bytes() {
        eat(b);
    }
    for b in loc.line().to_le_bytes() {
        eat(b);
    }
    for b in loc.column().to_le_bytes() {
        eat(b);
    }
    h
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testmem::HostFrames;
    use std::collections::HashSet;

    fn small_phys(pages: usize) -> (PhysMem, HostFrames) {
        let mut src = HostFrames::new(pages);
        let phys = PhysMem::reserve(HostFrames::direct_map(), &mut src, pages);
        (phys, src)
    }

    #[test]
    fn default_population_is_256_mib() {
        assert_eq!(DEFAULT_RESERVE, 1 << 16);
        assert_eq!(DEFAULT_RESERVE * crate::PAGE_SIZE, 256 << 20);
    }

    #[test]
    fn alloc_free_roundtrip() {
        let (phys, _src) = small_phys(8);
        assert_eq!(phys.free_count(), 8);

        let a = phys.alloc().unwrap();
        let b = phys.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(phys.free_count(), 6);

        phys.refdown(a);
        assert_eq!(phys.free_count(), 7);
        // the just-freed frame is the next one handed out
        assert_eq!(phys.alloc().unwrap(), a);
        phys.refdown(a);
        phys.refdown(b);
        assert_eq!(phys.free_count(), 8);
    }

    #[test]
    fn exhaustion_and_reuse() {
        let pages = 512;
        let (phys, _src) = small_phys(pages);
        let mut got = Vec::new();
        for _ in 0..pages {
            got.push(phys.alloc_nozero().unwrap());
        }
        assert_eq!(phys.alloc_nozero().unwrap_err(), KErr::Enomem);

        // no frame handed out twice
        let distinct: HashSet<usize> = got.iter().map(|pa| pa.0).collect();
        assert_eq!(distinct.len(), pages);

        let victim = got[137];
        phys.refdown(victim);
        assert_eq!(phys.alloc_nozero().unwrap(), victim);
    }

    #[test]
    fn random_interleaving_conserves_frames() {
        let pages = 64;
        let (phys, _src) = small_phys(pages);
        let mut live = Vec::new();
        // deterministic LCG so the test is reproducible
        let mut seed = 12345u64;
        for _ in 0..2000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            if seed % 3 == 0 || live.is_empty() {
                if let Ok(pa) = phys.alloc_nozero() {
                    live.push(pa);
                }
            } else {
                let i = (seed as usize / 7) % live.len();
                phys.refdown(live.swap_remove(i));
            }
            assert_eq!(phys.free_count(), pages - live.len());
        }
    }

    #[test]
    fn shared_frame_freed_once() {
        let (phys, _src) = small_phys(4);
        let pa = phys.alloc().unwrap();
        phys.refup(pa);
        assert!(!phys.refdown(pa));
        assert_eq!(phys.free_count(), 3);
        assert!(phys.refdown(pa));
        assert_eq!(phys.free_count(), 4);
    }

    #[test]
    fn holes_are_never_allocated() {
        let pages = 200;
        let mut src = HostFrames::with_holes(pages, &[7, 100]);
        let phys = PhysMem::reserve(HostFrames::direct_map(), &mut src, pages);
        let handed: Vec<_> = src.handed_out().to_vec();
        let mut got = Vec::new();
        while let Ok(pa) = phys.alloc_nozero() {
            got.push(pa);
        }
        // the two hole frames exist in the span but were never handed out,
        // and must never come back out of the allocator
        assert!(got.len() >= pages - 2);
        for pa in &got {
            assert!(handed.contains(pa), "allocator invented frame {:p}", pa);
        }
    }

    #[test]
    fn map_roots_have_their_own_list() {
        let (phys, _src) = small_phys(8);
        let r1 = phys.alloc_map_root().unwrap();
        let r2 = phys.alloc_map_root().unwrap();
        let _plain = phys.alloc().unwrap();
        let roots = phys.map_roots();
        assert_eq!(roots.len(), 2);
        assert!(roots.contains(&r1) && roots.contains(&r2));

        phys.release_map_root(r1);
        assert_eq!(phys.map_roots(), vec![r2]);
        phys.release_map_root(r2);
        assert!(phys.map_roots().is_empty());
    }

    #[test]
    fn zeroed_alloc_is_zeroed() {
        let (phys, _src) = small_phys(4);
        let pa = phys.alloc_nozero().unwrap();
        unsafe { phys.page_bytes(pa).fill(0xAB) };
        phys.refdown(pa);
        let pa2 = phys.alloc().unwrap();
        assert_eq!(pa2, pa);
        assert!(unsafe { phys.page_bytes(pa2) }.iter().all(|&b| b == 0));
    }

    #[test]
    fn injection_fails_each_site_once() {
        let (phys, _src) = small_phys(8);
        phys.set_fail_injection(true);

        fn site_a(phys: &PhysMem) -> KResult<amd64::PhysAddr> {
            phys.alloc()
        }

        assert_eq!(site_a(&phys).unwrap_err(), KErr::Enomem);
        let pa = site_a(&phys).expect("second attempt from the same site succeeds");
        phys.refdown(pa);

        // a whitelisted caller is never failed
        {
            let _guard = phys.nofail_scope();
            let pa = phys.alloc().expect("nofail scope must not inject");
            phys.refdown(pa);
        }
        // ...but a fresh site outside the scope still is
        assert_eq!(phys.alloc_nozero().unwrap_err(), KErr::Enomem);
        phys.set_fail_injection(false);
    }
}
