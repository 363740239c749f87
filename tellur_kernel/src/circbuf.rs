//! Single-owner circular buffer over one page.
//!
//! `head` and `tail` only ever grow; wraparound is computed with modulo at
//! the access sites, which keeps "empty" (`head == tail`) and "full"
//! (`head - tail == size`) unambiguous without a spare slot. The backing
//! page is acquired lazily on first use so buffers can be created long
//! before memory pressure is known, and must be released explicitly.
//!
//! Not thread safe: one daemon owns the buffer and serialises access.

use crate::err::KResult;
use crate::userio::UserIo;

use amd64::PhysAddr;

use kmem::phys::PhysMem;
use kmem::PAGE_SIZE;

pub struct CircBuf {
    store: Option<PhysAddr>,
    size: usize,
    head: usize,
    tail: usize,
}

impl CircBuf {
    /// A buffer of `size` bytes, at most one page. No memory is acquired
    /// yet; the first transfer does that.
    pub fn new(size: usize) -> CircBuf {
        assert!(size > 0 && size <= PAGE_SIZE, "bad circbuf size");
        CircBuf {
            store: None,
            size,
            head: 0,
            tail: 0,
        }
    }

    /// A buffer over an explicitly provided page, for callers that must
    /// guarantee transfers cannot fail on allocation. Takes a reference on
    /// the page.
    pub fn with_page(phys: &PhysMem, page: PhysAddr, size: usize) -> CircBuf {
        assert!(size > 0 && size <= PAGE_SIZE, "bad circbuf size");
        phys.refup(page);
        CircBuf {
            store: Some(page),
            size,
            head: 0,
            tail: 0,
        }
    }

    /// Acquire the backing page if it is still missing. Failure surfaces
    /// here, at the first transfer, not at construction.
    pub fn ensure(&mut self, phys: &PhysMem) -> KResult<()> {
        if self.store.is_some() {
            return Ok(());
        }
        self.store = Some(phys.alloc_nozero()?);
        Ok(())
    }

    /// Drop the backing page and reset the counters. The owner calls this
    /// exactly once when the buffer's life is over; the buffer can be
    /// revived afterwards by the next `ensure`.
    pub fn release(&mut self, phys: &PhysMem) {
        if let Some(page) = self.store.take() {
            phys.refdown(page);
        }
        self.head = 0;
        self.tail = 0;
    }

    pub fn full(&self) -> bool {
        self.head - self.tail == self.size
    }

    pub fn empty(&self) -> bool {
        self.head == self.tail
    }

    /// Bytes of free space.
    pub fn left(&self) -> usize {
        self.size - (self.head - self.tail)
    }

    /// Bytes queued.
    pub fn used(&self) -> usize {
        self.head - self.tail
    }

    fn buf<'a>(&self, phys: &'a PhysMem) -> &'a mut [u8] {
        let page = self.store.expect("circbuf used before ensure");
        &mut (unsafe { phys.page_bytes(page) })[..self.size]
    }

    /// Fill the buffer from `src`. Returns the bytes absorbed; zero when
    /// full. The counters advance only by what `src` actually produced.
    pub fn copy_in(&mut self, phys: &PhysMem, src: &mut dyn UserIo) -> KResult<usize> {
        self.ensure(phys)?;
        if self.full() {
            return Ok(0);
        }
        let buf = self.buf(phys);
        let hi = self.head % self.size;
        let ti = self.tail % self.size;
        let mut c = 0;
        // no wraparound: one contiguous region up to the end of the ring
        if ti <= hi {
            let dst = &mut buf[hi..];
            let did = src.read(dst)?;
            if did != dst.len() {
                self.head += did;
                return Ok(did);
            }
            c += did;
        }
        let hi = (self.head + c) % self.size;
        debug_assert!(hi <= ti);
        let did = src.read(&mut buf[hi..ti])?;
        c += did;
        self.head += c;
        Ok(c)
    }

    /// Drain the buffer into `dst`.
    pub fn copy_out(&mut self, phys: &PhysMem, dst: &mut dyn UserIo) -> KResult<usize> {
        self.copy_out_n(phys, dst, usize::MAX)
    }

    /// Drain at most `max` bytes into `dst`. Short transfers advance `tail`
    /// by exactly the bytes the destination absorbed.
    pub fn copy_out_n(
        &mut self,
        phys: &PhysMem,
        dst: &mut dyn UserIo,
        max: usize,
    ) -> KResult<usize> {
        self.ensure(phys)?;
        if self.empty() || max == 0 {
            return Ok(0);
        }
        let buf = self.buf(phys);
        let hi = self.head % self.size;
        let ti = self.tail % self.size;
        let mut c = 0;
        // queued data wraps: drain the tail half first
        if hi <= ti {
            let src = &buf[ti..];
            let take = src.len().min(max);
            let did = dst.write(&src[..take])?;
            if did != src.len() || did == max {
                self.tail += did;
                return Ok(did);
            }
            c += did;
        }
        let ti = (self.tail + c) % self.size;
        debug_assert!(ti <= hi);
        let src = &buf[ti..hi];
        let take = src.len().min(max - c);
        let did = dst.write(&src[..take])?;
        c += did;
        self.tail += c;
        Ok(c)
    }

    /// Borrow the free-space window `[head+offset, head+offset+sz)` as one
    /// or two slices aliasing the ring. The window must be disjoint from the
    /// queued data; the caller commits with [`CircBuf::adv_head`]. This is
    /// the zero-copy path protocol drivers fill directly.
    pub fn raw_write<'a>(
        &mut self,
        phys: &'a PhysMem,
        offset: usize,
        sz: usize,
    ) -> (&'a mut [u8], &'a mut [u8]) {
        assert!(self.store.is_some(), "raw access requires a backing page");
        assert!(self.left() >= offset + sz, "window exceeds free space");
        if sz == 0 {
            return (&mut [], &mut []);
        }
        let buf = self.buf(phys);
        let oi = (self.head + offset) % self.size;
        let oe = (self.head + offset + sz) % self.size;
        let hi = self.head % self.size;
        let ti = self.tail % self.size;
        if ti <= hi {
            // queued data is contiguous; the window must avoid [ti, hi)
            debug_assert!(!(oi >= ti && oi < hi) && !(oe > ti && oe <= hi));
            let (low, high) = buf.split_at_mut(oi);
            if high.len() >= sz {
                (&mut high[..sz], &mut [])
            } else {
                (high, &mut low[..oe])
            }
        } else {
            // queued data wraps; the free window sits inside [hi, ti)
            debug_assert!(oi >= hi && oi < ti && oe > hi && oe <= ti);
            (&mut buf[oi..oe], &mut [])
        }
    }

    /// Publish `sz` bytes written through [`CircBuf::raw_write`].
    pub fn adv_head(&mut self, sz: usize) {
        assert!(self.left() >= sz, "advancing past free space");
        self.head += sz;
    }

    /// Borrow the queued data from `tail+offset` up to `head` as one or two
    /// slices. The caller consumes with [`CircBuf::adv_tail`].
    pub fn raw_read<'a>(&mut self, phys: &'a PhysMem, offset: usize) -> (&'a [u8], &'a [u8]) {
        assert!(self.store.is_some(), "raw access requires a backing page");
        assert!(self.used() >= offset, "offset beyond queued data");
        if self.used() == offset {
            return (&[], &[]);
        }
        let buf = self.buf(phys);
        let oi = (self.tail + offset) % self.size;
        let hi = self.head % self.size;
        let ti = self.tail % self.size;
        if ti < hi {
            debug_assert!(oi >= ti && oi < hi);
            (&buf[oi..hi], &[])
        } else if oi >= ti {
            // data wraps and the offset is still in the tail half
            (&buf[oi..], &buf[..hi])
        } else {
            (&buf[oi..hi], &[])
        }
    }

    /// Consume `sz` bytes read through [`CircBuf::raw_read`].
    pub fn adv_tail(&mut self, sz: usize) {
        assert!(sz == 0 || self.used() >= sz, "advancing past queued data");
        self.tail += sz;
    }
}
