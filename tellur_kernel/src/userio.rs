//! Copying bytes between kernel space and user space.
//!
//! Every such copy goes through the [`UserIo`] capability set, so code that
//! moves data (pipes, sockets, the console) never sees raw user pointers.
//! Implementations over real user memory check the owning process's page
//! tables under its VM lock; a fault surfaces as `EFAULT` when no progress
//! was possible and as a short transfer otherwise.

use crate::err::{KErr, KResult};

use alloc::vec::Vec;

use amd64::{Alignable, VirtAddr};

use kmem::paging::{self, MapRoot, PteFlags};
use kmem::phys::PhysMem;
use kmem::PAGE_SIZE;

use spin::Mutex;

/// Maximum number of iovec entries accepted from user space.
pub const UIO_MAXIOV: usize = 10;

/// Lowest user-space address handed out by mmap.
pub const USER_MIN: usize = 0x40_0000;

/// A process's view of its address space: the page-map root plus the mmap
/// placement hint, guarded by the lock every user-memory copy takes.
pub struct Vm {
    inner: Mutex<VmInner>,
}

struct VmInner {
    root: Option<MapRoot>,
    mmap_hint: usize,
}

impl Vm {
    pub fn new() -> Vm {
        Vm {
            inner: Mutex::new(VmInner {
                root: None,
                mmap_hint: USER_MIN,
            }),
        }
    }

    pub fn with_root(root: MapRoot) -> Vm {
        let vm = Vm::new();
        vm.inner.lock().root = Some(root);
        vm
    }

    pub fn root(&self) -> Option<MapRoot> {
        self.inner.lock().root
    }

    pub fn set_root(&self, root: MapRoot) {
        self.inner.lock().root = Some(root);
    }

    pub fn mmap_hint(&self) -> usize {
        self.inner.lock().mmap_hint
    }

    pub fn bump_mmap_hint(&self, len: usize) -> usize {
        let mut inner = self.inner.lock();
        let hint = inner.mmap_hint;
        inner.mmap_hint = (hint + len).align_up(PAGE_SIZE);
        hint
    }

    /// Release every user mapping and the root itself.
    pub fn teardown(&self, phys: &PhysMem) {
        let root = self.inner.lock().root.take();
        if let Some(root) = root {
            paging::unmap_user(phys, root);
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// The rest of the user page containing `uva`, or `None` if the page is not
/// mapped with the needed permissions. Caller holds the VM lock.
fn user_window<'p>(
    phys: &'p PhysMem,
    root: MapRoot,
    uva: usize,
    writable: bool,
) -> Option<&'p mut [u8]> {
    let va = VirtAddr(uva.align_down(PAGE_SIZE));
    let mut needed = PteFlags::PRESENT | PteFlags::USER;
    if writable {
        needed |= PteFlags::WRITABLE;
    }
    match paging::resolve(phys, root, va) {
        Some((pa, flags)) if flags.contains(needed) => {
            let page = unsafe { phys.page_bytes(pa) };
            Some(&mut page[uva - va.0..])
        }
        _ => None,
    }
}

/// Copy a kernel slice into user memory. Returns the bytes done; `EFAULT`
/// only when no progress was possible.
fn vm_write(phys: &PhysMem, root: Option<MapRoot>, uva: usize, src: &[u8]) -> KResult<usize> {
    let root = root.ok_or(KErr::Efault)?;
    let mut done = 0;
    while done < src.len() {
        let window = match user_window(phys, root, uva + done, true) {
            Some(w) => w,
            None => return if done == 0 { Err(KErr::Efault) } else { Ok(done) },
        };
        let chunk = window.len().min(src.len() - done);
        window[..chunk].copy_from_slice(&src[done..done + chunk]);
        done += chunk;
    }
    Ok(done)
}

/// Copy user memory into a kernel slice; same fault contract as
/// [`vm_write`].
fn vm_read(phys: &PhysMem, root: Option<MapRoot>, uva: usize, dst: &mut [u8]) -> KResult<usize> {
    let root = root.ok_or(KErr::Efault)?;
    let mut done = 0;
    while done < dst.len() {
        let window = match user_window(phys, root, uva + done, false) {
            Some(w) => w,
            None => return if done == 0 { Err(KErr::Efault) } else { Ok(done) },
        };
        let chunk = window.len().min(dst.len() - done);
        dst[done..done + chunk].copy_from_slice(&window[..chunk]);
        done += chunk;
    }
    Ok(done)
}

/// Read one little-endian machine word from user memory.
fn vm_read_word(phys: &PhysMem, root: Option<MapRoot>, uva: usize) -> KResult<usize> {
    let mut raw = [0u8; 8];
    if vm_read(phys, root, uva, &mut raw)? != 8 {
        return Err(KErr::Efault);
    }
    Ok(usize::from_le_bytes(raw))
}

/// The capability set all byte-moving kernel code is written against.
pub trait UserIo {
    /// Copy `src` into the buffer (towards user space). Short transfers are
    /// a first-class outcome, not an error.
    fn write(&mut self, src: &[u8]) -> KResult<usize>;
    /// Copy out of the buffer (from user space) into `dst`.
    fn read(&mut self, dst: &mut [u8]) -> KResult<usize>;
    /// Unconsumed bytes remaining.
    fn remain(&self) -> usize;
    /// The size the buffer started with.
    fn total(&self) -> usize;
}

/// A buffer that accepts and produces nothing. For callers that must pass a
/// buffer shape but want to ignore it.
pub struct NilBuf;

impl UserIo for NilBuf {
    fn write(&mut self, _src: &[u8]) -> KResult<usize> {
        Ok(0)
    }

    fn read(&mut self, _dst: &mut [u8]) -> KResult<usize> {
        Ok(0)
    }

    fn remain(&self) -> usize {
        0
    }

    fn total(&self) -> usize {
        0
    }
}

/// Kernel memory dressed up as a [`UserIo`], so kernel-internal callers can
/// reuse the user-facing code paths (reading an ELF header for exec, and
/// the like). A cursor advances over the slice on each partial transfer.
pub struct KernelBuf<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> KernelBuf<'a> {
    pub fn new(buf: &'a mut [u8]) -> KernelBuf<'a> {
        KernelBuf { buf, pos: 0 }
    }
}

impl UserIo for KernelBuf<'_> {
    fn write(&mut self, src: &[u8]) -> KResult<usize> {
        let room = &mut self.buf[self.pos..];
        let n = room.len().min(src.len());
        room[..n].copy_from_slice(&src[..n]);
        self.pos += n;
        Ok(n)
    }

    fn read(&mut self, dst: &mut [u8]) -> KResult<usize> {
        let left = &self.buf[self.pos..];
        let n = left.len().min(dst.len());
        dst[..n].copy_from_slice(&left[..n]);
        self.pos += n;
        Ok(n)
    }

    fn remain(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn total(&self) -> usize {
        self.buf.len()
    }
}

/// A user pointer plus length, validated against the owner's page tables on
/// every transfer.
pub struct UserBuf<'a> {
    phys: &'a PhysMem,
    vm: &'a Vm,
    uva: usize,
    left: usize,
    total: usize,
}

impl<'a> UserBuf<'a> {
    pub fn new(phys: &'a PhysMem, vm: &'a Vm, uva: usize, len: usize) -> UserBuf<'a> {
        UserBuf {
            phys,
            vm,
            uva,
            left: len,
            total: len,
        }
    }
}

impl UserIo for UserBuf<'_> {
    fn write(&mut self, src: &[u8]) -> KResult<usize> {
        let n = src.len().min(self.left);
        let inner = self.vm.inner.lock();
        let done = vm_write(self.phys, inner.root, self.uva, &src[..n])?;
        drop(inner);
        self.uva += done;
        self.left -= done;
        Ok(done)
    }

    fn read(&mut self, dst: &mut [u8]) -> KResult<usize> {
        let n = dst.len().min(self.left);
        let inner = self.vm.inner.lock();
        let done = vm_read(self.phys, inner.root, self.uva, &mut dst[..n])?;
        drop(inner);
        self.uva += done;
        self.left -= done;
        Ok(done)
    }

    fn remain(&self) -> usize {
        self.left
    }

    fn total(&self) -> usize {
        self.total
    }
}

/// A gathered iovec: up to [`UIO_MAXIOV`] `(uva, len)` pairs fetched from
/// user memory when the value is built, drained sequentially afterwards.
/// Transfers stop early at an entry that faults mid-way.
pub struct UserIovec<'a> {
    phys: &'a PhysMem,
    vm: &'a Vm,
    iovs: Vec<(usize, usize)>,
    total: usize,
}

impl<'a> core::fmt::Debug for UserIovec<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UserIovec")
            .field("iovs", &self.iovs)
            .field("total", &self.total)
            .finish()
    }
}

impl<'a> UserIovec<'a> {
    /// Gather the descriptor array (16 bytes per entry: pointer, length)
    /// from user memory, under one hold of the VM lock.
    pub fn new(
        phys: &'a PhysMem,
        vm: &'a Vm,
        iov_uva: usize,
        niovs: usize,
    ) -> KResult<UserIovec<'a>> {
        if niovs > UIO_MAXIOV {
            log::warn!("iovec with {} entries rejected", niovs);
            return Err(KErr::Einval);
        }
        let mut iovs = Vec::with_capacity(niovs);
        let mut total = 0;
        {
            let inner = vm.inner.lock();
            for i in 0..niovs {
                let base = iov_uva + i * 16;
                let uva = vm_read_word(phys, inner.root, base)?;
                let len = vm_read_word(phys, inner.root, base + 8)?;
                iovs.push((uva, len));
                total += len;
            }
        }
        Ok(UserIovec {
            phys,
            vm,
            iovs,
            total,
        })
    }

    /// Advance the entry list by `c` transferred bytes.
    fn consume(&mut self, c: usize) {
        let (uva, len) = self.iovs[0];
        self.iovs[0] = (uva + c, len - c);
        if self.iovs[0].1 == 0 {
            self.iovs.remove(0);
        }
    }
}

impl UserIo for UserIovec<'_> {
    fn write(&mut self, src: &[u8]) -> KResult<usize> {
        let inner = self.vm.inner.lock();
        let root = inner.root;
        let mut done = 0;
        while done < src.len() && !self.iovs.is_empty() {
            let (uva, len) = self.iovs[0];
            let n = len.min(src.len() - done);
            let c = match vm_write(self.phys, root, uva, &src[done..done + n]) {
                Ok(c) => c,
                Err(e) => return if done == 0 { Err(e) } else { Ok(done) },
            };
            done += c;
            self.consume(c);
            if c < n {
                break;
            }
        }
        Ok(done)
    }

    fn read(&mut self, dst: &mut [u8]) -> KResult<usize> {
        let inner = self.vm.inner.lock();
        let root = inner.root;
        let mut done = 0;
        while done < dst.len() && !self.iovs.is_empty() {
            let (uva, len) = self.iovs[0];
            let n = len.min(dst.len() - done);
            let c = match vm_read(self.phys, root, uva, &mut dst[done..done + n]) {
                Ok(c) => c,
                Err(e) => return if done == 0 { Err(e) } else { Ok(done) },
            };
            done += c;
            self.consume(c);
            if c < n {
                break;
            }
        }
        Ok(done)
    }

    fn remain(&self) -> usize {
        self.iovs.iter().map(|&(_, len)| len).sum()
    }

    fn total(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kmem::testmem::HostFrames;

    /// A process-like fixture: physical memory, an address space, and a few
    /// mapped user pages.
    struct UserSpace {
        phys: PhysMem,
        vm: Vm,
        root: MapRoot,
    }

    const UVA: usize = 0x40_0000;

    fn user_space(pages: usize) -> UserSpace {
        let mut src = HostFrames::new(128);
        let phys = PhysMem::reserve(HostFrames::direct_map(), &mut src, 128);
        core::mem::forget(src);
        let root = paging::create_root(&phys).unwrap();
        for i in 0..pages {
            let frame = phys.alloc().unwrap();
            paging::map_page(
                &phys,
                root,
                VirtAddr(UVA + i * PAGE_SIZE),
                frame,
                PteFlags::WRITABLE | PteFlags::USER,
            )
            .unwrap();
        }
        UserSpace {
            phys,
            vm: Vm::with_root(root),
            root,
        }
    }

    fn poke(us: &UserSpace, uva: usize, bytes: &[u8]) {
        assert_eq!(
            vm_write(&us.phys, Some(us.root), uva, bytes).unwrap(),
            bytes.len()
        );
    }

    fn peek(us: &UserSpace, uva: usize, len: usize) -> Vec<u8> {
        let mut out = alloc::vec![0u8; len];
        assert_eq!(vm_read(&us.phys, Some(us.root), uva, &mut out).unwrap(), len);
        out
    }

    #[test]
    fn user_buf_roundtrip_crosses_pages() {
        let us = user_space(2);
        let msg: Vec<u8> = (0..=255u8).cycle().take(PAGE_SIZE + 100).collect();
        let start = UVA + PAGE_SIZE - 50;

        let mut ub = UserBuf::new(&us.phys, &us.vm, start, msg.len());
        assert_eq!(ub.total(), msg.len());
        assert_eq!(ub.write(&msg).unwrap(), msg.len());
        assert_eq!(ub.remain(), 0);

        assert_eq!(peek(&us, start, msg.len()), msg);

        let mut ub = UserBuf::new(&us.phys, &us.vm, start, msg.len());
        let mut back = alloc::vec![0u8; msg.len()];
        assert_eq!(ub.read(&mut back).unwrap(), msg.len());
        assert_eq!(back, msg);
    }

    #[test]
    fn unmapped_page_faults_or_shortens() {
        let us = user_space(1);

        // entirely unmapped: EFAULT
        let mut ub = UserBuf::new(&us.phys, &us.vm, UVA + 4 * PAGE_SIZE, 16);
        assert_eq!(ub.write(b"0123456789abcdef").unwrap_err(), KErr::Efault);

        // mapped page followed by a hole: short transfer
        let mut ub = UserBuf::new(&us.phys, &us.vm, UVA + PAGE_SIZE - 8, 64);
        assert_eq!(ub.write(&[0xAA; 64]).unwrap(), 8);
        // the next attempt starts on the hole
        assert_eq!(ub.write(&[0xAA; 8]).unwrap_err(), KErr::Efault);
    }

    #[test]
    fn nil_buf_ignores_everything() {
        let mut nb = NilBuf;
        assert_eq!(nb.write(b"hello").unwrap(), 0);
        let mut out = [0u8; 4];
        assert_eq!(nb.read(&mut out).unwrap(), 0);
        assert_eq!(nb.remain(), 0);
        assert_eq!(nb.total(), 0);
    }

    #[test]
    fn kernel_buf_cursor_advances() {
        let mut store = [0u8; 8];
        let mut kb = KernelBuf::new(&mut store);
        assert_eq!(kb.write(b"abc").unwrap(), 3);
        assert_eq!(kb.write(b"defgh").unwrap(), 5);
        // full now
        assert_eq!(kb.write(b"x").unwrap(), 0);
        assert_eq!(kb.remain(), 0);
        drop(kb);
        assert_eq!(&store, b"abcdefgh");
    }

    /// Write the iovec descriptor array into user memory the way a libc
    /// would lay it out.
    fn install_iovec(us: &UserSpace, at: usize, entries: &[(usize, usize)]) {
        for (i, &(uva, len)) in entries.iter().enumerate() {
            let mut raw = [0u8; 16];
            raw[..8].copy_from_slice(&uva.to_le_bytes());
            raw[8..].copy_from_slice(&len.to_le_bytes());
            poke(us, at + i * 16, &raw);
        }
    }

    #[test]
    fn iovec_scatter_gather() {
        let us = user_space(2);
        let desc_at = UVA + PAGE_SIZE;
        install_iovec(&us, desc_at, &[(UVA, 4), (UVA + 4, 4)]);

        let mut iov = UserIovec::new(&us.phys, &us.vm, desc_at, 2).unwrap();
        assert_eq!(iov.total(), 8);
        assert_eq!(iov.write(b"ABCDEFGH").unwrap(), 8);
        assert_eq!(iov.remain(), 0);

        assert_eq!(peek(&us, UVA, 4), b"ABCD");
        assert_eq!(peek(&us, UVA + 4, 4), b"EFGH");
    }

    #[test]
    fn iovec_equals_scalar_write() {
        let us = user_space(2);
        let desc_at = UVA + PAGE_SIZE;
        let payload: Vec<u8> = (b'a'..=b'z').cycle().take(300).collect();

        // scalar write of the whole payload
        let mut ub = UserBuf::new(&us.phys, &us.vm, UVA, payload.len());
        assert_eq!(ub.write(&payload).unwrap(), payload.len());
        let scalar = peek(&us, UVA, payload.len());

        // same bytes through three iovec pieces covering the same range
        install_iovec(
            &us,
            desc_at,
            &[(UVA, 100), (UVA + 100, 120), (UVA + 220, 80)],
        );
        let mut iov = UserIovec::new(&us.phys, &us.vm, desc_at, 3).unwrap();
        assert_eq!(iov.write(&payload).unwrap(), payload.len());

        assert_eq!(peek(&us, UVA, payload.len()), scalar);
    }

    #[test]
    fn iovec_partial_writes_cut_at_entry_boundaries() {
        let us = user_space(2);
        let desc_at = UVA + PAGE_SIZE;
        install_iovec(&us, desc_at, &[(UVA, 4), (UVA + 4, 4)]);

        let mut iov = UserIovec::new(&us.phys, &us.vm, desc_at, 2).unwrap();
        // feeding fewer bytes than the first entry leaves the rest pending
        assert_eq!(iov.write(b"xy").unwrap(), 2);
        assert_eq!(iov.remain(), 6);
        assert_eq!(iov.write(b"zw42").unwrap(), 4);
        assert_eq!(iov.remain(), 2);
        assert_eq!(peek(&us, UVA, 6), b"xyzw42");
    }

    #[test]
    fn oversized_iovec_is_rejected() {
        let us = user_space(1);
        assert_eq!(
            UserIovec::new(&us.phys, &us.vm, UVA, UIO_MAXIOV + 1).unwrap_err(),
            KErr::Einval
        );
    }
}
