//! Open file descriptions, the process table, and process lifetime.

use crate::err::{KErr, KResult};
use crate::poll::{PollMsg, Ready};
use crate::userio::{UserIo, Vm};

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use futures_util::task::AtomicWaker;

use kmem::phys::PhysMem;
use kmem::PAGE_SIZE;

use spin::Mutex;

/// The capability set of an open file description. Kinds that do not
/// support an operation inherit the `ENOTSUP` default.
#[allow(unused_variables)]
pub trait FileOps: Send + Sync {
    fn read(&self, dst: &mut dyn UserIo) -> KResult<usize> {
        Err(KErr::Enotsup)
    }

    fn write(&self, src: &mut dyn UserIo) -> KResult<usize> {
        Err(KErr::Enotsup)
    }

    /// Take another driver-side reference; called when an fd is duplicated.
    fn reopen(&self) -> KResult<()> {
        Err(KErr::Enotsup)
    }

    /// Drop one driver-side reference. The last close tears the object down.
    fn close(&self) -> KResult<()> {
        Ok(())
    }

    fn pread(&self, dst: &mut dyn UserIo, offset: usize) -> KResult<usize> {
        Err(KErr::Enotsup)
    }

    fn pwrite(&self, src: &mut dyn UserIo, offset: usize) -> KResult<usize> {
        Err(KErr::Enotsup)
    }

    fn lseek(&self, offset: isize, whence: usize) -> KResult<usize> {
        Err(KErr::Enotsup)
    }

    fn poll(&self, pm: PollMsg) -> KResult<Ready> {
        Err(KErr::Enotsup)
    }

    fn mmap(&self, offset: usize, len: usize) -> KResult<usize> {
        Err(KErr::Enotsup)
    }

    fn ioctl(&self, cmd: usize, arg: usize) -> KResult<usize> {
        Err(KErr::Enotsup)
    }

    fn shutdown(&self, read: bool, write: bool) -> KResult<()> {
        Err(KErr::Enotsup)
    }

    fn bind(&self, addr: &[u8]) -> KResult<()> {
        Err(KErr::Enotsup)
    }

    fn connect(&self, addr: &[u8]) -> KResult<()> {
        Err(KErr::Enotsup)
    }

    fn listen(&self, backlog: usize) -> KResult<()> {
        Err(KErr::Enotsup)
    }

    fn accept(&self) -> KResult<Fd> {
        Err(KErr::Enotsup)
    }

    fn sendmsg(&self, src: &mut dyn UserIo, addr: &[u8]) -> KResult<usize> {
        Err(KErr::Enotsup)
    }

    fn recvmsg(&self, dst: &mut dyn UserIo) -> KResult<usize> {
        Err(KErr::Enotsup)
    }

    fn getsockopt(&self, level: usize, opt: usize) -> KResult<usize> {
        Err(KErr::Enotsup)
    }

    fn setsockopt(&self, level: usize, opt: usize, val: usize) -> KResult<()> {
        Err(KErr::Enotsup)
    }

    fn getsockname(&self) -> KResult<Vec<u8>> {
        Err(KErr::Enotsup)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdPerms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CLOEXEC = 1 << 2;
    }
}

/// A slot in a process's fd table: a shared open file description plus the
/// permission bits this holder may exercise.
pub struct Fd {
    pub ops: Arc<dyn FileOps>,
    pub perms: FdPerms,
}

impl core::fmt::Debug for Fd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fd").field("perms", &self.perms).finish()
    }
}

impl Fd {
    pub fn new(ops: Arc<dyn FileOps>, perms: FdPerms) -> Fd {
        Fd { ops, perms }
    }

    /// Duplicate through the reopen capability. Fails if the description is
    /// being torn down concurrently.
    pub fn dup(&self) -> KResult<Fd> {
        self.ops.reopen()?;
        Ok(Fd {
            ops: self.ops.clone(),
            perms: self.perms,
        })
    }
}

#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub struct Pid(pub usize);

#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub struct Tid(pub usize);

/// Per-process resource limits.
#[derive(Copy, Clone, Debug)]
pub struct Ulimit {
    /// Memory, in pages.
    pub pages: usize,
    /// Open fds; `usize::MAX` means unlimited.
    pub nofile: usize,
    /// Mapped regions.
    pub novma: usize,
    /// Threads.
    pub noproc: usize,
}

impl Default for Ulimit {
    fn default() -> Ulimit {
        Ulimit {
            // 128 MiB of pages
            pages: (1 << 27) / PAGE_SIZE,
            nofile: usize::MAX,
            novma: 1 << 8,
            noproc: 1 << 10,
        }
    }
}

/// First fd slot handed out after stdin/stdout/stderr.
const FD_START: usize = 3;

pub struct FdTable {
    slots: Vec<Option<Fd>>,
    /// Search hint: no free slot below this index.
    first_free: usize,
    nfds: usize,
}

impl FdTable {
    fn new(slots: Vec<Option<Fd>>) -> FdTable {
        let nfds = slots.iter().filter(|s| s.is_some()).count();
        FdTable {
            slots,
            first_free: FD_START,
            nfds,
        }
    }

    pub fn count(&self) -> usize {
        self.nfds
    }

    pub fn insert(&mut self, fd: Fd, limit: usize) -> KResult<usize> {
        if self.nfds >= limit {
            return Err(KErr::Enospc);
        }
        let mut idx = self.first_free;
        loop {
            if idx == self.slots.len() {
                self.slots.push(Some(fd));
                break;
            }
            if self.slots[idx].is_none() {
                self.slots[idx] = Some(fd);
                break;
            }
            idx += 1;
        }
        self.first_free = idx + 1;
        self.nfds += 1;
        Ok(idx)
    }

    pub fn get(&self, idx: usize) -> KResult<&Fd> {
        self.slots
            .get(idx)
            .and_then(|s| s.as_ref())
            .ok_or(KErr::Ebadf)
    }

    pub fn remove(&mut self, idx: usize) -> KResult<Fd> {
        let fd = self
            .slots
            .get_mut(idx)
            .and_then(|s| s.take())
            .ok_or(KErr::Ebadf)?;
        self.nfds -= 1;
        if idx < self.first_free {
            self.first_free = idx;
        }
        Ok(fd)
    }

    fn drain(&mut self) -> Vec<Fd> {
        self.nfds = 0;
        self.first_free = FD_START;
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }
}

/// The parent-visible exit anchor of a process.
pub struct Wait {
    pid: Pid,
    status: Mutex<Option<usize>>,
    waker: AtomicWaker,
}

impl Wait {
    fn new(pid: Pid) -> Wait {
        Wait {
            pid,
            status: Mutex::new(None),
            waker: AtomicWaker::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn post_exit(&self, status: usize) {
        *self.status.lock() = Some(status);
        self.waker.wake();
    }

    pub fn exited(&self) -> Option<usize> {
        *self.status.lock()
    }
}

pub struct Proc {
    pub name: String,
    pub pid: Pid,
    pub tid0: Tid,
    pub ulim: Ulimit,
    pub fds: Mutex<FdTable>,
    pub cwd: Mutex<Option<Fd>>,
    pub vm: Vm,
    pub wait: Wait,
    threads: Mutex<BTreeSet<Tid>>,
}

impl core::fmt::Debug for Proc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Proc")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("tid0", &self.tid0)
            .finish()
    }
}

impl Proc {
    /// Register a thread id with this process, enforcing the per-process
    /// thread limit.
    pub fn thread_new(&self, tid: Tid) -> KResult<()> {
        let mut threads = self.threads.lock();
        if threads.len() >= self.ulim.noproc {
            return Err(KErr::Eagain);
        }
        let fresh = threads.insert(tid);
        assert!(fresh, "tid collision");
        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Hand the thread to the scheduler. Fails only if the thread does not
    /// belong to this process.
    pub fn start_thread(&self, tid: Tid) -> bool {
        self.threads.lock().contains(&tid)
    }

    pub fn fd_insert(&self, fd: Fd) -> KResult<usize> {
        self.fds.lock().insert(fd, self.ulim.nofile)
    }

    pub fn fd_close(&self, idx: usize) -> KResult<()> {
        let fd = self.fds.lock().remove(idx)?;
        fd.ops.close()
    }
}

/// System-wide limits.
#[derive(Copy, Clone, Debug)]
pub struct SysLimits {
    /// Total threads across all processes.
    pub sysprocs: usize,
}

impl Default for SysLimits {
    fn default() -> SysLimits {
        SysLimits { sysprocs: 1 << 10 }
    }
}

struct TableInner {
    /// Bumped by two per process: the pid and the first tid share the
    /// sequence.
    id_cur: usize,
    nthreads: usize,
    procs: BTreeMap<Pid, Arc<Proc>>,
}

/// The global process map.
pub struct ProcTable {
    limit: SysLimits,
    inner: Mutex<TableInner>,
}

impl ProcTable {
    pub fn new(limit: SysLimits) -> ProcTable {
        ProcTable {
            limit,
            inner: Mutex::new(TableInner {
                id_cur: 0,
                nthreads: 0,
                procs: BTreeMap::new(),
            }),
        }
    }

    /// Create a process: mint a pid and first tid, clone the parent's fd
    /// table, install the working directory, and register the first thread.
    /// Fails without touching any table once the system-wide thread count
    /// has reached the cap.
    ///
    /// An fd the parent closes while we clone is skipped; losing it is an
    /// accepted race, not an error.
    pub fn proc_new(&self, name: &str, cwd: &Fd, fds: &[Option<Fd>]) -> KResult<Arc<Proc>> {
        let (pid, tid0) = {
            let mut inner = self.inner.lock();
            if inner.nthreads >= self.limit.sysprocs {
                return Err(KErr::Eagain);
            }
            inner.nthreads += 1;
            inner.id_cur += 1;
            let pid = Pid(inner.id_cur);
            inner.id_cur += 1;
            let tid0 = Tid(inner.id_cur);
            assert!(!inner.procs.contains_key(&pid), "pid exists");
            (pid, tid0)
        };

        // the clone happens outside the table lock
        let mut slots = Vec::with_capacity(fds.len());
        for fd in fds {
            match fd {
                Some(fd) => match fd.dup() {
                    Ok(dup) => slots.push(Some(dup)),
                    Err(_) => {
                        log::debug!("fd closed out from under fork, skipping");
                        slots.push(None);
                    }
                },
                None => slots.push(None),
            }
        }

        let cwd = cwd.dup().expect("cwd reopen must succeed");

        let proc = Arc::new(Proc {
            name: String::from(name),
            pid,
            tid0,
            ulim: Ulimit::default(),
            fds: Mutex::new(FdTable::new(slots)),
            cwd: Mutex::new(Some(cwd)),
            vm: Vm::new(),
            wait: Wait::new(pid),
            threads: Mutex::new(BTreeSet::new()),
        });

        proc.thread_new(tid0).expect("first thread fits any limit");
        assert!(proc.start_thread(tid0), "first thread must start");

        self.inner.lock().procs.insert(pid, proc.clone());
        Ok(proc)
    }

    pub fn lookup(&self, pid: Pid) -> Option<Arc<Proc>> {
        self.inner.lock().procs.get(&pid).cloned()
    }

    pub fn proc_count(&self) -> usize {
        self.inner.lock().procs.len()
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().nthreads
    }

    /// Tear a process down: close every fd exactly once, drop the working
    /// directory, release the address space, and unlink the process. This
    /// path must itself be able to allocate, so failure injection is
    /// suppressed for its duration.
    pub fn terminate(&self, phys: &PhysMem, proc: &Arc<Proc>, status: usize) {
        let _nofail = phys.nofail_scope();

        let fds = proc.fds.lock().drain();
        for fd in fds {
            if let Err(e) = fd.ops.close() {
                log::warn!("fd close during teardown: {:?}", e);
            }
        }
        if let Some(cwd) = proc.cwd.lock().take() {
            let _ = cwd.ops.close();
        }

        proc.vm.teardown(phys);

        let threads = proc.thread_count();
        {
            let mut inner = self.inner.lock();
            inner.procs.remove(&proc.pid);
            inner.nthreads -= threads;
        }
        proc.wait.post_exit(status);
    }
}
