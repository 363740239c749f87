//! Bounded in-order queue of fds in flight across local-socket IPC.

use crate::proc::Fd;

use alloc::vec::Vec;

/// Queue capacity. Matches the ancillary-data depth a local socket accepts
/// before the sender must wait.
pub const PASSFD_CAP: usize = 10;

/// A ring of passed fds. Counters only grow; the difference bounds the
/// occupancy.
#[derive(Default)]
pub struct PassFd {
    ring: Vec<Option<Fd>>,
    input: usize,
    consume: usize,
}

impl PassFd {
    pub fn new() -> PassFd {
        PassFd::default()
    }

    /// Queue an fd; `false` when the ring is full (the caller keeps the fd).
    pub fn add(&mut self, fd: Fd) -> Option<Fd> {
        if self.ring.is_empty() {
            self.ring.resize_with(PASSFD_CAP, || None);
        }
        if self.input - self.consume == self.ring.len() {
            return Some(fd);
        }
        let slot = self.input % self.ring.len();
        self.ring[slot] = Some(fd);
        self.input += 1;
        None
    }

    /// The oldest queued fd, if any.
    pub fn take(&mut self) -> Option<Fd> {
        if self.ring.is_empty() || self.input == self.consume {
            return None;
        }
        let slot = self.consume % self.ring.len();
        self.consume += 1;
        self.ring[slot].take()
    }

    pub fn len(&self) -> usize {
        self.input - self.consume
    }

    pub fn is_empty(&self) -> bool {
        self.input == self.consume
    }

    /// Drain the queue, closing everything still in flight. Safe to call
    /// repeatedly and after any number of takes.
    pub fn close_all(&mut self) {
        while let Some(fd) = self.take() {
            let _ = fd.ops.close();
        }
    }
}
