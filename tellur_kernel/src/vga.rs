//! Minimal VGA text-mode writer for early boot output.

use core::fmt;

use spin::{Mutex, MutexGuard, Once};

use amd64::VirtAddr;

const ROWS: usize = 25;
const COLS: usize = 80;

/// White on black.
const ATTR: u16 = 0x0F00;

static VGA: Once<Mutex<VgaWriter>> = Once::new();

/// Point the writer at the mapped text buffer.
///
/// # Safety
///
/// `base` must be the mapped VGA text buffer.
pub unsafe fn init(base: VirtAddr) {
    VGA.call_once(|| {
        Mutex::new(VgaWriter {
            buf: base.as_mut_ptr(),
            row: 0,
            col: 0,
        })
    });
}

/// The shared writer, if the VGA buffer has been mapped yet.
pub fn writer() -> Option<MutexGuard<'static, VgaWriter>> {
    VGA.get().map(|m| m.lock())
}

pub struct VgaWriter {
    buf: *mut u16,
    row: usize,
    col: usize,
}

// the raw pointer targets the dedicated MMIO buffer
unsafe impl Send for VgaWriter {}

impl VgaWriter {
    fn put(&mut self, c: u8) {
        match c {
            b'\n' => {
                self.col = 0;
                self.row += 1;
            }
            b'\x08' => {
                self.col = self.col.saturating_sub(1);
            }
            _ => {
                if self.col >= COLS {
                    self.col = 0;
                    self.row += 1;
                }
                if self.row >= ROWS {
                    self.scroll();
                }
                let idx = self.row * COLS + self.col;
                unsafe { self.buf.add(idx).write_volatile(ATTR | c as u16) };
                self.col += 1;
            }
        }
        if self.row >= ROWS {
            self.scroll();
        }
    }

    fn scroll(&mut self) {
        unsafe {
            for row in 1..ROWS {
                for col in 0..COLS {
                    let v = self.buf.add(row * COLS + col).read_volatile();
                    self.buf.add((row - 1) * COLS + col).write_volatile(v);
                }
            }
            for col in 0..COLS {
                self.buf.add((ROWS - 1) * COLS + col).write_volatile(ATTR | b' ' as u16);
            }
        }
        self.row = ROWS - 1;
        self.col = 0;
    }
}

impl fmt::Write for VgaWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            self.put(b);
        }
        Ok(())
    }
}
