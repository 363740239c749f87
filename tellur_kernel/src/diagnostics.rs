//! Logging sinks and debug dumps.

use core::fmt::Write;

pub struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let mut com1 = crate::globals::COM1.lock();
            let lvl = level_prefix(record.level());
            writeln!(com1, "[{}] {}", lvl, record.args()).unwrap_or(());
        }
    }

    fn flush(&self) {}
}

pub struct VgaLogger;

impl log::Log for VgaLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            if let Some(mut vga) = crate::vga::writer() {
                let lvl = level_prefix(record.level());
                writeln!(vga, "[{}] {}", lvl, record.args()).unwrap_or(());
            }
        }
    }

    fn flush(&self) {}
}

pub struct FanOutLogger<A, B>(pub A, pub B);

impl<A: log::Log, B: log::Log> log::Log for FanOutLogger<A, B> {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.0.enabled(metadata) || self.1.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        self.0.log(record);
        self.1.log(record);
    }

    fn flush(&self) {
        self.0.flush();
        self.1.flush();
    }
}

fn level_prefix(level: log::Level) -> char {
    match level {
        log::Level::Trace => 'T',
        log::Level::Debug => 'D',
        log::Level::Info => 'I',
        log::Level::Warn => 'W',
        log::Level::Error => 'E',
    }
}

/// Dump a buffer in `xxd -r` compatible form.
pub fn hexdump(buf: &[u8]) {
    for (i, chunk) in buf.chunks(16).enumerate() {
        let mut line = heapless_line();
        let _ = write!(line, "{:07x}: ", i * 16);
        for (n, b) in chunk.iter().enumerate() {
            let _ = write!(line, "{:02x}", b);
            if n % 2 == 1 {
                let _ = write!(line, " ");
            }
        }
        log::info!("{}", line.as_str());
    }
}

/// Log the return addresses on the current stack by walking the frame
/// pointer chain. Best effort: stops at the first implausible frame.
pub fn stack_trace() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        let mut rbp: usize;
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags));
        log::error!("stack trace:");
        for _ in 0..32 {
            if rbp == 0 || rbp & 0x7 != 0 {
                break;
            }
            let frame = rbp as *const usize;
            let ret = *frame.add(1);
            if ret == 0 {
                break;
            }
            log::error!("  {:#x}", ret);
            rbp = *frame;
        }
    }
}

/// A small fixed-capacity line buffer so `hexdump` works without touching
/// the heap.
struct Line {
    buf: [u8; 64],
    len: usize,
}

fn heapless_line() -> Line {
    Line {
        buf: [0; 64],
        len: 0,
    }
}

impl Line {
    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<bad utf8>")
    }
}

impl Write for Line {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = self.buf.len() - self.len;
        let take = room.min(s.len());
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::fmt::Write;

    #[test]
    fn line_buffer_truncates() {
        let mut line = heapless_line();
        for _ in 0..10 {
            write!(line, "0123456789").unwrap();
        }
        assert_eq!(line.as_str().len(), 64);
        assert!(line.as_str().starts_with("0123456789"));
    }
}
