//! 8254 programmable interval timer, used only for boot-time busy waits.

use crate::io::{self, PortNumber};

const CHANNEL2_DATA: PortNumber = PortNumber(0x42);
const MODE_COMMAND: PortNumber = PortNumber(0x43);
/// NMI status/control port; bit 0 gates PIT channel 2, bit 5 reads its output.
const PORT_B: PortNumber = PortNumber(0x61);

/// PIT input clock in Hz.
const PIT_HZ: u64 = 1_193_182;

/// Longest countdown a 16-bit reload value allows, in milliseconds.
const MAX_CHUNK_MS: u64 = 50;

/// Busy-wait for at least `ms` milliseconds using PIT channel 2 in one-shot
/// mode. Coarse; the bring-up sleeps all carry generous margins.
///
/// # Safety
///
/// Reprograms PIT channel 2 and the speaker gate. Only one CPU may use this
/// at a time, which holds because only the BSP runs the bring-up.
pub unsafe fn busy_sleep_ms(ms: u64) {
    let mut left = ms;
    while left > 0 {
        let chunk = left.min(MAX_CHUNK_MS);
        one_shot(chunk);
        left -= chunk;
    }
}

unsafe fn one_shot(ms: u64) {
    let ticks = (PIT_HZ * ms / 1000) as u16;

    // gate channel 2 on, speaker output off
    let gate = io::inb(PORT_B);
    io::outb(PORT_B, (gate & !0x02) | 0x01);

    // channel 2, lobyte/hibyte, mode 0 (interrupt on terminal count)
    io::outb(MODE_COMMAND, 0b1011_0000);
    io::outb(CHANNEL2_DATA, ticks as u8);
    io::outb(CHANNEL2_DATA, (ticks >> 8) as u8);

    // output goes high when the count expires
    while io::inb(PORT_B) & 0x20 == 0 {
        core::hint::spin_loop();
    }

    io::outb(PORT_B, gate);
}
