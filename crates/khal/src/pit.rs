//! 8254 programmable interval timer.
//!
//! The PIT is the one timer every PC has and the only one with a known
//! frequency, which makes it the reference clock the APIC timer and the
//! TSC are calibrated against. Channel 0 is programmed in rate-generator
//! mode and polled through latched counter reads.

use crate::port::{inb, outb};

const CHANNEL0: u16 = 0x40;
const COMMAND: u16 = 0x43;

/// The PIT input clock: 1.193182 MHz.
pub const BASE_FREQUENCY_HZ: u64 = 1_193_182;

/// Mode/command bits: channel 0, lobyte/hibyte access, rate generator.
const MODE_RATE_GENERATOR: u8 = 0b0011_0100;

/// Latch command for channel 0.
const LATCH_CHANNEL0: u8 = 0b0000_0000;

/// Programs channel 0 with a divisor; the counter reloads from it at
/// `BASE_FREQUENCY_HZ / divisor` Hz. A divisor of 0 counts 65536.
pub fn set_divisor(divisor: u16) {
    unsafe {
        outb(COMMAND, MODE_RATE_GENERATOR);
        outb(CHANNEL0, divisor as u8);
        outb(CHANNEL0, (divisor >> 8) as u8);
    }
}

/// The divisor whose output is closest to `frequency` Hz.
pub fn best_divisor(frequency: u64) -> u16 {
    let divisor = BASE_FREQUENCY_HZ / frequency.max(19);
    divisor.min(u16::MAX as u64) as u16
}

/// Latches and reads the channel 0 down-counter.
pub fn read_count() -> u16 {
    unsafe {
        outb(COMMAND, LATCH_CHANNEL0);
        let low = inb(CHANNEL0);
        let high = inb(CHANNEL0);
        (high as u16) << 8 | low as u16
    }
}
