//! 16550 UART driver for the COM ports.
//!
//! COM1 carries the kernel log from the first instruction of boot; COM2
//! carries the binary debug event stream. Both are polled; interrupts
//! stay disabled on the chip.

use core::fmt;

use spin::Mutex;

use crate::port::{inb, outb};

const COM1_BASE: u16 = 0x3F8;
const COM2_BASE: u16 = 0x2F8;

/// One 16550 channel.
pub struct SerialPort {
    base: u16,
    initialized: bool,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self {
            base,
            initialized: false,
        }
    }

    /// Programs 115200 baud, 8N1, FIFOs on, and runs the loopback self
    /// test. A failed self test keeps the port usable; output is simply
    /// lost on faulty hardware.
    pub fn init(&mut self) {
        unsafe {
            // Interrupts off, DLAB on, divisor 1 (115200 baud).
            outb(self.base + 1, 0x00);
            outb(self.base + 3, 0x80);
            outb(self.base + 0, 0x01);
            outb(self.base + 1, 0x00);

            // 8 bits, no parity, one stop bit; FIFO with 14-byte threshold.
            outb(self.base + 3, 0x03);
            outb(self.base + 2, 0xC7);

            // Loopback self test.
            outb(self.base + 4, 0x1E);
            outb(self.base + 0, 0xAE);
            let echoed = inb(self.base + 0);

            // Normal operation: DTR, RTS, OUT1, OUT2.
            outb(self.base + 4, 0x0F);
            outb(self.base + 1, 0x00);

            let _ = echoed;
            self.initialized = true;
        }
    }

    #[inline]
    fn transmit_empty(&self) -> bool {
        unsafe { inb(self.base + 5) & 0x20 != 0 }
    }

    pub fn write_byte(&self, byte: u8) {
        if !self.initialized {
            return;
        }

        while !self.transmit_empty() {
            core::hint::spin_loop();
        }
        unsafe {
            outb(self.base, byte);
        }
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        for &byte in bytes {
            self.write_byte(byte);
        }
    }

    pub fn write_str(&self, text: &str) {
        for byte in text.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, text: &str) -> fmt::Result {
        SerialPort::write_str(self, text);
        Ok(())
    }
}

/// The log console.
pub static COM1: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1_BASE));

/// The debug event stream.
pub static COM2: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM2_BASE));

/// Initializes both channels. Called once on the bootstrap processor.
pub fn init() {
    COM1.lock().init();
    COM2.lock().init();
}
