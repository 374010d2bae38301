//! Legacy 8259 PIC setup.
//!
//! The 8259 pair must be remapped away from the CPU exception vectors and
//! then masked before the APIC takes over, or spurious legacy IRQs land on
//! exception handlers.

use crate::port::outb;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;

/// IRQ 0-7 land on vectors 32-39, IRQ 8-15 on 40-47.
const PIC1_OFFSET: u8 = 32;
const PIC2_OFFSET: u8 = 40;

/// Some chipsets need a breather between PIC command bytes.
#[inline]
fn io_wait() {
    unsafe {
        outb(0x80, 0);
    }
}

/// Remaps both PICs out of the exception range and masks every IRQ.
/// Idempotent; safe to repeat on application processors.
pub fn disable() {
    unsafe {
        outb(PIC1_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();
        outb(PIC2_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();

        outb(PIC1_DATA, PIC1_OFFSET);
        io_wait();
        outb(PIC2_DATA, PIC2_OFFSET);
        io_wait();

        // Master: slave on IRQ2. Slave: cascade identity 2.
        outb(PIC1_DATA, 4);
        io_wait();
        outb(PIC2_DATA, 2);
        io_wait();

        outb(PIC1_DATA, ICW4_8086);
        io_wait();
        outb(PIC2_DATA, ICW4_8086);
        io_wait();

        // Mask everything; the APIC owns interrupts from here on.
        outb(PIC1_DATA, 0xFF);
        outb(PIC2_DATA, 0xFF);
    }
}
