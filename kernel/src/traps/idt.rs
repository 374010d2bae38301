//! IDT construction and per-core loading.

use spin::Once;

use crate::arch::idt::Idt;

use super::handlers;

/// One IDT shared by every core; the GDT and TSS are per-core, the vector
/// table is not.
static IDT: Once<Idt> = Once::new();

/// Builds the table and loads it on the bootstrap processor.
pub fn init() {
    let idt = IDT.call_once(|| {
        let mut idt = Idt::new();

        idt.set_handler(3, handlers::isr_stub_breakpoint as usize);
        // The double fault always runs on its own known-good stack.
        idt.set_handler_with_ist(8, handlers::isr_stub_double_fault as usize, 1);
        idt.set_handler(13, handlers::isr_stub_general_protection as usize);
        idt.set_handler(14, handlers::isr_stub_page_fault as usize);

        idt.set_handler(handlers::TIMER_VECTOR, handlers::isr_stub_timer as usize);

        for vector in handlers::SPURIOUS_VECTOR_BASE..=0xFF {
            idt.set_handler(vector, handlers::spurious_stub(vector));
        }

        idt
    });

    unsafe {
        idt.load();
    }

    log::debug!(
        "IDT loaded (timer vector {:#X}, spurious base {:#X})",
        handlers::TIMER_VECTOR,
        handlers::SPURIOUS_VECTOR_BASE
    );
}

/// Loads the already-built table on an application processor.
pub fn load_on_ap() {
    let idt = IDT.get().expect("IDT not built before AP bring-up");
    unsafe {
        idt.load();
    }
}
