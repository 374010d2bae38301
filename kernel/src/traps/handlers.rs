// =============================================================================
// Basalt — Interrupt Entry and Dispatch
// =============================================================================
//
// Every installed vector funnels through one assembly path: the stub pushes
// the vector (and a dummy error code where the CPU did not push one), the
// common entry saves the full integer register file in the `IsrContext`
// layout, and the Rust dispatcher decides. The timer vector may rewrite
// the context in place, and that is how a preemptive switch happens: the
// `iretq` at the end of the common path simply returns into a different
// thread.
// =============================================================================

use ksched::IsrContext;

use crate::arch::local;
use crate::task;

/// The periodic preemption interrupt.
pub const TIMER_VECTOR: u8 = 0x20;

/// Each core's spurious vector is `base + (core & 0xF)`; all sixteen point
/// at the same dispatcher arm.
pub const SPURIOUS_VECTOR_BASE: u8 = 0xF0;

core::arch::global_asm!(
    r#"
.section .text

// Vectors where the CPU pushes no error code get a zero placeholder so
// the frame layout is uniform.
.macro ISR_STUB name, vector
.global \name
\name:
    push 0
    push \vector
    jmp isr_common
.endm

.macro ISR_STUB_ERR name, vector
.global \name
\name:
    push \vector
    jmp isr_common
.endm

ISR_STUB     isr_stub_breakpoint, 3
ISR_STUB_ERR isr_stub_double_fault, 8
ISR_STUB_ERR isr_stub_general_protection, 13
ISR_STUB_ERR isr_stub_page_fault, 14
ISR_STUB     isr_stub_timer, 0x20

.altmacro
.set spurious_vector, 0xF0
.rept 16
    ISR_STUB isr_stub_spurious_%spurious_vector, %spurious_vector
    .set spurious_vector, spurious_vector + 1
.endr
.noaltmacro

// The error-code slot sits above the vector; by the time we get here the
// stack holds [vector][error][rip][cs][rflags][rsp][ss] top-down.
isr_common:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    mov rdi, rsp
    cld
    call {dispatch}

    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax

    add rsp, 16
    iretq
"#,
    dispatch = sym isr_dispatch
);

extern "C" {
    pub fn isr_stub_breakpoint();
    pub fn isr_stub_double_fault();
    pub fn isr_stub_general_protection();
    pub fn isr_stub_page_fault();
    pub fn isr_stub_timer();
}

// The sixteen spurious stubs, resolved by vector number at install time.
macro_rules! spurious_stubs {
    ($($vector:literal => $name:ident),+ $(,)?) => {
        extern "C" {
            $(fn $name();)+
        }

        pub(super) fn spurious_stub(vector: u8) -> usize {
            match vector {
                $($vector => $name as usize,)+
                _ => unreachable!("vector outside the spurious range"),
            }
        }
    };
}

spurious_stubs! {
    0xF0 => isr_stub_spurious_240,
    0xF1 => isr_stub_spurious_241,
    0xF2 => isr_stub_spurious_242,
    0xF3 => isr_stub_spurious_243,
    0xF4 => isr_stub_spurious_244,
    0xF5 => isr_stub_spurious_245,
    0xF6 => isr_stub_spurious_246,
    0xF7 => isr_stub_spurious_247,
    0xF8 => isr_stub_spurious_248,
    0xF9 => isr_stub_spurious_249,
    0xFA => isr_stub_spurious_250,
    0xFB => isr_stub_spurious_251,
    0xFC => isr_stub_spurious_252,
    0xFD => isr_stub_spurious_253,
    0xFE => isr_stub_spurious_254,
    0xFF => isr_stub_spurious_255,
}

/// Rust-side dispatch. The context is the live stack frame; writing to it
/// changes where `iretq` returns.
extern "C" fn isr_dispatch(context: *mut IsrContext) {
    // SAFETY: the common entry built a complete IsrContext at this address
    // and nothing else aliases it while the handler runs.
    let context = unsafe { &mut *context };

    match context.vector {
        3 => {
            log::info!("breakpoint at {:#018X}", context.rip);
        }
        8 => {
            panic!(
                "double fault (error {:#X}) at {:#018X}",
                context.error, context.rip
            );
        }
        13 => {
            panic!(
                "general protection fault (error {:#X}) at {:#018X}",
                context.error, context.rip
            );
        }
        14 => {
            let cr2: u64;
            unsafe {
                core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack));
            }
            panic!(
                "page fault on {:#018X} (error {:#X}) at {:#018X}",
                cr2, context.error, context.rip
            );
        }
        vector if vector == TIMER_VECTOR as u64 => {
            task::preempt(context);
            khal::apic::eoi();
        }
        vector if (SPURIOUS_VECTOR_BASE as u64..=0xFF).contains(&vector) => {
            log::debug!("spurious interrupt on core {}", local::core_id());
            khal::apic::eoi();
        }
        vector => {
            panic!("unexpected interrupt vector {:#X}", vector);
        }
    }
}
