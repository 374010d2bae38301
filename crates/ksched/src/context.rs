//! Saved execution state: integer registers, the interrupt frame layout,
//! and the FXSAVE area.

/// The full integer register set of a thread, plus the control registers
/// the CPU restores through `iretq`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RegisterSet {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
}

/// The stack frame the interrupt stubs build: general-purpose registers
/// pushed by the stub, then the vector and error code, then the frame the
/// CPU pushed itself.
///
/// The layout must match the push order in the interrupt entry assembly.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct IsrContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    pub vector: u64,
    pub error: u64,

    // Pushed by the CPU on interrupt entry.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl RegisterSet {
    /// Captures the interrupted thread's registers out of an ISR frame.
    pub fn from_isr(context: &IsrContext) -> Self {
        Self {
            rax: context.rax,
            rbx: context.rbx,
            rcx: context.rcx,
            rdx: context.rdx,
            rdi: context.rdi,
            rsi: context.rsi,
            r8: context.r8,
            r9: context.r9,
            r10: context.r10,
            r11: context.r11,
            r12: context.r12,
            r13: context.r13,
            r14: context.r14,
            r15: context.r15,
            rbp: context.rbp,
            rsp: context.rsp,
            rip: context.rip,
            rflags: context.rflags,
            cs: context.cs,
            ss: context.ss,
        }
    }

    /// Builds the ISR frame that resumes this register set.
    pub fn to_isr(&self) -> IsrContext {
        IsrContext {
            rax: self.rax,
            rbx: self.rbx,
            rcx: self.rcx,
            rdx: self.rdx,
            rdi: self.rdi,
            rsi: self.rsi,
            r8: self.r8,
            r9: self.r9,
            r10: self.r10,
            r11: self.r11,
            r12: self.r12,
            r13: self.r13,
            r14: self.r14,
            r15: self.r15,
            rbp: self.rbp,

            vector: 0,
            error: 0,

            rip: self.rip,
            cs: self.cs,
            rflags: self.rflags,
            rsp: self.rsp,
            ss: self.ss,
        }
    }
}

/// A 512-byte FXSAVE region, 16-byte aligned as the instruction requires.
#[repr(C, align(64))]
pub struct FpuArea {
    data: [u8; 512],
}

impl FpuArea {
    /// A fresh area with sane x87/SSE control defaults: FCW 0x037F,
    /// MXCSR 0x1F80.
    pub fn new() -> Self {
        let mut data = [0u8; 512];
        data[0] = 0x7F;
        data[1] = 0x03;
        data[24] = 0x80;
        data[25] = 0x1F;
        Self { data }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

impl Default for FpuArea {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_round_trip() {
        let mut context = IsrContext::default();
        context.rax = 1;
        context.r15 = 15;
        context.rip = 0xFFFF_8000_0000_1000;
        context.rsp = 0xFFFF_8000_0100_0000;
        context.rflags = 0x202;
        context.cs = 0x08;
        context.ss = 0x10;
        context.vector = 0x20;
        context.error = 0;

        let regs = RegisterSet::from_isr(&context);
        let restored = regs.to_isr();

        assert_eq!(restored.rax, 1);
        assert_eq!(restored.r15, 15);
        assert_eq!(restored.rip, context.rip);
        assert_eq!(restored.rsp, context.rsp);
        assert_eq!(restored.rflags, 0x202);
        // The vector is not part of the thread state.
        assert_eq!(restored.vector, 0);
    }
}
