//! Privileged CPU accessors: control registers, MSRs, TLB maintenance,
//! the time-stamp counter, and FPU state save/restore.

use core::arch::asm;

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;

pub const IA32_PAT: u32 = 0x277;
pub const IA32_GS_BASE: u32 = 0xC000_0101;
pub const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;

/// # Safety
/// The address must point at a valid PML4; every mapping the CPU is using
/// (code, stack, GS) must exist in it.
#[inline]
pub unsafe fn write_cr3(value: u64) {
    let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(value));
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}

/// Invalidates the TLB entry covering one virtual address on this core.
#[inline]
pub fn invlpg(addr: u64) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(addr));
}

/// # Safety
/// MSR writes reprogram the CPU; the caller must know the register.
#[inline]
pub unsafe fn wrmsr(msr: u32, value: u64) {
    unsafe {
        asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nomem, nostack, preserves_flags)
        );
    }
}

/// Serializing read of the time-stamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    let (low, high): (u32, u32);
    unsafe {
        asm!(
            "lfence",
            "rdtsc",
            out("eax") low,
            out("edx") high,
            options(nomem, nostack)
        );
    }
    (high as u64) << 32 | low as u64
}

/// One CPUID leaf.
#[inline]
pub fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    let (eax, ebx, ecx, edx): (u32, u32, u32, u32);
    unsafe {
        asm!(
            "push rbx",
            "cpuid",
            "mov {ebx_out:e}, ebx",
            "pop rbx",
            inout("eax") leaf => eax,
            ebx_out = out(reg) ebx,
            inout("ecx") 0u32 => ecx,
            out("edx") edx,
            options(nostack, preserves_flags)
        );
    }
    (eax, ebx, ecx, edx)
}

/// The initial APIC id of the calling core, available before the APIC
/// itself is set up.
#[inline]
pub fn initial_apic_id() -> u32 {
    let (_, ebx, _, _) = cpuid(1);
    ebx >> 24
}

/// True when CPUID advertises an invariant TSC.
pub fn has_invariant_tsc() -> bool {
    let (max_extended, _, _, _) = cpuid(0x8000_0000);
    if max_extended < 0x8000_0007 {
        return false;
    }
    let (_, _, _, edx) = cpuid(0x8000_0007);
    edx & (1 << 8) != 0
}

/// Programs the PAT so the walker's PWT/PCD index bits select the
/// cacheability classes the kernel expects. Must run on every core.
pub fn load_pat() {
    unsafe {
        wrmsr(IA32_PAT, kmem::paging::PAT_VALUE);
    }
}

/// # Safety
/// `area` must point at 512 writable bytes, 16-byte aligned.
#[inline]
pub unsafe fn fxsave(area: *mut u8) {
    unsafe {
        asm!("fxsave64 [{}]", in(reg) area, options(nostack, preserves_flags));
    }
}

/// # Safety
/// `area` must hold a state image previously written by `fxsave`.
#[inline]
pub unsafe fn fxrstor(area: *mut u8) {
    unsafe {
        asm!("fxrstor64 [{}]", in(reg) area, options(nostack, preserves_flags));
    }
}

/// Enables SSE and `fxsave` (OSFXSR/OSXMMEXCPT, clear EM, set MP) so FPU
/// state can be switched per thread.
pub fn enable_fpu() {
    unsafe {
        let mut cr0: u64;
        asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        cr0 &= !(1 << 2); // EM
        cr0 |= 1 << 1; // MP
        asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));

        let mut cr4: u64;
        asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        cr4 |= (1 << 9) | (1 << 10); // OSFXSR | OSXMMEXCPT
        asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
    }
}
