//! Global Descriptor Table.
//!
//! Long mode needs almost nothing from segmentation, but a GDT still
//! defines the kernel code/data segments and points at the TSS. Every
//! core builds its own copy so each can own a private TSS, because sharing one
//! TSS trips the descriptor's Busy bit on the second `ltr`.

use core::arch::asm;
use core::mem::size_of;

use super::tss::Tss;

/// Null, kernel code, kernel data, TSS low, TSS high.
const GDT_ENTRIES: usize = 5;

/// Byte offsets of the descriptors, used as selectors.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const TSS_SELECTOR: u16 = 0x18;

/// 64-bit kernel code: present, DPL 0, executable, long mode.
const KERNEL_CODE_DESCRIPTOR: u64 = 0x00_2F_9A_00_0000_FFFF;

/// Kernel data: present, DPL 0, writable.
const KERNEL_DATA_DESCRIPTOR: u64 = 0x00_0F_92_00_0000_FFFF;

/// A per-core GDT.
#[repr(C, align(16))]
pub struct Gdt {
    entries: [u64; GDT_ENTRIES],
}

impl Gdt {
    /// An all-null table; filled in by `init`.
    pub const fn zeroed() -> Self {
        Self {
            entries: [0; GDT_ENTRIES],
        }
    }

    /// Builds the descriptors, wiring the 16-byte TSS descriptor to the
    /// given per-core TSS.
    pub fn init(&mut self, tss: &Tss) {
        let tss_addr = tss as *const Tss as u64;
        let tss_limit = (size_of::<Tss>() - 1) as u64;

        let mut tss_low: u64 = 0;
        tss_low |= tss_limit & 0xFFFF;
        tss_low |= (tss_addr & 0xFF_FFFF) << 16;
        // Type 0x9: 64-bit TSS, available. Present, DPL 0.
        tss_low |= 0x89u64 << 40;
        tss_low |= ((tss_limit >> 16) & 0xF) << 48;
        tss_low |= ((tss_addr >> 24) & 0xFF) << 56;

        self.entries = [
            0,
            KERNEL_CODE_DESCRIPTOR,
            KERNEL_DATA_DESCRIPTOR,
            tss_low,
            tss_addr >> 32,
        ];
    }

    /// Loads this GDT, reloads the segment registers, and loads the task
    /// register.
    ///
    /// # Safety
    /// The table and its TSS must live for the rest of the CPU's life.
    pub unsafe fn load(&self) {
        let pointer = GdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const Self as u64,
        };

        unsafe {
            asm!(
                "lgdt [{}]",
                in(reg) &pointer,
                options(readonly, nostack, preserves_flags)
            );

            // Far-return to reload CS.
            asm!(
                "push {sel}",
                "lea {tmp}, [rip + 2f]",
                "push {tmp}",
                "retfq",
                "2:",
                sel = in(reg) KERNEL_CODE_SELECTOR as u64,
                tmp = lateout(reg) _,
                options(preserves_flags)
            );

            asm!(
                "mov ds, {sel:x}",
                "mov es, {sel:x}",
                "mov ss, {sel:x}",
                sel = in(reg) KERNEL_DATA_SELECTOR,
                options(nostack, preserves_flags)
            );

            asm!(
                "ltr {sel:x}",
                sel = in(reg) TSS_SELECTOR,
                options(nostack, preserves_flags)
            );
        }
    }
}

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}
