//! Per-CPU state, reachable through the GS segment base.
//!
//! Each core owns one `CpuLocal` slot: its GDT and TSS, a boot/interrupt
//! stack pair, and the pointer to its schedule. The GS base MSR points at
//! the slot, with `core_id` pinned at offset 0 so a single GS-relative
//! read identifies the core.

use core::arch::asm;
use core::cell::UnsafeCell;

use alloc::sync::Arc;
use ksched::CpuLocalSchedule;

use super::cpu;
use super::gdt::Gdt;
use super::tss::Tss;

/// Upper bound on supported cores.
pub const MAX_CPUS: usize = 32;

/// Per-core boot/idle stack (16 KiB).
const CORE_STACK_SIZE: usize = 4096 * 4;

/// Per-core IST stack for the double-fault handler (16 KiB).
const IST_STACK_SIZE: usize = 4096 * 4;

#[repr(C, align(16))]
struct CoreStack {
    data: [u8; CORE_STACK_SIZE],
}

#[repr(C, align(16))]
struct IstStack {
    data: [u8; IST_STACK_SIZE],
}

/// Core-local data. `core_id` MUST stay at offset 0.
#[repr(C)]
pub struct CpuLocal {
    /// Core index (0 = bootstrap processor).
    pub core_id: u32,
    /// Local APIC id of this core.
    pub apic_id: u32,
    tss: Tss,
    gdt: Gdt,
    schedule: Option<Arc<CpuLocalSchedule>>,
    kernel_stack: CoreStack,
    ist_stack: IstStack,
}

impl CpuLocal {
    const EMPTY: CpuLocal = CpuLocal {
        core_id: 0,
        apic_id: 0,
        tss: Tss::new(),
        gdt: Gdt::zeroed(),
        schedule: None,
        kernel_stack: CoreStack {
            data: [0; CORE_STACK_SIZE],
        },
        ist_stack: IstStack {
            data: [0; IST_STACK_SIZE],
        },
    };

    fn init(&mut self, core_id: u32, apic_id: u32) {
        self.core_id = core_id;
        self.apic_id = apic_id;

        // Stacks grow down; the TSS holds the tops.
        self.tss.rsp[0] = self.kernel_stack.data.as_ptr() as u64 + CORE_STACK_SIZE as u64;
        self.tss.ist[0] = self.ist_stack.data.as_ptr() as u64 + IST_STACK_SIZE as u64;

        let tss = &self.tss as *const Tss;
        // SAFETY: the TSS lives in the same 'static slot as the GDT.
        self.gdt.init(unsafe { &*tss });
    }

    pub fn schedule(&self) -> Option<&Arc<CpuLocalSchedule>> {
        self.schedule.as_ref()
    }

    /// Top of this core's boot stack.
    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack.data.as_ptr() as u64 + CORE_STACK_SIZE as u64
    }

    /// Points RSP0 at the stack used on the next privilege transition.
    pub fn set_rsp0(&self, rsp0: u64) {
        // SAFETY: the TSS field is only written by its own core.
        unsafe {
            let tss = &self.tss as *const Tss as *mut Tss;
            (*tss).rsp[0] = rsp0;
        }
    }
}

struct Slots(UnsafeCell<[CpuLocal; MAX_CPUS]>);

// SAFETY: each slot is initialized by one core before being published and
// only mutated by its own core afterwards.
unsafe impl Sync for Slots {}

static CPU_LOCALS: Slots = Slots(UnsafeCell::new([CpuLocal::EMPTY; MAX_CPUS]));

/// Exclusive access to a slot during its core's bring-up.
///
/// # Safety
/// Only the core being brought up (or the BSP preparing it) may call this,
/// and only before the slot is used from interrupt context.
pub unsafe fn slot_mut(index: usize) -> &'static mut CpuLocal {
    debug_assert!(index < MAX_CPUS);
    unsafe { &mut (*CPU_LOCALS.0.get())[index] }
}

fn slot(index: usize) -> &'static CpuLocal {
    unsafe { &(*CPU_LOCALS.0.get())[index] }
}

/// Initializes and activates the calling core's slot: GDT, TSS, and the
/// GS bases.
///
/// # Safety
/// Must run exactly once per core, before interrupts are enabled on it.
pub unsafe fn install(index: usize, apic_id: u32) {
    unsafe {
        let local = slot_mut(index);
        local.init(index as u32, apic_id);
        local.gdt.load();

        let base = local as *const CpuLocal as u64;
        cpu::wrmsr(cpu::IA32_GS_BASE, base);
        cpu::wrmsr(cpu::IA32_KERNEL_GS_BASE, base);
    }
}

/// Attaches a schedule to a slot during bring-up.
///
/// # Safety
/// Same constraints as [`slot_mut`].
pub unsafe fn set_schedule(index: usize, schedule: Arc<CpuLocalSchedule>) {
    unsafe {
        slot_mut(index).schedule = Some(schedule);
    }
}

/// The calling core's id, from the first word of its GS slot.
#[inline]
pub fn core_id() -> u32 {
    let id: u32;
    unsafe {
        asm!(
            "mov {:e}, gs:[0]",
            out(reg) id,
            options(nomem, nostack, preserves_flags)
        );
    }
    id
}

/// The calling core's slot.
pub fn current() -> &'static CpuLocal {
    slot(core_id() as usize)
}
