//! Local APIC driver.
//!
//! Every CPU owns a local APIC reached through MMIO at the base the
//! IA32_APIC_BASE MSR reports. It delivers the periodic preemption timer,
//! accepts end-of-interrupt writes, and sends the INIT and startup IPIs
//! that wake application processors.
//!
//! All cores share the same MMIO virtual window (the HHDM alias of the
//! base), but each write lands on the issuing core's own APIC.

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

const IA32_APIC_BASE_MSR: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;

const REG_ID: u32 = 0x020;
const REG_TPR: u32 = 0x080;
const REG_EOI: u32 = 0x0B0;
const REG_SVR: u32 = 0x0F0;
const REG_ERROR_STATUS: u32 = 0x280;
const REG_ICR_LOW: u32 = 0x300;
const REG_ICR_HIGH: u32 = 0x310;
const REG_LVT_TIMER: u32 = 0x320;
const REG_TIMER_INIT: u32 = 0x380;
const REG_TIMER_CURRENT: u32 = 0x390;
const REG_TIMER_DIVIDE: u32 = 0x3E0;

const SVR_ENABLE: u32 = 1 << 8;
const TIMER_PERIODIC: u32 = 1 << 17;
const LVT_MASKED: u32 = 1 << 16;

const ICR_DELIVERY_INIT: u32 = 0b101 << 8;
const ICR_DELIVERY_STARTUP: u32 = 0b110 << 8;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_PENDING: u32 = 1 << 12;

/// Timer divide configuration encodings.
#[repr(u32)]
#[derive(Clone, Copy)]
pub enum TimerDivide {
    By1 = 0b1011,
    By2 = 0b0000,
    By4 = 0b0001,
    By8 = 0b0010,
    By16 = 0b0011,
    By32 = 0b1000,
    By64 = 0b1001,
    By128 = 0b1010,
}

/// Virtual base of the APIC MMIO window; identical on every core.
static APIC_BASE: AtomicU64 = AtomicU64::new(0);

#[inline]
unsafe fn rdmsr(msr: u32) -> u64 {
    let (low, high): (u32, u32);
    unsafe {
        core::arch::asm!(
            "rdmsr",
            in("ecx") msr,
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags)
        );
    }
    (high as u64) << 32 | low as u64
}

#[inline]
unsafe fn wrmsr(msr: u32, value: u64) {
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nomem, nostack, preserves_flags)
        );
    }
}

#[inline]
fn read_reg(offset: u32) -> u32 {
    let base = APIC_BASE.load(Ordering::Relaxed);
    debug_assert!(base != 0, "APIC used before init");
    unsafe { ptr::read_volatile((base + offset as u64) as *const u32) }
}

#[inline]
fn write_reg(offset: u32, value: u32) {
    let base = APIC_BASE.load(Ordering::Relaxed);
    debug_assert!(base != 0, "APIC used before init");
    unsafe { ptr::write_volatile((base + offset as u64) as *mut u32, value) }
}

/// The physical base of the APIC MMIO window from the MSR.
pub fn physical_base() -> u64 {
    unsafe { rdmsr(IA32_APIC_BASE_MSR) & 0xFFFF_FFFF_FFFF_F000 }
}

/// Enables this core's APIC and programs its spurious vector.
///
/// `mmio_base` is the virtual alias of [`physical_base`]; the bootstrap
/// processor stores it once and every core reuses it. Returns the local
/// APIC id.
pub fn init(mmio_base: u64, spurious_vector: u8) -> u32 {
    unsafe {
        APIC_BASE.store(mmio_base, Ordering::Relaxed);

        let msr = rdmsr(IA32_APIC_BASE_MSR);
        if msr & APIC_BASE_ENABLE == 0 {
            wrmsr(IA32_APIC_BASE_MSR, msr | APIC_BASE_ENABLE);
        }
    }

    write_reg(REG_SVR, SVR_ENABLE | spurious_vector as u32);
    write_reg(REG_TPR, 0);

    id()
}

/// The local APIC id of the calling core.
pub fn id() -> u32 {
    read_reg(REG_ID) >> 24
}

/// Signals end-of-interrupt. Every APIC-delivered handler must write this
/// exactly once before returning.
#[inline]
pub fn eoi() {
    write_reg(REG_EOI, 0);
}

// ── Timer ───────────────────────────────────────────────────────

/// Arms the periodic timer on the calling core: `initial_count` APIC-timer
/// ticks per interrupt on `vector`.
pub fn start_timer(vector: u8, divide: TimerDivide, initial_count: u32) {
    write_reg(REG_TIMER_DIVIDE, divide as u32);
    write_reg(REG_LVT_TIMER, TIMER_PERIODIC | vector as u32);
    write_reg(REG_TIMER_INIT, initial_count);
}

/// Starts a masked one-shot count-down, used for calibration.
pub fn start_calibration(divide: TimerDivide) {
    write_reg(REG_TIMER_DIVIDE, divide as u32);
    write_reg(REG_LVT_TIMER, LVT_MASKED);
    write_reg(REG_TIMER_INIT, u32::MAX);
}

pub fn current_count() -> u32 {
    read_reg(REG_TIMER_CURRENT)
}

pub fn set_initial_count(initial_count: u32) {
    write_reg(REG_TIMER_INIT, initial_count);
}

// ── Inter-processor interrupts ──────────────────────────────────

fn wait_for_delivery() {
    while read_reg(REG_ICR_LOW) & ICR_PENDING != 0 {
        core::hint::spin_loop();
    }
}

fn send_ipi(apic_id: u32, low: u32) {
    write_reg(REG_ERROR_STATUS, 0);
    write_reg(REG_ICR_HIGH, apic_id << 24);
    write_reg(REG_ICR_LOW, low);
    wait_for_delivery();
}

/// Sends an INIT IPI, putting the target core into wait-for-SIPI state.
pub fn send_init(apic_id: u32) {
    send_ipi(apic_id, ICR_DELIVERY_INIT | ICR_LEVEL_ASSERT);
}

/// Sends a startup IPI; the target begins real-mode execution at
/// `page * 0x1000`.
pub fn send_startup(apic_id: u32, page: u8) {
    send_ipi(apic_id, ICR_DELIVERY_STARTUP | ICR_LEVEL_ASSERT | page as u32);
}
