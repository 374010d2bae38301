// =============================================================================
// Basalt — SMP Bring-up
// =============================================================================
//
// Application processors start in real mode. The bootstrap processor
// copies a small trampoline blob to a fixed low-memory page and fills an
// info page next to it with everything the AP needs to climb into long
// mode: the long-mode entry point, the PAT value, the page-table root, a
// stack, and a temporary GDT. An INIT IPI followed by a startup IPI points
// the AP at the trampoline; the AP raises `ready` once it is fully up, and
// the BSP polls that flag so at most one trampoline is in flight.
//
// The info page constrains the page-table root to the first 4 GiB: the
// trampoline loads CR3 before leaving 32-bit operand sizes behind.
// =============================================================================

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use kmem::PhysAddr;

use crate::arch::{cpu, local};
use crate::task;
use crate::time;
use crate::traps;

/// Physical addresses of the info page and the trampoline page.
const SMP_INFO: u64 = 0x7000;
const SMP_TRAMPOLINE: u64 = 0x8000;

/// Startup IPI page number (`SMP_TRAMPOLINE >> 12`).
const SIPI_PAGE: u8 = 0x8;

/// Gate: APs spin after bring-up until the BSP releases them into the
/// scheduler, so no AP takes a timer interrupt before the idle threads
/// exist.
static AP_GO: AtomicBool = AtomicBool::new(false);

/// Number of cores online, the BSP included.
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// GDTR image, byte-packed the way `lgdt` reads it.
#[repr(C, packed)]
struct Gdtr {
    limit: u16,
    base: u64,
}

/// The info page layout the trampoline expects.
///
/// Field offsets are baked into the assembly below; keep the two in sync:
///   0x00 entry, 0x08 pat, 0x10 pml4, 0x18 stack, 0x20 cpu_index,
///   0x24 apic_id, 0x28 gdt, 0x50 gdtr, 0x5C ready.
#[repr(C)]
struct SmpInfo {
    /// Long-mode entry point, called with the info pointer.
    entry: u64,
    /// PAT value every core must share while paging is enabled.
    pat: u64,
    /// Physical address of the kernel PML4. 32-bit by construction.
    pml4: u32,
    _reserved: u32,
    /// Stack top for the starting AP.
    stack: u64,
    /// Core index assigned by the BSP.
    cpu_index: u32,
    /// APIC id the BSP is waking.
    apic_id: u32,
    /// Temporary GDT: null, 32-bit code, 32-bit data, 64-bit code,
    /// 64-bit data.
    gdt: [u64; 5],
    /// Points at `gdt`.
    gdtr: Gdtr,
    /// Raised by the AP once it is fully initialized.
    ready: AtomicU32,
}

const _: () = {
    assert!(core::mem::offset_of!(SmpInfo, stack) == 0x18);
    assert!(core::mem::offset_of!(SmpInfo, gdt) == 0x28);
    assert!(core::mem::offset_of!(SmpInfo, gdtr) == 0x50);
    assert!(core::mem::offset_of!(SmpInfo, ready) == 0x5C);
};

core::arch::global_asm!(
    r#"
.section .text
.global smp_trampoline_start
.global smp_trampoline_end

// Executes at physical 0x8000 in real mode. All data references are
// absolute addresses into the info page at 0x7000.
.code16
smp_trampoline_start:
    cli
    cld
    xorw %ax, %ax
    movw %ax, %ds

    // Temporary GDT from the info page.
    lgdtl 0x7050

    // PAE on.
    movl %cr4, %eax
    orl $0x20, %eax
    movl %eax, %cr4

    // Kernel page tables.
    movl 0x7010, %eax
    movl %eax, %cr3

    // The PAT must match the BSP before paging turns on.
    movl $0x277, %ecx
    movl 0x7008, %eax
    movl 0x700C, %edx
    wrmsr

    // Long mode enable plus no-execute.
    movl $0xC0000080, %ecx
    rdmsr
    orl $0x900, %eax
    wrmsr

    // Protection and paging in one step: real mode straight to long mode.
    movl %cr0, %eax
    orl $0x80000001, %eax
    movl %eax, %cr0

    // Far jump into the 64-bit code segment.
    ljmpl $0x18, $(0x8000 + smp_trampoline_long - smp_trampoline_start)

.code64
smp_trampoline_long:
    movw $0x20, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss

    movq 0x7018, %rsp
    movq $0x7000, %rdi
    movq 0x7000, %rax
    callq *%rax

    // The entry point never returns.
1:  hlt
    jmp 1b

smp_trampoline_end:
"#,
    options(att_syntax)
);

extern "C" {
    static smp_trampoline_start: u8;
    static smp_trampoline_end: u8;
}

/// True once the scheduler released the application processors.
pub fn released() -> bool {
    AP_GO.load(Ordering::Acquire)
}

/// Lets the parked APs enter the scheduler.
pub fn release_aps() {
    AP_GO.store(true, Ordering::Release);
}

pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Relaxed)
}

fn info_page() -> *mut SmpInfo {
    PhysAddr::new(SMP_INFO).to_virt().as_mut_ptr::<SmpInfo>()
}

/// Copies the trampoline blob into its fixed page.
fn install_trampoline() {
    let start = unsafe { core::ptr::addr_of!(smp_trampoline_start) };
    let end = unsafe { core::ptr::addr_of!(smp_trampoline_end) };
    let size = end as usize - start as usize;
    assert!(size <= 0x1000, "trampoline does not fit its page");

    let target = PhysAddr::new(SMP_TRAMPOLINE).to_virt().as_mut_ptr::<u8>();
    unsafe {
        core::ptr::copy_nonoverlapping(start, target, size);
    }
}

/// Wakes every application processor in `apic_ids`, one at a time.
///
/// The caller provides the APIC ids discovered by the firmware-table
/// layer; the BSP's own id is skipped. Each AP runs on the boot stack of
/// its per-CPU slot and is assigned a core index in bring-up order.
pub fn start_aps(apic_ids: &[u32], bsp_apic_id: u32, pml4: PhysAddr) {
    assert!(
        pml4.as_u64() < 0x1_0000_0000,
        "page-table root above 4 GiB cannot start APs"
    );

    install_trampoline();

    let info = info_page();
    let mut core_index: u32 = 1;

    for &apic_id in apic_ids {
        if apic_id == bsp_apic_id {
            continue;
        }
        if core_index as usize >= local::MAX_CPUS {
            log::warn!("ignoring APIC id {}: core limit reached", apic_id);
            continue;
        }

        // Register the slot before the AP looks itself up.
        let stack_top = unsafe {
            let slot = local::slot_mut(core_index as usize);
            slot.apic_id = apic_id;
            slot.kernel_stack_top()
        };

        unsafe {
            info.write(SmpInfo {
                entry: ap_start as usize as u64,
                pat: kmem::paging::PAT_VALUE,
                pml4: pml4.as_u64() as u32,
                _reserved: 0,
                stack: stack_top,
                cpu_index: core_index,
                apic_id,
                gdt: [
                    0,
                    0x00CF_9A00_0000_FFFF, // 32-bit code
                    0x00CF_9200_0000_FFFF, // 32-bit data
                    0x0020_9A00_0000_0000, // 64-bit code
                    0x0000_9200_0000_0000, // 64-bit data
                ],
                gdtr: Gdtr {
                    limit: 5 * 8 - 1,
                    base: SMP_INFO + 0x28,
                },
                ready: AtomicU32::new(0),
            });
        }

        log::debug!("waking AP {} (APIC id {})", core_index, apic_id);

        khal::apic::send_init(apic_id);
        time::busy_sleep_us(10_000);
        khal::apic::send_startup(apic_id, SIPI_PAGE);

        // One trampoline in flight: poll ready before touching the page
        // for the next AP.
        let ready = unsafe { &(*info).ready };
        let mut waited_us: u64 = 0;
        let mut resent = false;
        while ready.load(Ordering::Acquire) == 0 {
            time::busy_sleep_us(100);
            waited_us += 100;

            if waited_us >= 1_000 && !resent {
                khal::apic::send_startup(apic_id, SIPI_PAGE);
                resent = true;
            }
            if waited_us >= 500_000 {
                break;
            }
        }

        if ready.load(Ordering::Acquire) == 0 {
            log::warn!("AP {} (APIC id {}) did not come up", core_index, apic_id);
            continue;
        }

        CPU_COUNT.fetch_add(1, Ordering::Relaxed);
        core_index += 1;
    }

    log::info!("{} cores online", cpu_count());
}

/// Long-mode entry for every application processor.
extern "C" fn ap_start(info: &'static SmpInfo) -> ! {
    let index = info.cpu_index as usize;
    let apic_id = info.apic_id;

    unsafe {
        // Per-core GDT, TSS, and GS base.
        local::install(index, apic_id);
    }

    traps::load_on_ap();
    cpu::enable_fpu();
    khal::pic::disable();

    let spurious = traps::SPURIOUS_VECTOR_BASE + (index as u8 & 0xF);
    khal::apic::init(crate::memory::apic_mmio_base(), spurious);

    task::init_cpu(index as u32);
    time::start_preemption_timer();

    log::info!("AP {} (APIC id {}) online", index, apic_id);

    // Hand the page back to the BSP.
    info.ready.store(1, Ordering::Release);

    // Parked until the BSP has built the idle threads.
    while !released() {
        core::hint::spin_loop();
    }

    crate::sync::spinlock::enable_interrupts();
    task::idle_loop()
}
