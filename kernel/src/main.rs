// =============================================================================
// Basalt — Kernel Entry
// =============================================================================
//
// Boot order is dictated by dependencies: serial output first so anything
// can complain, then memory (heap, physical manager, kernel page tables),
// then per-CPU state and interrupts, then timers, then the scheduler and
// the other cores. The bootstrap processor ends in the idle loop and the
// timer interrupt takes over from there.
// =============================================================================

#![no_std]
#![no_main]

extern crate alloc;

mod arch;
mod memory;
mod sync;
mod task;
mod time;
mod traps;
mod util;

use limine::request::{
    ExecutableAddressRequest, HhdmRequest, MemoryMapRequest, MpRequest,
};
use limine::BaseRevision;

use arch::{cpu, local, smp};

/// Base revision supported by this kernel.
#[used]
#[link_section = ".limine_requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

/// Higher-half direct map offset.
#[used]
#[link_section = ".limine_requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

/// The physical memory map.
#[used]
#[link_section = ".limine_requests"]
static MEMMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

/// Where the kernel image was loaded.
#[used]
#[link_section = ".limine_requests"]
static EXECUTABLE_ADDRESS_REQUEST: ExecutableAddressRequest = ExecutableAddressRequest::new();

/// The processor list. Only the APIC ids are consumed; bring-up itself is
/// done with INIT and startup IPIs.
#[used]
#[link_section = ".limine_requests"]
static MP_REQUEST: MpRequest = MpRequest::new();

/// Kernel entry point called by the bootloader.
#[no_mangle]
unsafe extern "C" fn _start() -> ! {
    assert!(BASE_REVISION.is_supported());
    kmain()
}

fn kmain() -> ! {
    khal::serial::init();
    util::logger::init();
    log::info!("basalt starting");

    cpu::load_pat();

    let hhdm = HHDM_REQUEST
        .get_response()
        .expect("bootloader provided no HHDM");
    let memmap = MEMMAP_REQUEST
        .get_response()
        .expect("bootloader provided no memory map");
    let kernel_address = EXECUTABLE_ADDRESS_REQUEST
        .get_response()
        .expect("bootloader provided no kernel address");

    memory::init(
        hhdm.offset(),
        memmap.entries(),
        kernel_address.physical_base(),
        kernel_address.virtual_base(),
    );

    util::events::init();
    memory_exercise();

    // Bootstrap processor: per-CPU state, interrupts, timers.
    let bsp_apic_id = cpu::initial_apic_id();
    unsafe {
        local::install(0, bsp_apic_id);
    }
    traps::init();
    cpu::enable_fpu();
    khal::pic::disable();
    khal::apic::init(memory::apic_mmio_base(), traps::SPURIOUS_VECTOR_BASE);
    time::init();
    if let Some(info) = time::stat() {
        log::debug!("clock stat: {} Hz, boot time {}", info.frequency_hz, info.boot_time);
    }

    // Scheduler, then the other cores.
    task::init();
    task::init_cpu(0);

    let mut apic_ids = alloc::vec::Vec::new();
    if let Some(mp) = MP_REQUEST.get_response() {
        for cpu in mp.cpus() {
            apic_ids.push(cpu.lapic_id);
        }
    }
    smp::start_aps(&apic_ids, bsp_apic_id, memory::kernel_root());

    // One idle thread per core, then let everyone schedule.
    task::spawn_idle_threads();
    task::spawn_boot_exercise();
    time::start_preemption_timer();
    smp::release_aps();

    log::info!("entering the scheduler");
    sync::spinlock::enable_interrupts();
    task::idle_loop()
}

/// Drives one map/touch/unmap round through the kernel address space so a
/// broken binding shows up before anything depends on it.
fn memory_exercise() {
    use kmem::{MemoryType, PageFlags, PAGE_SIZE};

    let mapping = memory::kernel_map(
        4 * PAGE_SIZE,
        PAGE_SIZE,
        PageFlags::READ | PageFlags::WRITE,
        MemoryType::WriteBack,
    )
    .expect("kernel map exercise failed");

    let probe = mapping.vaddr.as_mut_ptr::<u64>();
    unsafe {
        core::ptr::write_volatile(probe, 0xA5A5_5A5A_A5A5_5A5A);
        assert_eq!(core::ptr::read_volatile(probe), 0xA5A5_5A5A_A5A5_5A5A);
    }

    memory::kernel_unmap(mapping.virtual_range()).expect("kernel unmap exercise failed");

    // Frame retention: allocate, retain, release twice, gone.
    let frames = memory::allocate_frames(3 * PAGE_SIZE).expect("frame allocation failed");
    memory::with_pmm(|pmm| {
        pmm.retain(frames).expect("retain failed");
        assert_eq!(pmm.owners_of(frames.front), Some(2));
        pmm.release(frames).expect("first release failed");
        assert_eq!(pmm.owners_of(frames.front), Some(1));
    });
    memory::release_frames(frames).expect("final release failed");
    memory::with_pmm(|pmm| {
        assert_eq!(pmm.owners_of(frames.front), None);
    });

    log::debug!("memory exercise passed at {}", mapping.vaddr);
}
