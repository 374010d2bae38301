// =============================================================================
// Basalt — Boot Memory Setup
// =============================================================================
//
// Digests the boot memory map into the physical memory manager, builds the
// kernel's own page tables (the bootloader's are discarded), and wraps the
// kernel address space behind the global locks.
//
// Order matters here:
//   1. HHDM offset: every physical access goes through it.
//   2. Kernel heap: the managers keep their bookkeeping in `alloc`.
//   3. PMM pools: usable regions minus the heap carve and low memory.
//   4. Walker + kernel mappings (HHDM window, kernel image), CR3 switch.
//   5. Kernel address space over the dynamic window.
// =============================================================================

pub mod heap;

use core::sync::atomic::{AtomicU64, Ordering};

use limine::memory_map::{Entry, EntryType};

use kmem::{
    AddressMapping, AddressSpaceManager, MemError, MemoryManager, MemoryRange, MemoryType,
    PageFlags, PageTables, PhysAddr, VirtAddr, VirtualRange, LARGE_PAGE_SIZE, PAGE_SIZE,
};
use krange::{round_up, split_range};

use crate::arch::cpu;
use crate::sync::SpinLock;
use crate::util::events;

/// Dynamic kernel allocation window: 1 GiB starting clear of both the
/// HHDM and the kernel image.
const KERNEL_WINDOW: VirtualRange = VirtualRange {
    front: VirtAddr::new(0xFFFF_A000_0000_0000),
    back: VirtAddr::new(0xFFFF_A000_4000_0000),
};

/// Where the local APIC's MMIO page is reserved.
const APIC_WINDOW: VirtAddr = VirtAddr::new(0xFFFF_B000_0000_0000);

/// The arena interior page tables are carved from (2 MiB ≈ 512 tables).
const PT_ARENA_SIZE: u64 = LARGE_PAGE_SIZE;

/// Low memory is never handed out: it holds the SMP trampoline and
/// firmware leftovers.
const LOW_MEMORY_LIMIT: u64 = 0x10_0000;

static PMM: SpinLock<Option<MemoryManager>> = SpinLock::new(None);
static KERNEL_SPACE: SpinLock<Option<AddressSpaceManager>> = SpinLock::new(None);
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);
static APIC_MMIO: AtomicU64 = AtomicU64::new(0);

extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

fn invalidate(addr: VirtAddr) {
    cpu::invlpg(addr.as_u64());
}

/// Brings up every memory subsystem. Single-core, interrupts off.
pub fn init(hhdm_offset: u64, memmap: &[&Entry], kernel_phys: u64, kernel_virt: u64) {
    kmem::init_hhdm(hhdm_offset);

    // The heap carve comes out of the first big usable region.
    let heap_carve = unsafe { heap::init(memmap) };

    // Usable regions, minus low memory and the heap carve, become pools.
    // The kernel image, bootloader reclaimable, and ACPI regions carry
    // their own memory-map types and are never usable.
    let mut pmm: Option<MemoryManager> = None;
    let mut usable_total: u64 = 0;
    for entry in memmap {
        if entry.entry_type != EntryType::USABLE {
            continue;
        }

        let mut range = MemoryRange::new(
            PhysAddr::new(entry.base),
            PhysAddr::new(entry.base + entry.length),
        );
        if range.back.as_u64() <= LOW_MEMORY_LIMIT {
            continue;
        }
        if range.front.as_u64() < LOW_MEMORY_LIMIT {
            range.front = PhysAddr::new(LOW_MEMORY_LIMIT);
        }

        for piece in subtract(range, heap_carve) {
            if piece.is_empty() {
                continue;
            }

            usable_total += piece.size();
            match pmm.as_mut() {
                None => {
                    pmm = Some(MemoryManager::new(piece).expect("PMM creation failed"));
                }
                Some(pmm) => {
                    pmm.add_pool(piece).expect("PMM pool rejected");
                }
            }
        }
    }
    let mut pmm = pmm.expect("no usable physical memory");

    log::info!(
        "physical memory: {} MiB usable ({} bytes pooled)",
        usable_total / 1024 / 1024,
        usable_total,
    );

    // Page-table arena, then the kernel's own radix tree.
    let arena_phys = pmm
        .allocate(PT_ARENA_SIZE)
        .expect("no room for the page-table arena");
    let arena = AddressMapping::new(
        arena_phys.front.to_virt(),
        arena_phys.front,
        PT_ARENA_SIZE,
    );
    let tables = PageTables::new(arena, invalidate).expect("page-table root allocation failed");

    // The higher-half direct map: physical zero up to the highest
    // interesting address, write-back, 2 MiB pages throughout.
    let hhdm_size = round_up(highest_address(memmap), LARGE_PAGE_SIZE);
    let hhdm_mapping = AddressMapping::new(VirtAddr::new(hhdm_offset), PhysAddr::new(0), hhdm_size);
    tables
        .map(hhdm_mapping, PageFlags::READ | PageFlags::WRITE, MemoryType::WriteBack)
        .expect("mapping the direct map failed");

    // The kernel image, at the virtual base the bootloader chose.
    let image_start = unsafe { core::ptr::addr_of!(__kernel_start) } as u64;
    let image_end = round_up(unsafe { core::ptr::addr_of!(__kernel_end) } as u64, PAGE_SIZE);
    let image_mapping = AddressMapping::new(
        VirtAddr::new(image_start),
        PhysAddr::new(kernel_phys + (image_start - kernel_virt)),
        image_end - image_start,
    );
    tables
        .map(image_mapping, PageFlags::ALL, MemoryType::WriteBack)
        .expect("mapping the kernel image failed");

    // From here on the kernel runs on its own tables.
    let root = tables.root_addr();
    KERNEL_ROOT.store(root.as_u64(), Ordering::Release);
    unsafe {
        cpu::write_cr3(root.as_u64());
    }

    let mut space =
        AddressSpaceManager::new(KERNEL_WINDOW, tables).expect("kernel address space failed");
    space.describe(hhdm_mapping).expect("describing the HHDM failed");
    space
        .describe(image_mapping)
        .expect("describing the kernel image failed");

    // The local APIC's register page, uncached.
    let apic_phys = khal::apic::physical_base();
    space
        .reserve(
            AddressMapping::new(APIC_WINDOW, PhysAddr::new(apic_phys), PAGE_SIZE),
            PageFlags::READ | PageFlags::WRITE,
            MemoryType::Uncached,
        )
        .expect("reserving the APIC window failed");
    APIC_MMIO.store(APIC_WINDOW.as_u64(), Ordering::Release);

    log::info!(
        "kernel address space up: window {}..{}, free frames {} KiB",
        KERNEL_WINDOW.front,
        KERNEL_WINDOW.back,
        pmm.free_space() / 1024,
    );

    *PMM.lock() = Some(pmm);
    *KERNEL_SPACE.lock() = Some(space);
}

/// `range` minus the overlap with `carve`, as up to two pieces.
fn subtract(range: MemoryRange, carve: MemoryRange) -> [MemoryRange; 2] {
    if !range.intersects(carve) {
        return [range, MemoryRange::empty()];
    }
    if range.contains(carve) {
        let (lo, hi) = split_range(range, carve);
        return [lo, hi];
    }

    [range.cut(carve), MemoryRange::empty()]
}

fn highest_address(memmap: &[&Entry]) -> u64 {
    let mut highest = 0;
    for entry in memmap {
        let counted = matches!(
            entry.entry_type,
            EntryType::USABLE
                | EntryType::BOOTLOADER_RECLAIMABLE
                | EntryType::ACPI_RECLAIMABLE
                | EntryType::ACPI_NVS
                | EntryType::EXECUTABLE_AND_MODULES
                | EntryType::FRAMEBUFFER
        );
        if counted {
            highest = highest.max(entry.base + entry.length);
        }
    }
    highest
}

/// The physical address of the kernel PML4, for CR3 and AP bring-up.
pub fn kernel_root() -> PhysAddr {
    PhysAddr::new(KERNEL_ROOT.load(Ordering::Acquire))
}

/// Virtual base of the local APIC's registers.
pub fn apic_mmio_base() -> u64 {
    let base = APIC_MMIO.load(Ordering::Acquire);
    debug_assert!(base != 0, "APIC window not reserved yet");
    base
}

/// Runs `f` with the physical memory manager.
pub fn with_pmm<R>(f: impl FnOnce(&mut MemoryManager) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("PMM not initialized"))
}

/// Allocates physical frames, reporting to the debug stream.
pub fn allocate_frames(size: u64) -> Result<MemoryRange, MemError> {
    let range = with_pmm(|pmm| pmm.allocate(size))?;
    events::allocate_physical(events::AllocatePhysicalMemory {
        size,
        address: range.front.as_u64(),
        alignment: PAGE_SIZE as u32,
        tag: 0,
    });
    Ok(range)
}

/// Releases one reference to a range of frames, reporting to the debug
/// stream.
pub fn release_frames(range: MemoryRange) -> Result<(), MemError> {
    with_pmm(|pmm| pmm.release(range))?;
    events::release_physical(events::ReleasePhysicalMemory {
        begin: range.front.as_u64(),
        end: range.back.as_u64(),
        tag: 0,
    });
    Ok(())
}

/// Maps fresh kernel memory: virtual window + physical frames + bindings.
pub fn kernel_map(
    size: u64,
    align: u64,
    flags: PageFlags,
    memory_type: MemoryType,
) -> Result<AddressMapping, MemError> {
    let mut space = KERNEL_SPACE.lock();
    let space = space.as_mut().expect("kernel space not initialized");

    let mapping = with_pmm(|pmm| space.map(pmm, size, align, flags, memory_type))?;

    events::allocate_virtual(events::AllocateVirtualMemory {
        size,
        address: mapping.vaddr.as_u64(),
        alignment: align as u32,
        tag: 0,
    });
    events::allocate_physical(events::AllocatePhysicalMemory {
        size,
        address: mapping.paddr.as_u64(),
        alignment: PAGE_SIZE as u32,
        tag: 0,
    });
    Ok(mapping)
}

/// Unmaps kernel memory previously handed out by `kernel_map`.
pub fn kernel_unmap(range: VirtualRange) -> Result<(), MemError> {
    let mut space = KERNEL_SPACE.lock();
    let space = space.as_mut().expect("kernel space not initialized");

    with_pmm(|pmm| space.unmap(pmm, range))?;

    events::release_virtual(events::ReleaseVirtualMemory {
        begin: range.front.as_u64(),
        end: range.back.as_u64(),
        tag: 0,
    });
    Ok(())
}
