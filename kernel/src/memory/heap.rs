// =============================================================================
// Basalt — Kernel Heap
// =============================================================================
//
// The global allocator behind `alloc`. The heap is a single contiguous
// region carved from the front of the first large-enough usable memory
// region, accessed through the HHDM, and handed to a linked-list
// allocator. It is the first memory subsystem brought up because the
// physical memory manager's own bookkeeping lives in `alloc` collections.
// =============================================================================

use limine::memory_map::{Entry, EntryType};
use linked_list_allocator::LockedHeap;

use kmem::{MemoryRange, PhysAddr};

/// 16 MiB of kernel heap.
const HEAP_SIZE: u64 = 16 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Picks the heap region out of the memory map and initializes the
/// allocator over its HHDM alias. Returns the carved physical range so
/// the physical memory manager can exclude it from its pools.
///
/// Must run once, single-core, after the HHDM offset is known.
pub unsafe fn init(memmap: &[&Entry]) -> MemoryRange {
    let region = memmap
        .iter()
        .find(|entry| {
            entry.entry_type == EntryType::USABLE
                && entry.base >= 0x10_0000
                && entry.length >= HEAP_SIZE
        })
        .expect("no usable region large enough for the kernel heap");

    let range = MemoryRange::of(PhysAddr::new(region.base), HEAP_SIZE);
    let base = range.front.to_virt().as_mut_ptr::<u8>();

    unsafe {
        ALLOCATOR.lock().init(base, HEAP_SIZE as usize);
    }

    range
}
