// =============================================================================
// Basalt — Per-Address-Space Virtual Memory Manager
// =============================================================================
//
// Each address space owns three things: a TLSF heap over the virtual window
// it hands out, a page-table walker binding virtual to physical, and an
// ordered map from the *tail* virtual address of each segment to its
// descriptor. Keying by the tail means a lower-bound probe on any address
// finds the segment that would contain it.
//
// `map` is rollback-complete: virtual space, physical frames, and page
// bindings are acquired in that order and released in reverse on failure.
// `unmap` walks every segment intersecting the request and decides from the
// segment's relation to it whether to erase, trim, or split; after every
// mutation the scan restarts from the updated map.
//
// Like the PMM, the manager is not internally locked; the kernel wraps
// each address space in an exclusive lock for mutations.
// =============================================================================

use alloc::collections::BTreeMap;

use kheap::{HeapStats, TlsfAllocation, TlsfHeap};
use krange::{split_range, Point};

use crate::address::{
    AddressMapping, MemoryRange, MemoryType, PageFlags, VirtAddr, VirtualRange, PAGE_SIZE,
};
use crate::paging::PageTables;
use crate::pmm::MemoryManager;
use crate::MemError;

/// One mapped span of the address space.
#[derive(Clone, Copy, Debug)]
struct AddressSegment {
    virtual_range: VirtualRange,
    physical_range: MemoryRange,
    /// Backing allocation in the local virtual heap. `None` for ranges
    /// described at boot (firmware regions, the kernel image) which live
    /// outside the managed window and are never unmapped.
    allocation: Option<TlsfAllocation>,
}

impl AddressSegment {
    /// The physical addresses backing a sub-range of this segment.
    fn physical_part(&self, part: VirtualRange) -> MemoryRange {
        debug_assert!(self.virtual_range.contains(part));
        let offset = part.front.addr() - self.virtual_range.front.addr();
        MemoryRange::of(self.physical_range.front.add(offset), part.size())
    }
}

/// An address space: virtual allocator, page tables, and segment table.
pub struct AddressSpaceManager {
    heap: TlsfHeap,
    window: VirtualRange,
    tables: PageTables,
    segments: BTreeMap<u64, AddressSegment>,
}

impl AddressSpaceManager {
    /// Creates an address space allocating out of `window`, binding pages
    /// through `tables`.
    pub fn new(window: VirtualRange, tables: PageTables) -> Result<Self, MemError> {
        let heap = TlsfHeap::new(window.front.addr(), window.back.addr())?;
        Ok(Self {
            heap,
            window,
            tables,
            segments: BTreeMap::new(),
        })
    }

    /// The walker, for translation queries.
    pub fn tables(&self) -> &PageTables {
        &self.tables
    }

    /// Allocates `size` bytes of virtual space, backs it with fresh
    /// physical frames, and binds the two.
    ///
    /// Failures roll back in reverse order of acquisition.
    pub fn map(
        &mut self,
        pmm: &mut MemoryManager,
        size: u64,
        align: u64,
        flags: PageFlags,
        memory_type: MemoryType,
    ) -> Result<AddressMapping, MemError> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(MemError::InvalidInput);
        }

        let align = align.max(PAGE_SIZE);
        let allocation = self
            .heap
            .alloc_aligned(align, size)
            .ok_or(MemError::OutOfMemory)?;

        let physical = match pmm.allocate(size) {
            Ok(range) => range,
            Err(err) => {
                self.heap.free(allocation);
                return Err(err);
            }
        };

        let mapping = AddressMapping::new(
            VirtAddr::new(self.heap.offset_of(allocation)),
            physical.front,
            size,
        );

        if let Err(err) = self.tables.map(mapping, flags, memory_type) {
            pmm.release(physical)
                .expect("rollback of a fresh physical allocation failed");
            self.heap.free(allocation);
            return Err(err);
        }

        self.insert(AddressSegment {
            virtual_range: mapping.virtual_range(),
            physical_range: physical,
            allocation: Some(allocation),
        });

        Ok(mapping)
    }

    /// Binds an already-chosen `{vaddr, paddr}` pair and records it, without
    /// allocating physical frames. Used for device windows and boot-time
    /// regions whose placement is dictated from outside.
    ///
    /// The range must lie outside the managed allocation window.
    pub fn reserve(
        &mut self,
        mapping: AddressMapping,
        flags: PageFlags,
        memory_type: MemoryType,
    ) -> Result<(), MemError> {
        if mapping.is_empty() || self.window.intersects(mapping.virtual_range()) {
            return Err(MemError::InvalidInput);
        }

        self.tables.map(mapping, flags, memory_type)?;
        self.insert(AddressSegment {
            virtual_range: mapping.virtual_range(),
            physical_range: mapping.physical_range(),
            allocation: None,
        });
        Ok(())
    }

    /// Records a mapping installed by the bootloader without touching the
    /// page tables. The higher-half direct map is described this way.
    pub fn describe(&mut self, mapping: AddressMapping) -> Result<(), MemError> {
        if mapping.is_empty() || self.window.intersects(mapping.virtual_range()) {
            return Err(MemError::InvalidInput);
        }

        self.insert(AddressSegment {
            virtual_range: mapping.virtual_range(),
            physical_range: mapping.physical_range(),
            allocation: None,
        });
        Ok(())
    }

    /// Unmaps every part of `range` this address space has mapped,
    /// releasing the backing frames, the page bindings, and the virtual
    /// space. Segments only partially covered are split and the uncovered
    /// parts survive.
    pub fn unmap(&mut self, pmm: &mut MemoryManager, range: VirtualRange) -> Result<(), MemError> {
        let mut remaining = range;

        // The scan restarts from the map after every mutation; the tree may
        // have been rebalanced by the inserts and removals.
        loop {
            if remaining.is_empty() {
                return Ok(());
            }

            // First segment whose tail lies beyond the request front.
            let Some((&key, &segment)) = self
                .segments
                .range(remaining.front.addr() + 1..)
                .next()
            else {
                return Ok(());
            };

            let seg = segment.virtual_range;
            if seg.is_after(remaining) {
                return Ok(());
            }

            let Some(allocation) = segment.allocation else {
                // Described boot regions are permanent; skip past them.
                if seg.back.addr() >= remaining.back.addr() {
                    return Ok(());
                }
                remaining = VirtualRange::new(seg.back, remaining.back);
                continue;
            };

            if seg == remaining {
                // |--------seg-------|
                // |-------range------|
                self.segments.remove(&key);
                self.release_piece(pmm, &segment, seg, allocation);
                return Ok(());
            } else if remaining.contains(seg) {
                //     |-----seg-----|
                // |--------range--------|
                self.segments.remove(&key);
                self.release_piece(pmm, &segment, seg, allocation);
                remaining = VirtualRange::new(seg.back, remaining.back);
                continue;
            } else if seg.contains(remaining) && remaining.front == seg.front {
                // |--------seg-------|
                // |--range--|
                let (lo, hi) = self.heap.split(allocation, remaining.back.addr())?;
                self.segments.remove(&key);
                self.insert(AddressSegment {
                    virtual_range: VirtualRange::new(remaining.back, seg.back),
                    physical_range: segment.physical_part(VirtualRange::new(remaining.back, seg.back)),
                    allocation: Some(hi),
                });
                self.release_piece(pmm, &segment, remaining, lo);
                return Ok(());
            } else if seg.contains(remaining) && remaining.back == seg.back {
                // |--------seg-------|
                //          |--range--|
                let (lo, hi) = self.heap.split(allocation, remaining.front.addr())?;
                self.segments.remove(&key);
                self.insert(AddressSegment {
                    virtual_range: VirtualRange::new(seg.front, remaining.front),
                    physical_range: segment.physical_part(VirtualRange::new(seg.front, remaining.front)),
                    allocation: Some(lo),
                });
                self.release_piece(pmm, &segment, remaining, hi);
                return Ok(());
            } else if seg.contains(remaining) {
                // |--------seg-------|
                //       |--range--|
                let (left, right) = split_range(seg, remaining);
                let (lo, rest) = self.heap.split(allocation, remaining.front.addr())?;
                let (mid, hi) = self.heap.split(rest, remaining.back.addr())?;

                self.segments.remove(&key);
                self.insert(AddressSegment {
                    virtual_range: left,
                    physical_range: segment.physical_part(left),
                    allocation: Some(lo),
                });
                self.insert(AddressSegment {
                    virtual_range: right,
                    physical_range: segment.physical_part(right),
                    allocation: Some(hi),
                });
                self.release_piece(pmm, &segment, remaining, mid);
                return Ok(());
            } else if seg.front > remaining.front {
                //       |--------seg-------|
                // |-----range-----|
                let covered = VirtualRange::new(seg.front, remaining.back);
                let (lo, hi) = self.heap.split(allocation, covered.back.addr())?;
                self.segments.remove(&key);
                self.insert(AddressSegment {
                    virtual_range: VirtualRange::new(covered.back, seg.back),
                    physical_range: segment.physical_part(VirtualRange::new(covered.back, seg.back)),
                    allocation: Some(hi),
                });
                self.release_piece(pmm, &segment, covered, lo);
                return Ok(());
            } else {
                // |--------seg-------|
                //          |-----range-----|
                let covered = VirtualRange::new(remaining.front, seg.back);
                let (lo, hi) = self.heap.split(allocation, covered.front.addr())?;
                self.segments.remove(&key);
                self.insert(AddressSegment {
                    virtual_range: VirtualRange::new(seg.front, covered.front),
                    physical_range: segment.physical_part(VirtualRange::new(seg.front, covered.front)),
                    allocation: Some(lo),
                });
                self.release_piece(pmm, &segment, covered, hi);
                remaining = VirtualRange::new(seg.back, remaining.back);
                continue;
            }
        }
    }

    /// Number of live segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    fn insert(&mut self, segment: AddressSegment) {
        debug_assert!(!segment.virtual_range.is_empty());
        self.segments
            .insert(segment.virtual_range.back.addr(), segment);
    }

    /// Releases one covered piece: physical frames, page bindings, then
    /// the virtual allocation.
    fn release_piece(
        &mut self,
        pmm: &mut MemoryManager,
        segment: &AddressSegment,
        part: VirtualRange,
        allocation: TlsfAllocation,
    ) {
        // A segment's backing was retained when it was created; failing to
        // release it here means the bookkeeping is corrupt, which is a bug.
        pmm.release(segment.physical_part(part))
            .expect("segment backing was not retained");

        self.tables
            .unmap(part)
            .expect("unbinding a mapped segment failed");

        self.heap.free(allocation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PhysAddr;
    use krange::round_up;

    fn no_invalidate(_addr: VirtAddr) {}

    fn walker(tables: usize) -> PageTables {
        let bytes = tables * PAGE_SIZE as usize;
        let buffer = alloc::vec![0u8; bytes + PAGE_SIZE as usize].leak();
        let base = round_up(buffer.as_mut_ptr() as u64, PAGE_SIZE);

        PageTables::new(
            AddressMapping::new(VirtAddr::new(base), PhysAddr::new(base), bytes as u64),
            no_invalidate,
        )
        .unwrap()
    }

    const WINDOW: VirtualRange = VirtualRange {
        front: VirtAddr::new(0xFFFF_A000_0000_0000),
        back: VirtAddr::new(0xFFFF_A000_0100_0000),
    };

    fn setup() -> (AddressSpaceManager, MemoryManager) {
        let vmm = AddressSpaceManager::new(WINDOW, walker(64)).unwrap();
        let pmm = MemoryManager::new(MemoryRange::new(
            PhysAddr::new(0x10_0000),
            PhysAddr::new(0x100_0000),
        ))
        .unwrap();
        (vmm, pmm)
    }

    #[test]
    fn map_binds_and_records() {
        let (mut vmm, mut pmm) = setup();

        let mapping = vmm
            .map(&mut pmm, 0x4000, PAGE_SIZE, PageFlags::READ | PageFlags::WRITE, MemoryType::WriteBack)
            .unwrap();

        assert!(WINDOW.contains(mapping.virtual_range()));
        assert_eq!(vmm.segment_count(), 1);

        // Every page translates to its backing frame.
        for offset in (0..0x4000).step_by(0x1000) {
            assert_eq!(
                vmm.tables().backing_address(mapping.vaddr.add(offset)),
                Some(mapping.paddr.add(offset))
            );
        }
    }

    #[test]
    fn unmap_restores_empty_state() {
        let (mut vmm, mut pmm) = setup();
        let free_before = pmm.free_space();

        let mapping = vmm
            .map(&mut pmm, 0x4000, PAGE_SIZE, PageFlags::ALL, MemoryType::WriteBack)
            .unwrap();
        vmm.unmap(&mut pmm, mapping.virtual_range()).unwrap();

        // The segment table is empty and the local heap has exactly one
        // free block spanning the original window.
        assert_eq!(vmm.segment_count(), 0);
        let stats = vmm.heap_stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_size, WINDOW.size());

        // Frames went back to the PMM and the pages are unbound.
        assert_eq!(pmm.free_space(), free_before);
        assert_eq!(vmm.tables().backing_address(mapping.vaddr), None);
    }

    #[test]
    fn partial_unmap_keeps_uncovered_parts() {
        let (mut vmm, mut pmm) = setup();

        let mapping = vmm
            .map(&mut pmm, 0x4000, PAGE_SIZE, PageFlags::ALL, MemoryType::WriteBack)
            .unwrap();

        // Unmap the middle two pages: the segment splits into two.
        let middle = VirtualRange::of(mapping.vaddr.add(0x1000), 0x2000);
        vmm.unmap(&mut pmm, middle).unwrap();

        assert_eq!(vmm.segment_count(), 2);
        assert!(vmm.tables().backing_address(mapping.vaddr).is_some());
        assert_eq!(vmm.tables().backing_address(middle.front), None);
        assert!(vmm
            .tables()
            .backing_address(mapping.vaddr.add(0x3000))
            .is_some());

        // The ends keep their original backing.
        assert_eq!(
            vmm.tables().backing_address(mapping.vaddr.add(0x3000)),
            Some(mapping.paddr.add(0x3000))
        );

        // Removing the rest empties the space.
        vmm.unmap(&mut pmm, mapping.virtual_range()).unwrap();
        assert_eq!(vmm.segment_count(), 0);
        assert_eq!(vmm.heap_stats().free_size, WINDOW.size());
    }

    #[test]
    fn unmap_spanning_multiple_segments() {
        let (mut vmm, mut pmm) = setup();

        let a = vmm
            .map(&mut pmm, 0x2000, PAGE_SIZE, PageFlags::ALL, MemoryType::WriteBack)
            .unwrap();
        let b = vmm
            .map(&mut pmm, 0x2000, PAGE_SIZE, PageFlags::ALL, MemoryType::WriteBack)
            .unwrap();

        // Both segments fall in one request.
        let both = VirtualRange::new(a.virtual_range().front, b.virtual_range().back);
        vmm.unmap(&mut pmm, both).unwrap();

        assert_eq!(vmm.segment_count(), 0);
        assert_eq!(vmm.heap_stats().free_size, WINDOW.size());
    }

    #[test]
    fn unmap_shared_endpoint_splits_once() {
        let (mut vmm, mut pmm) = setup();

        let mapping = vmm
            .map(&mut pmm, 0x4000, PAGE_SIZE, PageFlags::ALL, MemoryType::WriteBack)
            .unwrap();

        // Shares the segment's front.
        let head = VirtualRange::of(mapping.vaddr, 0x1000);
        vmm.unmap(&mut pmm, head).unwrap();

        assert_eq!(vmm.segment_count(), 1);
        assert_eq!(vmm.tables().backing_address(mapping.vaddr), None);
        assert_eq!(
            vmm.tables().backing_address(mapping.vaddr.add(0x1000)),
            Some(mapping.paddr.add(0x1000))
        );
    }

    #[test]
    fn map_failure_rolls_back() {
        let (mut vmm, mut pmm) = setup();
        let free_before = pmm.free_space();

        // Fits the virtual window but exceeds the physical pool: the PMM
        // refuses, and the virtual reservation must be rolled back.
        let result = vmm.map(&mut pmm, 0x100_0000, PAGE_SIZE, PageFlags::ALL, MemoryType::WriteBack);
        assert!(result.is_err());

        assert_eq!(vmm.segment_count(), 0);
        assert_eq!(vmm.heap_stats().free_size, WINDOW.size());
        assert_eq!(pmm.free_space(), free_before);
    }

    #[test]
    fn reserve_and_describe() {
        let (mut vmm, mut pmm) = setup();

        // A device window outside the managed range.
        let mmio = AddressMapping::new(
            VirtAddr::new(0xFFFF_B000_0000_0000),
            PhysAddr::new(0xFEE0_0000),
            0x1000,
        );
        vmm.reserve(mmio, PageFlags::READ | PageFlags::WRITE, MemoryType::Uncached)
            .unwrap();
        assert_eq!(
            vmm.tables().backing_address(mmio.vaddr),
            Some(mmio.paddr)
        );

        // Described regions are recorded without touching the tables.
        let hhdm = AddressMapping::new(
            VirtAddr::new(0xFFFF_C000_0000_0000),
            PhysAddr::new(0),
            0x1000_0000,
        );
        vmm.describe(hhdm).unwrap();
        assert_eq!(vmm.segment_count(), 2);

        // Reservations inside the allocation window are rejected.
        let inside = AddressMapping::new(WINDOW.front, PhysAddr::new(0x30_0000), 0x1000);
        assert_eq!(
            vmm.reserve(inside, PageFlags::READ, MemoryType::WriteBack),
            Err(MemError::InvalidInput)
        );

        // Unmapping across a described region leaves it untouched.
        vmm.unmap(&mut pmm, hhdm.virtual_range()).unwrap();
        assert_eq!(vmm.segment_count(), 2);
    }
}
