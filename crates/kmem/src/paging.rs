// =============================================================================
// Basalt — Four-Level Page-Table Walker
// =============================================================================
//
// x86-64 translates 48-bit canonical virtual addresses through four levels:
//
//   PML4 (level 4) → PDPT (level 3) → PD (level 2) → PT (level 1) → page
//
// Each level is a 4 KiB table of 512 eight-byte entries. A leaf can sit at
// three depths: 4 KiB at the PT, 2 MiB at the PD (PS bit), 1 GiB at the
// PDPT (PS bit).
//
// The walker owns one radix tree. Interior tables come from a bump
// allocator seeded at construction with a single physically-contiguous
// region; the `slide` (virtual minus physical) of that region converts
// between the physical addresses stored in entries and the virtual
// pointers the walker dereferences. Seeding with an HHDM-mapped region
// gives the kernel walker; seeding with a plain buffer gives the hosted
// test walker; the code cannot tell the difference.
//
// Mutations hold the writer side of an internal lock; translations only
// read and take the shared side.
// =============================================================================

use bitflags::bitflags;
use spin::RwLock;

use crate::address::{
    AddressMapping, MemoryType, PageFlags, PhysAddr, VirtAddr, VirtualRange, LARGE_PAGE_SIZE,
    PAGE_SIZE,
};
use crate::MemError;
use krange::{round_down, round_up};

/// The PAT value the kernel programs on every CPU: index 0 = write-back,
/// 1 = write-through, 2 = uncached, 3 = write-combining (repeated in the
/// upper four slots). All mapping attributes are expressed with the
/// PWT/PCD index bits alone, so entries never need the PAT bit.
///
/// Byte layout, low to high: WB(06) WT(04) UC(00) WC(01), twice.
pub const PAT_VALUE: u64 = 0x0100_0406_0100_0406;

bitflags! {
    /// Raw x86-64 page-table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// 2 MiB leaf in a PD entry, 1 GiB leaf in a PDPT entry.
        const PAGE_SIZE     = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Bits 12-51: the physical frame number.
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// A single 8-byte page-table entry.
#[derive(Clone, Copy, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    /// Only meaningful at the PD and PDPT levels.
    #[inline]
    pub fn is_leaf(self) -> bool {
        self.0 & EntryFlags::PAGE_SIZE.bits() != 0
    }

    #[inline]
    fn set(&mut self, addr: PhysAddr, flags: EntryFlags) {
        debug_assert!(addr.as_u64() & !ADDR_MASK == 0 || addr.is_page_aligned());
        self.0 = (addr.as_u64() & ADDR_MASK) | flags.bits();
    }

    #[inline]
    fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.present() {
            write!(f, "PageEntry({} {:?})", self.addr(), self.flags())
        } else {
            write!(f, "PageEntry(empty)")
        }
    }
}

/// One 4 KiB table of 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; 512],
}

/// Leaf granularity observed by a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size1G,
}

impl PageSize {
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => PAGE_SIZE,
            PageSize::Size2M => LARGE_PAGE_SIZE,
            PageSize::Size1G => 0x4000_0000,
        }
    }
}

/// Snapshot of the entries met while translating one address.
///
/// The walk stops at the first non-present or leaf entry; entries below
/// the stop point read as empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageWalk {
    pub address: VirtAddr,
    pub pml4e: PageEntry,
    pub pdpte: PageEntry,
    pub pdte: PageEntry,
    pub pte: PageEntry,
}

impl PageWalk {
    /// The leaf granularity, if the address is mapped at all.
    pub fn page_size(&self) -> Option<PageSize> {
        if self.pdpte.present() && self.pdpte.is_leaf() {
            Some(PageSize::Size1G)
        } else if self.pdte.present() && self.pdte.is_leaf() {
            Some(PageSize::Size2M)
        } else if self.pte.present() {
            Some(PageSize::Size4K)
        } else {
            None
        }
    }

    fn leaf(&self) -> Option<PageEntry> {
        match self.page_size()? {
            PageSize::Size1G => Some(self.pdpte),
            PageSize::Size2M => Some(self.pdte),
            PageSize::Size4K => Some(self.pte),
        }
    }

    /// The access flags installed on the leaf, empty when unmapped.
    pub fn flags(&self) -> PageFlags {
        let Some(leaf) = self.leaf() else {
            return PageFlags::empty();
        };

        let raw = leaf.flags();
        let mut flags = PageFlags::READ;
        if raw.contains(EntryFlags::WRITABLE) {
            flags |= PageFlags::WRITE;
        }
        if !raw.contains(EntryFlags::NO_EXECUTE) {
            flags |= PageFlags::EXECUTE;
        }
        if raw.contains(EntryFlags::USER) {
            flags |= PageFlags::USER;
        }
        if raw.contains(EntryFlags::WRITE_THROUGH) {
            flags |= PageFlags::WRITE_THROUGH;
        }
        if raw.contains(EntryFlags::CACHE_DISABLE) {
            flags |= PageFlags::CACHE_DISABLE;
        }
        flags
    }
}

/// Bump-allocator cursor over the table region.
struct TableArena {
    cursor: u64,
    end: u64,
}

/// A four-level page-table radix tree plus the arena its interior tables
/// are carved from.
pub struct PageTables {
    slide: i64,
    root: *mut PageTable,
    arena: RwLock<TableArena>,
    invalidate: fn(VirtAddr),
}

// The raw table pointers are only dereferenced under the arena lock (writes)
// or for read-only walks (reads), and the arena region is exclusively owned.
unsafe impl Send for PageTables {}
unsafe impl Sync for PageTables {}

impl PageTables {
    /// Creates a walker with a fresh root table.
    ///
    /// `pte_memory` describes the physically-contiguous region interior
    /// tables are allocated from; its slide converts entry addresses back
    /// to dereferencable pointers. `invalidate` runs once per 4 KiB of
    /// every unmapped range.
    pub fn new(pte_memory: AddressMapping, invalidate: fn(VirtAddr)) -> Option<Self> {
        let mut arena = TableArena {
            cursor: pte_memory.vaddr.as_u64(),
            end: pte_memory.vaddr.as_u64() + pte_memory.size,
        };

        let slide = pte_memory.slide();
        let root = Self::carve_table(&mut arena)?;

        Some(Self {
            slide,
            root,
            arena: RwLock::new(arena),
            invalidate,
        })
    }

    /// The physical address of the root table, ready for CR3.
    pub fn root_addr(&self) -> PhysAddr {
        PhysAddr::new((self.root as u64).wrapping_sub(self.slide as u64))
    }

    fn carve_table(arena: &mut TableArena) -> Option<*mut PageTable> {
        if arena.cursor + PAGE_SIZE > arena.end {
            return None;
        }

        let table = arena.cursor as *mut PageTable;
        arena.cursor += PAGE_SIZE;
        unsafe {
            core::ptr::write_bytes(table as *mut u8, 0, PAGE_SIZE as usize);
        }
        Some(table)
    }

    #[inline]
    fn table_virt(&self, addr: PhysAddr) -> *mut PageTable {
        addr.as_u64().wrapping_add(self.slide as u64) as *mut PageTable
    }

    #[inline]
    fn table_phys(&self, table: *const PageTable) -> PhysAddr {
        PhysAddr::new((table as u64).wrapping_sub(self.slide as u64))
    }

    fn memory_type_bits(memory_type: MemoryType) -> EntryFlags {
        match memory_type {
            MemoryType::WriteBack => EntryFlags::empty(),
            MemoryType::WriteThrough => EntryFlags::WRITE_THROUGH,
            MemoryType::Uncached => EntryFlags::CACHE_DISABLE,
            MemoryType::WriteCombining => {
                EntryFlags::WRITE_THROUGH | EntryFlags::CACHE_DISABLE
            }
        }
    }

    fn leaf_bits(flags: PageFlags, memory_type: MemoryType) -> EntryFlags {
        let mut bits = EntryFlags::PRESENT | Self::memory_type_bits(memory_type);
        if flags.contains(PageFlags::WRITE) {
            bits |= EntryFlags::WRITABLE;
        }
        if !flags.contains(PageFlags::EXECUTE) {
            bits |= EntryFlags::NO_EXECUTE;
        }
        if flags.contains(PageFlags::USER) {
            bits |= EntryFlags::USER;
        }
        if flags.contains(PageFlags::WRITE_THROUGH) {
            bits |= EntryFlags::WRITE_THROUGH;
        }
        if flags.contains(PageFlags::CACHE_DISABLE) {
            bits |= EntryFlags::CACHE_DISABLE;
        }
        bits
    }

    /// Interior entries are maximally permissive; the leaf restricts.
    const INTERIOR: EntryFlags = EntryFlags::PRESENT
        .union(EntryFlags::WRITABLE)
        .union(EntryFlags::USER);

    /// Returns the next-level table under `entry`, creating it if absent.
    fn get_or_create(
        &self,
        arena: &mut TableArena,
        entry: &mut PageEntry,
    ) -> Result<*mut PageTable, MemError> {
        if entry.present() {
            Ok(self.table_virt(entry.addr()))
        } else {
            let table = Self::carve_table(arena).ok_or(MemError::OutOfMemory)?;
            entry.set(self.table_phys(table), Self::INTERIOR);
            Ok(table)
        }
    }

    // =========================================================================
    // Mapping
    // =========================================================================

    /// Installs one mapping covering `mapping.size` bytes.
    ///
    /// The body of the range is upgraded to 2 MiB pages when the virtual
    /// and physical addresses share alignment modulo 2 MiB and at least one
    /// full large page remains after aligning both ends inward; the
    /// residues are mapped with 4 KiB pages.
    ///
    /// Fails with `OutOfMemory` when an interior table cannot be carved,
    /// rolling back every table and leaf installed by this call.
    ///
    /// # Panics
    /// Unaligned addresses or a non-canonical virtual range are invariant
    /// violations, not runtime errors.
    pub fn map(
        &self,
        mapping: AddressMapping,
        flags: PageFlags,
        memory_type: MemoryType,
    ) -> Result<(), MemError> {
        if mapping.is_empty() {
            return Ok(());
        }

        assert!(
            mapping.size % PAGE_SIZE == 0
                && mapping.vaddr.is_page_aligned()
                && mapping.paddr.is_page_aligned(),
            "map request is not page aligned: {:?}",
            mapping
        );
        assert!(
            mapping.vaddr.is_canonical()
                && VirtAddr::new(mapping.vaddr.as_u64() + mapping.size - 1).is_canonical(),
            "map request is not canonical: {:?}",
            mapping
        );

        let mut arena = self.arena.write();
        let saved_cursor = arena.cursor;

        let result = self.map_locked(&mut arena, mapping, flags, memory_type);
        if result.is_err() {
            self.rollback(&mut arena, saved_cursor, mapping);
        }
        result
    }

    fn map_locked(
        &self,
        arena: &mut TableArena,
        mapping: AddressMapping,
        flags: PageFlags,
        memory_type: MemoryType,
    ) -> Result<(), MemError> {
        if Self::large_page_eligible(mapping) {
            let vaddr = mapping.vaddr.as_u64();
            let head_2m = round_up(vaddr, LARGE_PAGE_SIZE);
            let tail_2m = round_down(vaddr + mapping.size, LARGE_PAGE_SIZE);

            let head = AddressMapping::new(mapping.vaddr, mapping.paddr, head_2m - vaddr);
            let body = AddressMapping::new(
                VirtAddr::new(head_2m),
                mapping.paddr.add(head_2m - vaddr),
                tail_2m - head_2m,
            );
            let tail = AddressMapping::new(
                VirtAddr::new(tail_2m),
                mapping.paddr.add(tail_2m - vaddr),
                vaddr + mapping.size - tail_2m,
            );

            if !head.is_empty() {
                self.map_range_4k(arena, head, flags, memory_type)?;
            }
            self.map_range_2m(arena, body, flags, memory_type)?;
            if !tail.is_empty() {
                self.map_range_4k(arena, tail, flags, memory_type)?;
            }

            return Ok(());
        }

        self.map_range_4k(arena, mapping, flags, memory_type)
    }

    /// A range takes 2 MiB pages when both addresses are aligned equally
    /// modulo 2 MiB and the inner body, after aligning ends inward, is
    /// non-empty.
    fn large_page_eligible(mapping: AddressMapping) -> bool {
        if mapping.size < LARGE_PAGE_SIZE {
            return false;
        }

        let mask = LARGE_PAGE_SIZE - 1;
        if (mapping.paddr.as_u64() & mask) != (mapping.vaddr.as_u64() & mask) {
            return false;
        }

        let front = round_up(mapping.paddr.as_u64(), LARGE_PAGE_SIZE);
        let back = round_down(mapping.paddr.as_u64() + mapping.size, LARGE_PAGE_SIZE);
        front < back
    }

    fn map_range_4k(
        &self,
        arena: &mut TableArena,
        mapping: AddressMapping,
        flags: PageFlags,
        memory_type: MemoryType,
    ) -> Result<(), MemError> {
        let mut offset = 0;
        while offset < mapping.size {
            self.map_4k(
                arena,
                mapping.paddr.add(offset),
                mapping.vaddr.add(offset),
                flags,
                memory_type,
            )?;
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    fn map_range_2m(
        &self,
        arena: &mut TableArena,
        mapping: AddressMapping,
        flags: PageFlags,
        memory_type: MemoryType,
    ) -> Result<(), MemError> {
        let mut offset = 0;
        while offset < mapping.size {
            self.map_2m(
                arena,
                mapping.paddr.add(offset),
                mapping.vaddr.add(offset),
                flags,
                memory_type,
            )?;
            offset += LARGE_PAGE_SIZE;
        }
        Ok(())
    }

    fn map_4k(
        &self,
        arena: &mut TableArena,
        paddr: PhysAddr,
        vaddr: VirtAddr,
        flags: PageFlags,
        memory_type: MemoryType,
    ) -> Result<(), MemError> {
        let [pt_i, pd_i, pdpt_i, pml4_i] = vaddr.page_table_indices();

        unsafe {
            let pml4 = &mut *self.root;
            let pdpt = self.get_or_create(arena, &mut pml4.entries[pml4_i as usize])?;
            let pd = self.get_or_create(arena, &mut (*pdpt).entries[pdpt_i as usize])?;
            let pt = self.get_or_create(arena, &mut (*pd).entries[pd_i as usize])?;

            (*pt).entries[pt_i as usize].set(paddr, Self::leaf_bits(flags, memory_type));
        }

        Ok(())
    }

    fn map_2m(
        &self,
        arena: &mut TableArena,
        paddr: PhysAddr,
        vaddr: VirtAddr,
        flags: PageFlags,
        memory_type: MemoryType,
    ) -> Result<(), MemError> {
        let [_, pd_i, pdpt_i, pml4_i] = vaddr.page_table_indices();

        unsafe {
            let pml4 = &mut *self.root;
            let pdpt = self.get_or_create(arena, &mut pml4.entries[pml4_i as usize])?;
            let pd = self.get_or_create(arena, &mut (*pdpt).entries[pdpt_i as usize])?;

            (*pd).entries[pd_i as usize].set(
                paddr,
                Self::leaf_bits(flags, memory_type) | EntryFlags::PAGE_SIZE,
            );
        }

        Ok(())
    }

    /// Undoes the effects of a failed `map` call: clears every leaf in the
    /// attempted range, prunes interior entries that point into tables
    /// carved by the call, and returns the cursor.
    fn rollback(&self, arena: &mut TableArena, saved_cursor: u64, mapping: AddressMapping) {
        let new_tables = saved_cursor..arena.cursor;
        let carved = |addr: PhysAddr| {
            let virt = addr.as_u64().wrapping_add(self.slide as u64);
            new_tables.contains(&virt)
        };

        let mut vaddr = mapping.vaddr.as_u64();
        let end = vaddr + mapping.size;
        while vaddr < end {
            let [pt_i, pd_i, pdpt_i, pml4_i] = VirtAddr::new(vaddr).page_table_indices();
            vaddr += PAGE_SIZE;

            unsafe {
                let pml4 = &mut *self.root;
                let pml4e = &mut pml4.entries[pml4_i as usize];
                if !pml4e.present() {
                    continue;
                }
                if carved(pml4e.addr()) {
                    pml4e.clear();
                    continue;
                }

                let pdpt = self.table_virt(pml4e.addr());
                let pdpte = &mut (*pdpt).entries[pdpt_i as usize];
                if !pdpte.present() {
                    continue;
                }
                if carved(pdpte.addr()) {
                    pdpte.clear();
                    continue;
                }
                if pdpte.is_leaf() {
                    continue;
                }

                let pd = self.table_virt(pdpte.addr());
                let pdte = &mut (*pd).entries[pd_i as usize];
                if !pdte.present() {
                    continue;
                }
                if pdte.is_leaf() {
                    pdte.clear();
                    continue;
                }
                if carved(pdte.addr()) {
                    pdte.clear();
                    continue;
                }

                let pt = self.table_virt(pdte.addr());
                (*pt).entries[pt_i as usize].clear();
            }
        }

        arena.cursor = saved_cursor;
    }

    // =========================================================================
    // Unmapping
    // =========================================================================

    /// Marks each covered leaf not-present, invalidating the TLB once per
    /// 4 KiB on the local CPU. Interior tables are never reclaimed or
    /// coalesced.
    ///
    /// A large leaf partially covered by the range is cleared whole; the
    /// virtual memory manager only requests page-exact ranges it mapped.
    pub fn unmap(&self, range: VirtualRange) -> Result<(), MemError> {
        let front = round_down(range.front.as_u64(), PAGE_SIZE);
        let back = round_up(range.back.as_u64(), PAGE_SIZE);

        let _arena = self.arena.write();

        let mut vaddr = front;
        while vaddr < back {
            let addr = VirtAddr::new(vaddr);
            let [pt_i, pd_i, pdpt_i, pml4_i] = addr.page_table_indices();
            vaddr += PAGE_SIZE;

            unsafe {
                let pml4 = &mut *self.root;
                let pml4e = &mut pml4.entries[pml4_i as usize];
                if !pml4e.present() {
                    continue;
                }

                let pdpt = self.table_virt(pml4e.addr());
                let pdpte = &mut (*pdpt).entries[pdpt_i as usize];
                if !pdpte.present() {
                    continue;
                }
                if pdpte.is_leaf() {
                    pdpte.clear();
                    (self.invalidate)(addr);
                    continue;
                }

                let pd = self.table_virt(pdpte.addr());
                let pdte = &mut (*pd).entries[pd_i as usize];
                if !pdte.present() {
                    continue;
                }
                if pdte.is_leaf() {
                    pdte.clear();
                    (self.invalidate)(addr);
                    continue;
                }

                let pt = self.table_virt(pdte.addr());
                let pte = &mut (*pt).entries[pt_i as usize];
                if pte.present() {
                    pte.clear();
                }
                (self.invalidate)(addr);
            }
        }

        Ok(())
    }

    // =========================================================================
    // Translation
    // =========================================================================

    /// Collects the entries along the translation path of `vaddr`.
    pub fn walk(&self, vaddr: VirtAddr) -> PageWalk {
        let [pt_i, pd_i, pdpt_i, pml4_i] = vaddr.page_table_indices();
        let mut result = PageWalk {
            address: vaddr,
            ..Default::default()
        };

        let _arena = self.arena.read();

        unsafe {
            let pml4 = &*self.root;
            result.pml4e = pml4.entries[pml4_i as usize];
            if !result.pml4e.present() {
                return result;
            }

            let pdpt = self.table_virt(result.pml4e.addr());
            result.pdpte = (*pdpt).entries[pdpt_i as usize];
            if !result.pdpte.present() || result.pdpte.is_leaf() {
                return result;
            }

            let pd = self.table_virt(result.pdpte.addr());
            result.pdte = (*pd).entries[pd_i as usize];
            if !result.pdte.present() || result.pdte.is_leaf() {
                return result;
            }

            let pt = self.table_virt(result.pdte.addr());
            result.pte = (*pt).entries[pt_i as usize];
        }

        result
    }

    /// The physical address backing `vaddr`, or `None` when unmapped.
    pub fn backing_address(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let walk = self.walk(vaddr);
        let leaf = walk.leaf()?;
        let base = leaf.addr().as_u64();

        let addr = match walk.page_size()? {
            PageSize::Size1G => (base & !0x3FFF_FFFF) + (vaddr.as_u64() & 0x3FFF_FFFF),
            PageSize::Size2M => (base & !0x1F_FFFF) + (vaddr.as_u64() & 0x1F_FFFF),
            PageSize::Size4K => base + vaddr.page_offset(),
        };

        Some(PhysAddr::new(addr))
    }

    /// The access flags installed at `vaddr`, empty when unmapped.
    pub fn memory_flags(&self, vaddr: VirtAddr) -> PageFlags {
        self.walk(vaddr).flags()
    }

    /// The leaf granularity at `vaddr`.
    pub fn page_size(&self, vaddr: VirtAddr) -> Option<PageSize> {
        self.walk(vaddr).page_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static INVALIDATIONS: AtomicUsize = AtomicUsize::new(0);

    fn count_invalidate(_addr: VirtAddr) {
        INVALIDATIONS.fetch_add(1, Ordering::Relaxed);
    }

    /// A walker over a leaked buffer: table "physical" addresses equal the
    /// buffer's virtual addresses, so the slide is zero.
    fn walker(tables: usize) -> PageTables {
        let bytes = tables * PAGE_SIZE as usize;
        let buffer = alloc::vec![0u8; bytes + PAGE_SIZE as usize].leak();
        let base = round_up(buffer.as_mut_ptr() as u64, PAGE_SIZE);

        let pte_memory = AddressMapping::new(
            VirtAddr::new(base),
            PhysAddr::new(base),
            bytes as u64,
        );
        PageTables::new(pte_memory, count_invalidate).unwrap()
    }

    #[test]
    fn translation_after_map() {
        let pt = walker(16);
        let mapping = AddressMapping::new(
            VirtAddr::new(0xFFFF_8000_0000_0000),
            PhysAddr::new(0x10_0000),
            0x4000,
        );
        pt.map(mapping, PageFlags::READ | PageFlags::WRITE, MemoryType::WriteBack)
            .unwrap();

        // Every offset translates to paddr + (vaddr - request.vaddr).
        for offset in (0..0x4000).step_by(0x1000) {
            let vaddr = mapping.vaddr.add(offset);
            assert_eq!(
                pt.backing_address(vaddr),
                Some(PhysAddr::new(0x10_0000 + offset))
            );
        }
        // Interior offsets too.
        assert_eq!(
            pt.backing_address(mapping.vaddr.add(0x1234)),
            Some(PhysAddr::new(0x10_1234))
        );

        // Outside the mapping: nothing.
        assert_eq!(pt.backing_address(mapping.vaddr.add(0x4000)), None);
    }

    #[test]
    fn flags_round_trip() {
        let pt = walker(16);
        let vaddr = VirtAddr::new(0xFFFF_8000_0010_0000);
        let mapping = AddressMapping::new(vaddr, PhysAddr::new(0x20_0000), 0x1000);

        let flags = PageFlags::READ | PageFlags::WRITE;
        pt.map(mapping, flags, MemoryType::WriteBack).unwrap();

        assert_eq!(pt.memory_flags(vaddr), flags);
        assert_eq!(pt.page_size(vaddr), Some(PageSize::Size4K));

        // Unmapped addresses report no flags.
        assert_eq!(pt.memory_flags(VirtAddr::new(0xFFFF_9000_0000_0000)), PageFlags::empty());
    }

    #[test]
    fn large_page_upgrade() {
        let pt = walker(16);
        let mapping = AddressMapping::new(
            VirtAddr::new(0xFFFF_8000_0000_0000),
            PhysAddr::new(0x20_0000),
            0x40_0000,
        );
        pt.map(mapping, PageFlags::READ | PageFlags::WRITE, MemoryType::WriteBack)
            .unwrap();

        // Both endpoints are 2 MiB aligned, so the whole body upgrades.
        let probe = VirtAddr::new(0xFFFF_8000_0010_0000);
        assert_eq!(pt.page_size(probe), Some(PageSize::Size2M));
        assert_eq!(pt.backing_address(probe), Some(PhysAddr::new(0x30_0000)));

        // The translation function is identical to the 4 KiB case.
        for offset in (0..0x40_0000).step_by(0x8_0000) {
            assert_eq!(
                pt.backing_address(mapping.vaddr.add(offset)),
                Some(PhysAddr::new(0x20_0000 + offset))
            );
        }
    }

    #[test]
    fn large_page_residues() {
        let pt = walker(16);
        // Misaligned by one 4 KiB page on each side: head and tail map
        // small, the body still upgrades.
        let mapping = AddressMapping::new(
            VirtAddr::new(0xFFFF_8000_001F_F000),
            PhysAddr::new(0x1F_F000),
            0x40_2000,
        );
        pt.map(mapping, PageFlags::ALL, MemoryType::WriteBack).unwrap();

        assert_eq!(pt.page_size(mapping.vaddr), Some(PageSize::Size4K));
        assert_eq!(
            pt.page_size(VirtAddr::new(0xFFFF_8000_0020_0000)),
            Some(PageSize::Size2M)
        );
        assert_eq!(
            pt.backing_address(mapping.vaddr.add(0x1000)),
            Some(PhysAddr::new(0x20_0000))
        );
    }

    #[test]
    fn misaligned_slide_stays_small() {
        let pt = walker(24);
        // Virtual and physical disagree modulo 2 MiB: no upgrade allowed.
        let mapping = AddressMapping::new(
            VirtAddr::new(0xFFFF_8000_0000_0000),
            PhysAddr::new(0x20_1000),
            0x40_0000,
        );
        pt.map(mapping, PageFlags::ALL, MemoryType::WriteBack).unwrap();

        assert_eq!(pt.page_size(mapping.vaddr), Some(PageSize::Size4K));
        assert_eq!(
            pt.backing_address(mapping.vaddr.add(0x20_0000)),
            Some(PhysAddr::new(0x40_1000))
        );
    }

    #[test]
    fn unmap_clears_and_invalidates() {
        let pt = walker(16);
        let vaddr = VirtAddr::new(0xFFFF_8000_0000_0000);
        let mapping = AddressMapping::new(vaddr, PhysAddr::new(0x10_0000), 0x3000);
        pt.map(mapping, PageFlags::ALL, MemoryType::WriteBack).unwrap();

        let before = INVALIDATIONS.load(Ordering::Relaxed);
        pt.unmap(VirtualRange::of(vaddr, 0x3000)).unwrap();
        let after = INVALIDATIONS.load(Ordering::Relaxed);

        // One invalidation per 4 KiB page.
        assert_eq!(after - before, 3);
        assert_eq!(pt.backing_address(vaddr), None);
        assert_eq!(pt.backing_address(vaddr.add(0x2000)), None);
    }

    #[test]
    fn map_out_of_tables_rolls_back() {
        // Room for the root plus a single interior table: the walk needs
        // three interiors, so the map must fail and leave nothing behind.
        let pt = walker(2);
        let vaddr = VirtAddr::new(0xFFFF_8000_0000_0000);
        let mapping = AddressMapping::new(vaddr, PhysAddr::new(0x10_0000), 0x1000);

        let result = pt.map(mapping, PageFlags::ALL, MemoryType::WriteBack);
        assert_eq!(result, Err(MemError::OutOfMemory));

        // The partially built path was torn down.
        let walk = pt.walk(vaddr);
        assert!(!walk.pml4e.present());

        // And the arena was returned, so a smaller working set still fits
        // after more tables are... not available here; nothing leaked is
        // what we can assert.
        assert_eq!(pt.backing_address(vaddr), None);
    }

    #[test]
    fn walk_reports_entries() {
        let pt = walker(16);
        let vaddr = VirtAddr::new(0xFFFF_8000_0000_0000);
        pt.map(
            AddressMapping::new(vaddr, PhysAddr::new(0x5000), 0x1000),
            PageFlags::READ,
            MemoryType::WriteBack,
        )
        .unwrap();

        let walk = pt.walk(vaddr);
        assert!(walk.pml4e.present());
        assert!(walk.pdpte.present());
        assert!(walk.pdte.present());
        assert!(walk.pte.present());
        assert_eq!(walk.pte.addr(), PhysAddr::new(0x5000));
        assert_eq!(walk.page_size(), Some(PageSize::Size4K));

        // A walk of an unmapped address stops at the first hole but still
        // returns a defined record.
        let hole = pt.walk(VirtAddr::new(0xFFFF_9000_0000_0000));
        assert!(!hole.pml4e.present());
        assert_eq!(hole.page_size(), None);
    }

    #[test]
    #[should_panic(expected = "canonical")]
    fn non_canonical_map_is_fatal() {
        let pt = walker(8);
        let _ = pt.map(
            AddressMapping::new(VirtAddr::new(0x0000_8000_0000_0000), PhysAddr::new(0x1000), 0x1000),
            PageFlags::READ,
            MemoryType::WriteBack,
        );
    }
}
