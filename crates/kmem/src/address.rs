// =============================================================================
// Basalt — Physical and Virtual Address Types
// =============================================================================
//
// Confusing a physical address with a virtual address is one of the most
// common and catastrophic kernel bugs. The newtype pattern prevents it:
// PhysAddr and VirtAddr are separate types, and converting between them
// requires an explicit call that documents the relationship.
//
// HHDM (Higher Half Direct Map):
//   The bootloader maps all physical memory at a fixed virtual offset.
//   If the HHDM offset is 0xFFFF_8000_0000_0000, then physical 0x1000 is
//   reachable at virtual 0xFFFF_8000_0000_1000. The kernel records the
//   offset once at boot and every PhysAddr::to_virt() goes through it.
//
// CANONICAL ADDRESSES:
//   x86-64 uses 48 bits of virtual address; bits 48-63 must equal bit 47.
//   The gap in the middle is non-canonical: touching it faults, and the
//   page-table walker treats a non-canonical map request as a kernel bug.
//
// =============================================================================

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use krange::{Point, Range};

/// Size of a 4 KiB page.
pub const PAGE_SIZE: u64 = 0x1000;

/// Size of a 2 MiB large page (PD-level leaf).
pub const LARGE_PAGE_SIZE: u64 = 0x20_0000;

/// Size of a 1 GiB huge page (PDPT-level leaf).
pub const HUGE_PAGE_SIZE: u64 = 0x4000_0000;

/// The virtual offset where the bootloader maps all physical memory.
/// Zero until `init_hhdm` runs; conversions debug-assert on it.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// One-time initialization of the HHDM offset from boot info.
///
/// Must run during early boot before any `PhysAddr::to_virt()` call.
pub fn init_hhdm(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

/// Returns the configured HHDM offset.
#[inline]
pub fn hhdm_offset() -> u64 {
    let offset = HHDM_OFFSET.load(Ordering::Acquire);
    debug_assert!(offset != 0, "HHDM offset not initialized");
    offset
}

// =============================================================================
// PhysAddr
// =============================================================================

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Creates a new physical address.
    ///
    /// Physical addresses must fit in 52 bits (the architectural limit);
    /// bits 52-63 must be zero.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        debug_assert!(
            addr & 0xFFF0_0000_0000_0000 == 0,
            "physical address exceeds 52-bit limit"
        );
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// The HHDM virtual alias of this physical address.
    #[inline]
    pub fn to_virt(self) -> VirtAddr {
        VirtAddr::new(self.0 + hhdm_offset())
    }

    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

impl Point for PhysAddr {
    #[inline]
    fn from_addr(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    fn addr(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#014X})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014X}", self.0)
    }
}

// =============================================================================
// VirtAddr
// =============================================================================

/// A virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// True when bits 48-63 are a sign extension of bit 47.
    #[inline]
    pub const fn is_canonical(self) -> bool {
        let upper = self.0 >> 47;
        upper == 0 || upper == 0x1_FFFF
    }

    /// The byte offset inside the containing 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// The four 9-bit page-table indices, leaf level first:
    /// `[PT, PD, PDPT, PML4]`.
    #[inline]
    pub const fn page_table_indices(self) -> [u16; 4] {
        [
            ((self.0 >> 12) & 0x1FF) as u16,
            ((self.0 >> 21) & 0x1FF) as u16,
            ((self.0 >> 30) & 0x1FF) as u16,
            ((self.0 >> 39) & 0x1FF) as u16,
        ]
    }

    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

impl Point for VirtAddr {
    #[inline]
    fn from_addr(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    fn addr(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018X})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018X}", self.0)
    }
}

/// A range of physical memory.
pub type MemoryRange = Range<PhysAddr>;

/// A range of virtual memory.
pub type VirtualRange = Range<VirtAddr>;

// =============================================================================
// Mappings and attributes
// =============================================================================

/// A virtual range tied to the physical range backing it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AddressMapping {
    pub vaddr: VirtAddr,
    pub paddr: PhysAddr,
    pub size: u64,
}

impl AddressMapping {
    pub const fn new(vaddr: VirtAddr, paddr: PhysAddr, size: u64) -> Self {
        Self { vaddr, paddr, size }
    }

    /// `vaddr - paddr`: adding the slide to a physical address inside the
    /// mapping yields its virtual alias.
    #[inline]
    pub fn slide(&self) -> i64 {
        self.vaddr.as_u64() as i64 - self.paddr.as_u64() as i64
    }

    #[inline]
    pub fn physical_range(&self) -> MemoryRange {
        MemoryRange::of(self.paddr, self.size)
    }

    #[inline]
    pub fn virtual_range(&self) -> VirtualRange {
        VirtualRange::of(self.vaddr, self.size)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

bitflags! {
    /// Access attributes for a mapping, independent of the hardware entry
    /// encoding the walker installs them with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const READ          = 1 << 0;
        const WRITE         = 1 << 1;
        const EXECUTE       = 1 << 2;
        const USER          = 1 << 3;
        const WRITE_THROUGH = 1 << 4;
        const CACHE_DISABLE = 1 << 5;
    }
}

impl PageFlags {
    /// Kernel read/write/execute.
    pub const ALL: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);

    /// User read/write/execute.
    pub const USER_ALL: Self = Self::ALL.union(Self::USER);
}

/// Cacheability classes, matching the PAT layout the kernel programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    WriteBack,
    WriteThrough,
    Uncached,
    WriteCombining,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_addresses() {
        assert!(VirtAddr::new(0).is_canonical());
        assert!(VirtAddr::new(0x0000_7FFF_FFFF_FFFF).is_canonical());
        assert!(VirtAddr::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(VirtAddr::new(0xFFFF_FFFF_FFFF_FFFF).is_canonical());

        assert!(!VirtAddr::new(0x0000_8000_0000_0000).is_canonical());
        assert!(!VirtAddr::new(0x1234_0000_0000_0000).is_canonical());
    }

    #[test]
    fn table_indices() {
        let addr = VirtAddr::new(0xFFFF_8000_0010_3123);
        let [pt, pd, pdpt, pml4] = addr.page_table_indices();

        assert_eq!(pml4, 256);
        assert_eq!(pdpt, 0);
        assert_eq!(pd, 0);
        assert_eq!(pt, 0x103);
        assert_eq!(addr.page_offset(), 0x123);
    }

    #[test]
    fn mapping_slide() {
        let mapping = AddressMapping::new(
            VirtAddr::new(0xFFFF_8000_0000_1000),
            PhysAddr::new(0x1000),
            0x1000,
        );
        assert_eq!(mapping.slide(), 0xFFFF_8000_0000_0000u64 as i64);
    }
}
