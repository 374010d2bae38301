// =============================================================================
// Basalt — Physical Memory Manager
// =============================================================================
//
// One TLSF heap spans the usable physical address space (multiple disjoint
// pools are supported); every live allocation is wrapped in a *segment*
// carrying an owner count. Segments are the unit of retention: `retain`
// raises the count over a range, splitting segments at the intersection
// boundaries where the range covers them only partially, and `release`
// is the exact inverse: a segment whose count hits zero hands its block
// back to the heap.
//
// Segments never overlap and are indexed by their front address. Retain
// never merges segments; only release reclaims.
//
// The manager is not internally locked: the kernel wraps it in a spinlock,
// matching the single-exclusive-lock policy for PMM mutations.
// =============================================================================

use alloc::collections::BTreeMap;

use kheap::{HeapStats, TlsfAllocation, TlsfHeap};
use krange::{intersection, Point, Range};

use crate::address::{MemoryRange, PhysAddr, PAGE_SIZE};
use crate::MemError;

/// A retained span of physical memory.
#[derive(Clone, Copy, Debug)]
struct MemorySegment {
    range: MemoryRange,
    /// Number of logical references; the backing block returns to the heap
    /// when this drops to zero.
    owners: u8,
    handle: TlsfAllocation,
}

/// Counters reported by [`MemoryManager::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryManagerStats {
    pub heap: HeapStats,
    pub segments: usize,
}

/// The physical memory manager.
pub struct MemoryManager {
    heap: TlsfHeap,
    segments: BTreeMap<u64, MemorySegment>,
}

impl MemoryManager {
    /// Creates a manager over an initial pool of usable frames.
    pub fn new(range: MemoryRange) -> Result<Self, MemError> {
        let heap = TlsfHeap::new(range.front.addr(), range.back.addr())?;
        Ok(Self {
            heap,
            segments: BTreeMap::new(),
        })
    }

    /// Adds another disjoint pool of usable frames.
    pub fn add_pool(&mut self, range: MemoryRange) -> Result<(), MemError> {
        self.heap.add_pool(range.front.addr(), range.back.addr())?;
        Ok(())
    }

    /// Allocates `size` bytes of page-aligned physical memory as a fresh
    /// segment with one owner.
    pub fn allocate(&mut self, size: u64) -> Result<MemoryRange, MemError> {
        self.allocate_aligned(size, PAGE_SIZE)
    }

    pub fn allocate_aligned(&mut self, size: u64, align: u64) -> Result<MemoryRange, MemError> {
        let handle = self
            .heap
            .alloc_aligned(align, size)
            .ok_or(MemError::OutOfMemory)?;

        let (front, back) = self.heap.range_of(handle);
        let range = MemoryRange::new(PhysAddr::new(front), PhysAddr::new(back));

        self.segments.insert(
            front,
            MemorySegment {
                range,
                owners: 1,
                handle,
            },
        );

        Ok(range)
    }

    /// Raises the owner count of every segment inside `range`, splitting
    /// partially covered segments at the intersection boundaries.
    ///
    /// `InvalidInput` when the range intersects no segment.
    pub fn retain(&mut self, range: MemoryRange) -> Result<(), MemError> {
        if range.is_empty() {
            return Err(MemError::InvalidInput);
        }

        let mut matched = false;
        let mut cursor: Option<u64> = None;

        loop {
            let Some(key) = self.next_candidate(range, &mut cursor) else {
                break;
            };
            let segment = self.segments[&key];
            if segment.range.is_after(range) {
                break;
            }
            if !segment.range.intersects(range) {
                cursor = Some(key + 1);
                continue;
            }

            matched = true;

            if range.contains(segment.range) {
                self.segments.get_mut(&key).unwrap().owners += 1;
                cursor = Some(key + 1);
                continue;
            }

            let covered = intersection(range, segment.range);
            if covered.front == segment.range.front {
                // The head of the segment is covered.
                let (lo, hi) = self.heap.split(segment.handle, covered.back.addr())?;
                self.segments.remove(&key);
                self.insert(covered, segment.owners + 1, lo);
                self.insert(
                    MemoryRange::new(covered.back, segment.range.back),
                    segment.owners,
                    hi,
                );
                break;
            } else if covered.back == segment.range.back {
                // The tail is covered; the range may continue past it.
                let (lo, hi) = self.heap.split(segment.handle, covered.front.addr())?;
                self.segments.remove(&key);
                self.insert(
                    MemoryRange::new(segment.range.front, covered.front),
                    segment.owners,
                    lo,
                );
                self.insert(covered, segment.owners + 1, hi);
                cursor = Some(segment.range.back.addr());
            } else {
                // Strictly interior: three pieces, the middle one retained.
                let (lo, rest) = self.heap.split(segment.handle, covered.front.addr())?;
                let (mid, hi) = self.heap.split(rest, covered.back.addr())?;
                self.segments.remove(&key);
                self.insert(
                    MemoryRange::new(segment.range.front, covered.front),
                    segment.owners,
                    lo,
                );
                self.insert(covered, segment.owners + 1, mid);
                self.insert(
                    MemoryRange::new(covered.back, segment.range.back),
                    segment.owners,
                    hi,
                );
                break;
            }
        }

        if matched {
            Ok(())
        } else {
            Err(MemError::InvalidInput)
        }
    }

    /// The inverse of [`MemoryManager::retain`]: drops one owner from every
    /// covered segment, splitting as needed; segments reaching zero owners
    /// return their frames to the heap.
    pub fn release(&mut self, range: MemoryRange) -> Result<(), MemError> {
        if range.is_empty() {
            return Err(MemError::InvalidInput);
        }

        let mut matched = false;
        let mut cursor: Option<u64> = None;

        loop {
            let Some(key) = self.next_candidate(range, &mut cursor) else {
                break;
            };
            let segment = self.segments[&key];
            if segment.range.is_after(range) {
                break;
            }
            if !segment.range.intersects(range) {
                cursor = Some(key + 1);
                continue;
            }

            matched = true;

            if range.contains(segment.range) {
                self.segments.remove(&key);
                self.drop_owner(segment.range, segment.owners, segment.handle);
                cursor = Some(segment.range.back.addr());
                continue;
            }

            let covered = intersection(range, segment.range);
            if covered.front == segment.range.front {
                let (lo, hi) = self.heap.split(segment.handle, covered.back.addr())?;
                self.segments.remove(&key);
                self.drop_owner(covered, segment.owners, lo);
                self.insert(
                    MemoryRange::new(covered.back, segment.range.back),
                    segment.owners,
                    hi,
                );
                break;
            } else if covered.back == segment.range.back {
                let (lo, hi) = self.heap.split(segment.handle, covered.front.addr())?;
                self.segments.remove(&key);
                self.insert(
                    MemoryRange::new(segment.range.front, covered.front),
                    segment.owners,
                    lo,
                );
                self.drop_owner(covered, segment.owners, hi);
                cursor = Some(segment.range.back.addr());
            } else {
                let (lo, rest) = self.heap.split(segment.handle, covered.front.addr())?;
                let (mid, hi) = self.heap.split(rest, covered.back.addr())?;
                self.segments.remove(&key);
                self.insert(
                    MemoryRange::new(segment.range.front, covered.front),
                    segment.owners,
                    lo,
                );
                self.drop_owner(covered, segment.owners, mid);
                self.insert(
                    MemoryRange::new(covered.back, segment.range.back),
                    segment.owners,
                    hi,
                );
                break;
            }
        }

        if matched {
            Ok(())
        } else {
            Err(MemError::InvalidInput)
        }
    }

    /// Splits the segment containing `midpoint` in two, both halves keeping
    /// the owner count. Exposes the internal TLSF split so a caller can cut
    /// an allocation without freeing it.
    pub fn split(&mut self, midpoint: PhysAddr) -> Result<(), MemError> {
        let (&key, &segment) = self
            .segments
            .range(..=midpoint.addr())
            .next_back()
            .ok_or(MemError::InvalidInput)?;

        if !segment.range.contains_addr(midpoint) || midpoint == segment.range.front {
            return Err(MemError::InvalidInput);
        }

        let (lo, hi) = self.heap.split(segment.handle, midpoint.addr())?;
        self.segments.remove(&key);
        self.insert(
            MemoryRange::new(segment.range.front, midpoint),
            segment.owners,
            lo,
        );
        self.insert(
            MemoryRange::new(midpoint, segment.range.back),
            segment.owners,
            hi,
        );
        Ok(())
    }

    /// Extends a single-owner segment in place; requires the following heap
    /// block to be free and large enough.
    pub fn grow(&mut self, range: MemoryRange, size: u64) -> Result<MemoryRange, MemError> {
        let key = range.front.addr();
        let segment = *self.segments.get(&key).ok_or(MemError::InvalidInput)?;
        if segment.range != range {
            return Err(MemError::InvalidInput);
        }

        self.heap.grow(segment.handle, size)?;
        let updated = MemoryRange::of(range.front, size);
        self.segments.get_mut(&key).unwrap().range = updated;
        Ok(updated)
    }

    /// Trims a segment in place, returning the tail to the heap.
    pub fn shrink(&mut self, range: MemoryRange, size: u64) -> Result<MemoryRange, MemError> {
        let key = range.front.addr();
        let segment = *self.segments.get(&key).ok_or(MemError::InvalidInput)?;
        if segment.range != range {
            return Err(MemError::InvalidInput);
        }

        self.heap.shrink(segment.handle, size)?;
        let updated = MemoryRange::of(range.front, size);
        self.segments.get_mut(&key).unwrap().range = updated;
        Ok(updated)
    }

    /// The owner count of the segment starting exactly at `front`.
    pub fn owners_of(&self, front: PhysAddr) -> Option<u8> {
        self.segments.get(&front.addr()).map(|s| s.owners)
    }

    /// Bytes currently free in the heap.
    pub fn free_space(&self) -> u64 {
        self.heap.stats().free_size
    }

    pub fn stats(&self) -> MemoryManagerStats {
        MemoryManagerStats {
            heap: self.heap.stats(),
            segments: self.segments.len(),
        }
    }

    fn insert(&mut self, range: MemoryRange, owners: u8, handle: TlsfAllocation) {
        debug_assert!(!range.is_empty());
        self.segments.insert(
            range.front.addr(),
            MemorySegment {
                range,
                owners,
                handle,
            },
        );
    }

    /// Re-inserts a covered piece with one owner less, or frees it when the
    /// last owner is gone.
    fn drop_owner(&mut self, range: MemoryRange, owners: u8, handle: TlsfAllocation) {
        if owners <= 1 {
            self.heap.free(handle);
        } else {
            self.insert(range, owners - 1, handle);
        }
    }

    /// The next segment front to examine. The first probe also considers
    /// the predecessor segment straddling `range.front`.
    fn next_candidate(&self, range: MemoryRange, cursor: &mut Option<u64>) -> Option<u64> {
        let key = match *cursor {
            None => self
                .segments
                .range(..=range.front.addr())
                .next_back()
                .filter(|(_, seg)| seg.range.intersects(range))
                .map(|(&k, _)| k)
                .or_else(|| {
                    self.segments
                        .range(range.front.addr() + 1..)
                        .next()
                        .map(|(&k, _)| k)
                }),
            Some(cursor) => self.segments.range(cursor..).next().map(|(&k, _)| k),
        };

        *cursor = key.map(|k| k + 1);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MemoryManager {
        // One usable pool [1 MiB, 2 MiB).
        MemoryManager::new(MemoryRange::new(
            PhysAddr::new(0x10_0000),
            PhysAddr::new(0x20_0000),
        ))
        .unwrap()
    }

    #[test]
    fn allocate_retain_release() {
        let mut pmm = manager();

        let a = pmm.allocate(0x3000).unwrap();
        assert_eq!(a.size(), 0x3000);
        assert_eq!(pmm.owners_of(a.front), Some(1));

        pmm.retain(a).unwrap();
        assert_eq!(pmm.owners_of(a.front), Some(2));

        pmm.release(a).unwrap();
        assert_eq!(pmm.owners_of(a.front), Some(1));

        pmm.release(a).unwrap();
        // The segment is gone and the block is back in the free list.
        assert_eq!(pmm.owners_of(a.front), None);
        assert_eq!(pmm.stats().segments, 0);
        assert_eq!(pmm.free_space(), 0x10_0000);
    }

    #[test]
    fn release_unknown_range_is_invalid() {
        let mut pmm = manager();

        let range = MemoryRange::new(PhysAddr::new(0x18_0000), PhysAddr::new(0x19_0000));
        assert_eq!(pmm.release(range), Err(MemError::InvalidInput));
        assert_eq!(pmm.retain(range), Err(MemError::InvalidInput));
    }

    #[test]
    fn partial_retain_splits_segment() {
        let mut pmm = manager();

        let a = pmm.allocate(0x4000).unwrap();
        // Retain only the middle two pages.
        let middle = MemoryRange::new(a.front.add(0x1000), a.front.add(0x3000));
        pmm.retain(middle).unwrap();

        assert_eq!(pmm.stats().segments, 3);
        assert_eq!(pmm.owners_of(a.front), Some(1));
        assert_eq!(pmm.owners_of(middle.front), Some(2));
        assert_eq!(pmm.owners_of(middle.back), Some(1));

        // Releasing the matched pair restores the original accounting.
        pmm.release(middle).unwrap();
        assert_eq!(pmm.owners_of(middle.front), Some(1));

        pmm.release(a).unwrap();
        assert_eq!(pmm.stats().segments, 0);
        assert_eq!(pmm.free_space(), 0x10_0000);
    }

    #[test]
    fn release_spanning_multiple_segments() {
        let mut pmm = manager();

        let a = pmm.allocate(0x2000).unwrap();
        let b = pmm.allocate(0x2000).unwrap();
        assert_eq!(a.back, b.front);

        // One release covering both segments drops each once.
        let both = MemoryRange::new(a.front, b.back);
        pmm.release(both).unwrap();

        assert_eq!(pmm.stats().segments, 0);
        assert_eq!(pmm.free_space(), 0x10_0000);
    }

    #[test]
    fn retain_head_of_segment() {
        let mut pmm = manager();

        let a = pmm.allocate(0x4000).unwrap();
        let head = a.first(0x1000);
        pmm.retain(head).unwrap();

        assert_eq!(pmm.owners_of(a.front), Some(2));
        assert_eq!(pmm.owners_of(head.back), Some(1));

        // Fully release everything: head twice, tail once.
        pmm.release(a).unwrap();
        pmm.release(head).unwrap();
        assert_eq!(pmm.stats().segments, 0);
    }

    #[test]
    fn split_keeps_owner_counts() {
        let mut pmm = manager();

        let a = pmm.allocate(0x4000).unwrap();
        pmm.retain(a).unwrap();
        pmm.split(a.front.add(0x2000)).unwrap();

        assert_eq!(pmm.stats().segments, 2);
        assert_eq!(pmm.owners_of(a.front), Some(2));
        assert_eq!(pmm.owners_of(a.front.add(0x2000)), Some(2));

        pmm.release(a).unwrap();
        pmm.release(a).unwrap();
        assert_eq!(pmm.stats().segments, 0);
    }

    #[test]
    fn grow_and_shrink_track_segments() {
        let mut pmm = manager();

        let a = pmm.allocate(0x2000).unwrap();
        let grown = pmm.grow(a, 0x4000).unwrap();
        assert_eq!(grown.size(), 0x4000);
        assert_eq!(pmm.owners_of(a.front), Some(1));

        let shrunk = pmm.shrink(grown, 0x1000).unwrap();
        assert_eq!(shrunk.size(), 0x1000);

        pmm.release(shrunk).unwrap();
        assert_eq!(pmm.free_space(), 0x10_0000);
    }

    #[test]
    fn conservation_with_pools() {
        let mut pmm = manager();
        pmm.add_pool(MemoryRange::new(
            PhysAddr::new(0x40_0000),
            PhysAddr::new(0x50_0000),
        ))
        .unwrap();

        let total = 0x20_0000;
        let a = pmm.allocate(0x10_0000).unwrap();
        let b = pmm.allocate(0x8_0000).unwrap();

        assert_eq!(pmm.free_space() + a.size() + b.size(), total);

        pmm.release(a).unwrap();
        pmm.release(b).unwrap();
        assert_eq!(pmm.free_space(), total);
    }
}
