//! Intra-section free-list allocator.
//!
//! Unlike [`crate::heap::NativeHeap`], a section's backing store is an
//! ordinary growable byte buffer rather than an OS reservation, so
//! there is no island/page bookkeeping here — just a free/occupied
//! partition of `[0, span)` plus a span that grows on demand, mirroring
//! the relationship `goblin::pe::writer::PEWriter` keeps between a
//! section's declared size and the bytes actually written into it.

use std::collections::BTreeMap;

use crate::error::{corrupt, Error, Result};
use crate::utils::align_up_usize;

/// Sub-byte-range allocator for one section's virtual-address space.
/// Offsets start at zero and the span grows as ranges are claimed;
/// released ranges re-enter the free list for reuse by later
/// allocations.
#[derive(Default)]
pub struct SectionAllocator {
    span: usize,
    free: BTreeMap<usize, usize>,
    occupied: BTreeMap<usize, usize>,
    closed: bool,
}

impl SectionAllocator {
    pub fn new() -> Self {
        SectionAllocator::default()
    }

    /// Current high-water mark of the section's virtual-address space.
    pub fn span(&self) -> usize {
        self.span
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closes the allocator to further `allocate`/`place_at` calls.
    /// One-way, called once when the host section finalizes.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Assigns `[offset, offset+size)` for a new allocation, where
    /// `offset` is the smallest value satisfying `alignment` drawn
    /// first from the free list (first-fit) and otherwise appended at
    /// the current span.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<usize> {
        if self.closed {
            return Err(Error::Unallocated("section is finalized".into()));
        }
        let align = align.max(1);

        let mut from_free = None;
        for (&start, &fsize) in &self.free {
            let aligned = align_up_usize(start, align);
            if aligned + size <= start + fsize {
                from_free = Some((start, fsize, aligned));
                break;
            }
        }

        let offset = match from_free {
            Some((fstart, fsize, aligned)) => {
                self.free.remove(&fstart);
                if aligned > fstart {
                    self.free.insert(fstart, aligned - fstart);
                }
                let end = aligned + size;
                if end < fstart + fsize {
                    self.free.insert(end, fstart + fsize - end);
                }
                aligned
            }
            None => {
                let aligned = align_up_usize(self.span, align);
                if aligned > self.span {
                    self.free.insert(self.span, aligned - self.span);
                }
                self.span = aligned + size;
                aligned
            }
        };
        self.occupied.insert(offset, size);
        Ok(offset)
    }

    /// Marks `[offset, offset+size)` as occupied without choosing the
    /// offset, for reconstructing allocations already placed in a
    /// loaded image. Fails if the range overlaps a live allocation.
    pub fn place_at(&mut self, offset: usize, size: usize) -> Result<()> {
        if self.closed {
            return Err(Error::Unallocated("section is finalized".into()));
        }
        let end = offset + size;
        for (&o, &s) in &self.occupied {
            if offset < o + s && o < end {
                return Err(Error::Overlap { offset, len: size });
            }
        }
        self.claim(offset, size);
        self.occupied.insert(offset, size);
        Ok(())
    }

    /// Releases a previously allocated range, returning it to the free
    /// list merged with any adjacent free neighbors. Releasing a range
    /// that is not currently live is a fatal invariant violation.
    pub fn release(&mut self, offset: usize) {
        let Some(size) = self.occupied.remove(&offset) else {
            corrupt!("release of non-live section allocation at offset {offset}");
        };
        let end = offset + size;

        let before = self
            .free
            .range(..offset)
            .next_back()
            .filter(|&(&s, &sz)| s + sz == offset)
            .map(|(&s, &sz)| (s, sz));
        let after = self.free.get(&end).map(|&sz| (end, sz));

        let merged_start = before.map(|(s, _)| s).unwrap_or(offset);
        let merged_end = after.map(|(s, sz)| s + sz).unwrap_or(end);

        if let Some((s, _)) = before {
            self.free.remove(&s);
        }
        if let Some((s, _)) = after {
            self.free.remove(&s);
        }
        self.free.insert(merged_start, merged_end - merged_start);
    }

    pub fn is_live(&self, offset: usize) -> bool {
        self.occupied.contains_key(&offset)
    }

    /// Carves `[offset, offset+size)` out of the free/unclaimed space,
    /// extending `span` if the range reaches or crosses it. Does not
    /// touch `occupied`; callers update that separately.
    fn claim(&mut self, offset: usize, size: usize) {
        let end = offset + size;
        if offset >= self.span {
            if offset > self.span {
                self.free.insert(self.span, offset - self.span);
            }
            self.span = end;
            return;
        }
        if end <= self.span {
            let found = self
                .free
                .range(..=offset)
                .next_back()
                .filter(|&(&s, &sz)| s <= offset && offset < s + sz)
                .map(|(&s, &sz)| (s, sz));
            let Some((fstart, fsize)) = found else {
                corrupt!("placed range [{offset}, {end}) is not free");
            };
            self.free.remove(&fstart);
            if offset > fstart {
                self.free.insert(fstart, offset - fstart);
            }
            if end < fstart + fsize {
                self.free.insert(end, fstart + fsize - end);
            }
        } else {
            let trailing = self
                .free
                .range(..self.span)
                .next_back()
                .filter(|&(&s, &sz)| s + sz == self.span && s <= offset)
                .map(|(&s, _)| s);
            if let Some(fstart) = trailing {
                self.free.remove(&fstart);
                if offset > fstart {
                    self.free.insert(fstart, offset - fstart);
                }
            }
            self.span = end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_grows_span_and_reuses_freed_range() {
        let mut a = SectionAllocator::new();
        let o1 = a.allocate(16, 4).unwrap();
        assert_eq!(o1, 0);
        let o2 = a.allocate(16, 4).unwrap();
        assert_eq!(o2, 16);
        assert_eq!(a.span(), 32);

        a.release(o1);
        let o3 = a.allocate(8, 4).unwrap();
        assert_eq!(o3, 0, "reused the freed range instead of growing span");
        assert_eq!(a.span(), 32);
    }

    #[test]
    fn place_at_rejects_overlap() {
        let mut a = SectionAllocator::new();
        a.place_at(0, 8).unwrap();
        assert!(matches!(a.place_at(4, 8), Err(Error::Overlap { .. })));
        a.place_at(8, 8).unwrap();
        assert_eq!(a.span(), 16);
    }

    #[test]
    fn place_at_leaves_gap_as_free() {
        let mut a = SectionAllocator::new();
        a.place_at(16, 8).unwrap();
        assert_eq!(a.span(), 24);
        let o = a.allocate(8, 1).unwrap();
        assert_eq!(o, 0, "gap before the placed range should be reusable");
    }

    #[test]
    fn closed_allocator_rejects_allocation() {
        let mut a = SectionAllocator::new();
        a.close();
        assert!(a.allocate(4, 1).is_err());
        assert!(a.place_at(0, 4).is_err());
    }
}
