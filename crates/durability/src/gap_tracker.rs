//! Free-space tracking for the payload region
//!
//! Incremental saves rewrite only changed pages. Payload ranges that no
//! index references any more (pages that later changed or became zero, old
//! indexes) are holes in the file; the tracker hands them out again so the
//! file does not grow without bound.
//!
//! The tracker also owns the end-of-file cursor: a reservation that no hole
//! can satisfy extends the file. Reservation is the synchronization point,
//! so two in-flight writes can never receive overlapping ranges.

use std::collections::{BTreeMap, BTreeSet};

/// Best-fit allocator over free byte ranges of the snapshot file
#[derive(Debug, Clone, Default)]
pub struct GapTracker {
    /// offset -> length
    by_offset: BTreeMap<u64, u64>,
    /// (length, offset), for best-fit lookup
    by_size: BTreeSet<(u64, u64)>,
    /// First byte past the allocated region
    end: u64,
    free_bytes: u64,
}

impl GapTracker {
    /// Tracker with no gaps whose allocations start at `end`
    pub fn new(end: u64) -> Self {
        GapTracker {
            end,
            ..Default::default()
        }
    }

    /// Tracker over an existing file with the given holes
    ///
    /// Holes touching `end` shrink the end-of-file cursor instead of being
    /// tracked as gaps.
    pub fn with_gaps(end: u64, gaps: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut tracker = Self::new(end);
        for (offset, size) in gaps {
            tracker.release(offset, size);
        }
        tracker
    }

    /// Reserve `size` bytes and return their offset
    ///
    /// Picks the smallest gap that fits (lowest offset among equals) and
    /// returns the unused tail of that gap to the free set. Without a fitting
    /// gap the range is taken from the end of the file.
    pub fn reserve(&mut self, size: u64) -> u64 {
        if size == 0 {
            return self.end;
        }
        let fit = self.by_size.range((size, 0)..).next().copied();
        match fit {
            Some((len, offset)) => {
                self.remove_gap(offset, len);
                if len > size {
                    self.insert_gap(offset + size, len - size);
                }
                offset
            }
            None => {
                let offset = self.end;
                self.end += size;
                offset
            }
        }
    }

    /// Return `size` bytes at `offset` to the free set
    ///
    /// Adjacent gaps are merged. Releasing a range that overlaps an existing
    /// gap or lies past the end of the file is a caller bug.
    pub fn release(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        debug_assert!(offset + size <= self.end, "release past end of file");

        let mut start = offset;
        let mut len = size;

        if let Some((&prev_off, &prev_len)) = self.by_offset.range(..offset).next_back() {
            debug_assert!(prev_off + prev_len <= offset, "release overlaps a gap");
            if prev_off + prev_len == offset {
                self.remove_gap(prev_off, prev_len);
                start = prev_off;
                len += prev_len;
            }
        }
        if let Some((&next_off, &next_len)) = self.by_offset.range(offset..).next() {
            debug_assert!(offset + size <= next_off, "release overlaps a gap");
            if offset + size == next_off {
                self.remove_gap(next_off, next_len);
                len += next_len;
            }
        }

        if start + len == self.end {
            self.end = start;
        } else {
            self.insert_gap(start, len);
        }
    }

    /// First byte past the allocated region
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Total bytes held in gaps
    pub fn total_free(&self) -> u64 {
        self.free_bytes
    }

    /// Number of distinct gaps
    pub fn gap_count(&self) -> usize {
        self.by_offset.len()
    }

    /// Gaps as `(offset, length)` in offset order
    pub fn gaps(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.by_offset.iter().map(|(&o, &l)| (o, l))
    }

    fn insert_gap(&mut self, offset: u64, len: u64) {
        self.by_offset.insert(offset, len);
        self.by_size.insert((len, offset));
        self.free_bytes += len;
    }

    fn remove_gap(&mut self, offset: u64, len: u64) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(len, offset));
        self.free_bytes -= len;
    }
}
