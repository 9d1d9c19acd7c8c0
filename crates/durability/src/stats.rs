//! Save statistics
//!
//! Counters are updated concurrently by the hashing workers and the writer,
//! so they are atomics. [`IncrementalStats::snapshot`] copies them into a
//! plain, serializable [`SaveStats`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of the counters of one save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveStats {
    /// Pages classified
    pub total_pages: u64,
    /// Pages whose content matched the prior snapshot
    pub same_pages: u64,
    /// Pages written with new content
    pub changed_pages: u64,
    /// Pages found to be all zeroes (and not matching the prior snapshot)
    pub zero_pages: u64,
    /// Payload bytes written to the file
    pub bytes_written: u64,
    /// Writes placed in a gap instead of at the end of the file
    pub gap_reuses: u64,
    /// Compressions that could not lease a pool buffer
    pub pool_overflows: u64,
    /// Nanoseconds spent hashing
    pub hash_nanos: u64,
    /// Nanoseconds spent compressing
    pub compress_nanos: u64,
    /// Nanoseconds spent writing payloads
    pub write_nanos: u64,
}

impl SaveStats {
    /// Fraction of classified pages that were unchanged
    pub fn same_ratio(&self) -> f64 {
        if self.total_pages == 0 {
            0.0
        } else {
            self.same_pages as f64 / self.total_pages as f64
        }
    }
}

/// Live counters of one save.
#[derive(Debug, Default)]
pub struct IncrementalStats {
    total_pages: AtomicU64,
    same_pages: AtomicU64,
    changed_pages: AtomicU64,
    zero_pages: AtomicU64,
    bytes_written: AtomicU64,
    gap_reuses: AtomicU64,
    pool_overflows: AtomicU64,
    hash_nanos: AtomicU64,
    compress_nanos: AtomicU64,
    write_nanos: AtomicU64,
}

/// How a page was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Unchanged from the prior snapshot
    Same,
    /// All zeroes
    Zero,
    /// New content to write
    Changed,
}

impl IncrementalStats {
    /// Fresh counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one classified page
    pub fn count_page(&self, kind: PageKind) {
        self.total_pages.fetch_add(1, Ordering::Relaxed);
        let counter = match kind {
            PageKind::Same => &self.same_pages,
            PageKind::Zero => &self.zero_pages,
            PageKind::Changed => &self.changed_pages,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a payload write
    pub fn count_write(&self, bytes: u64, reused_gap: bool, elapsed: Duration) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        if reused_gap {
            self.gap_reuses.fetch_add(1, Ordering::Relaxed);
        }
        self.write_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Count a compression without a pool buffer
    pub fn count_pool_overflow(&self) {
        self.pool_overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Add time spent hashing
    pub fn add_hash_time(&self, elapsed: Duration) {
        self.hash_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Add time spent compressing
    pub fn add_compress_time(&self, elapsed: Duration) {
        self.compress_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Copy the counters
    pub fn snapshot(&self) -> SaveStats {
        SaveStats {
            total_pages: self.total_pages.load(Ordering::Relaxed),
            same_pages: self.same_pages.load(Ordering::Relaxed),
            changed_pages: self.changed_pages.load(Ordering::Relaxed),
            zero_pages: self.zero_pages.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            gap_reuses: self.gap_reuses.load(Ordering::Relaxed),
            pool_overflows: self.pool_overflows.load(Ordering::Relaxed),
            hash_nanos: self.hash_nanos.load(Ordering::Relaxed),
            compress_nanos: self.compress_nanos.load(Ordering::Relaxed),
            write_nanos: self.write_nanos.load(Ordering::Relaxed),
        }
    }
}
