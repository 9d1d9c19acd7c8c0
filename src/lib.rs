//! ramsnap - incremental guest-RAM snapshots for virtual machines
//!
//! Persists the memory of a paused VM to a single file and restores it
//! byte for byte. Repeated saves of the same file are incremental: pages
//! whose content hash matches the previous snapshot are not rewritten.
//!
//! # Quick Start
//!
//! ```ignore
//! use ramsnap::{RamBlock, RamLoader, RamSaver, SaveFlags};
//! use std::sync::Arc;
//!
//! let block = RamBlock::new("pc.ram", 0, 4096, Arc::new(guest_memory))?;
//!
//! // First save: full
//! let mut saver = RamSaver::new("vm.snap", SaveFlags::ASYNC, None, false)?;
//! saver.register_block(block.clone());
//! saver.save_all_pages();
//! saver.complete();
//! saver.join();
//! assert!(!saver.has_error());
//!
//! // Next save: incremental against the previous one
//! let prior = Arc::new(RamLoader::open("vm.snap")?);
//! let mut saver = RamSaver::new("vm.snap", SaveFlags::ASYNC, Some(prior), false)?;
//! ```
//!
//! # Architecture
//!
//! - `ramsnap-core`: guest memory types (`RamBlock`, `PageHash`)
//! - `ramsnap-durability`: file format, saver, loader

pub use ramsnap_core::{
    is_zero_page, BlockError, BlockResult, HostMemory, PageHash, RamBlock, RamBlockDescriptor,
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
pub use ramsnap_durability::{
    FastReleasePool, GapTracker, IncrementalStats, LoadError, LoadResult, RamBlockRegistry,
    RamLoader, RamSaver, SaveFlags, SaveStats, SaverConfig, SaverConfigError, SnapshotError,
    SnapshotResult,
};

/// File format, codecs and test helpers
pub use ramsnap_durability::{codec, format, testing};
