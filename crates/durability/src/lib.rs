//! Durability layer for ramsnap
//!
//! This crate handles everything that touches disk:
//!
//! - Snapshot file format: offset slot, page payloads, checksummed index
//! - Saving: `RamSaver` with same/zero/changed page classification and a
//!   hashing pool feeding a single writer
//! - Loading: `RamLoader` for incremental diffing and memory restore
//! - Page codec abstraction (identity, zstd)
//! - Free-space reuse (`GapTracker`) and compression buffer pooling
//! - Crash testing helpers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec; // Page codecs (identity, zstd)
pub mod config; // SaverConfig
pub mod error; // LoadError, SnapshotError
pub mod flags; // SaveFlags
pub mod format; // Binary on-disk format (offset slot, FileIndex)
pub mod gap_tracker; // Free ranges of the payload region
pub mod loader; // RamLoader
pub mod pipeline; // Work queues, worker pool, writer stage
pub mod pool; // FastReleasePool
pub mod registry; // RamBlockRegistry
pub mod saver; // RamSaver
pub mod stats; // IncrementalStats
pub mod testing; // Crash harness and guest RAM fixtures

// === Re-exports ===
pub use codec::{codec_for_flags, CodecError, IdentityCodec, PageCodec, ZstdCodec};
pub use config::{SaverConfig, SaverConfigError};
pub use error::{LoadError, LoadResult, SnapshotError, SnapshotResult};
pub use flags::SaveFlags;
pub use format::{
    FileIndex, IndexBlock, IndexError, IndexFlags, PageEntry, PageLocation, FILE_HEADER_SIZE,
};
pub use gap_tracker::GapTracker;
pub use loader::RamLoader;
pub use pool::{FastReleasePool, PooledBuffer};
pub use registry::RamBlockRegistry;
pub use saver::RamSaver;
pub use stats::{IncrementalStats, PageKind, SaveStats};
