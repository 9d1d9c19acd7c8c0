//! Save and load error types

use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::config::SaverConfigError;
use crate::format::IndexError;

/// Errors that can occur while opening or reading a saved snapshot
#[derive(Debug, Error)]
pub enum LoadError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The offset slot is zero: no save ever published an index
    #[error("Snapshot has no published index")]
    NoIndex,

    /// The offset slot points outside the file
    #[error("Index offset {offset} outside file of {file_len} bytes")]
    IndexOutOfRange {
        /// Offset found at the start of the file
        offset: u64,
        /// File length
        file_len: u64,
    },

    /// The index failed to decode or validate
    #[error("Invalid index: {0}")]
    Index(#[from] IndexError),

    /// A stored page failed to decompress
    #[error("Page decode failed: {0}")]
    Codec(#[from] CodecError),

    /// No block at this index position
    #[error("Block index {0} out of range")]
    BlockOutOfRange(usize),

    /// No page at this position within its block
    #[error("Page {page_index} out of range for block {block_index}")]
    PageOutOfRange {
        /// Block position in the index
        block_index: usize,
        /// Requested page
        page_index: u32,
    },

    /// No block with this id
    #[error("Unknown block: {0}")]
    UnknownBlock(String),

    /// Destination or decoded data has the wrong length
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Bytes required
        expected: u64,
        /// Bytes supplied or produced
        actual: u64,
    },
}

/// Result type for load operations
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Errors that can occur while saving a snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid saver configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] SaverConfigError),

    /// A page failed to compress
    #[error("Compression failed: {0}")]
    Codec(#[from] CodecError),

    /// A page was handed to a pipeline stage that has shut down
    #[error("Save pipeline already closed")]
    PipelineClosed,

    /// A pipeline thread panicked
    #[error("Pipeline thread '{thread}' panicked: {message}")]
    ThreadPanicked {
        /// Thread name
        thread: String,
        /// Panic payload, if it was a string
        message: String,
    },
}

/// Result type for save operations
pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;
