//! Error types for guest-memory descriptions
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Result type alias for block construction
pub type BlockResult<T> = std::result::Result<T, BlockError>;

/// Errors raised when a RAM block description is invalid
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Block identifier is empty
    #[error("Block id must not be empty")]
    EmptyId,

    /// Block identifier exceeds the encodable length
    #[error("Block id is {len} bytes, maximum is {max}")]
    IdTooLong {
        /// Actual id length in bytes
        len: usize,
        /// Maximum accepted length
        max: usize,
    },

    /// Page size is not a supported power of two
    #[error("Invalid page size {0}")]
    InvalidPageSize(u32),

    /// Region size is not a whole number of pages
    #[error("Block size {total_size} is not a multiple of page size {page_size}")]
    PartialPage {
        /// Region size in bytes
        total_size: u64,
        /// Page size in bytes
        page_size: u32,
    },

    /// Region has more pages than the index can address
    #[error("Block has {pages} pages, more than the index can address")]
    TooManyPages {
        /// Number of pages the block would have
        pages: u64,
    },
}
