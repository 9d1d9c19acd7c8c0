//! Core types for ramsnap
//!
//! This crate defines the guest-memory types shared by every layer:
//! - HostMemory: read-only view of a host region backing guest RAM
//! - RamBlock / RamBlockDescriptor: a registered guest-memory region
//! - PageHash: 128-bit digest of a page's content
//! - Limits: accepted page sizes and id lengths
//! - BlockError: validation errors for block descriptions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod limits;
pub mod types;

pub use error::{BlockError, BlockResult};
pub use hash::{is_zero_page, PageHash, PAGE_HASH_SIZE};
pub use limits::{
    is_valid_page_size, DEFAULT_PAGE_SIZE, MAX_BLOCK_ID_LEN, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
pub use types::{HostMemory, RamBlock, RamBlockDescriptor};
