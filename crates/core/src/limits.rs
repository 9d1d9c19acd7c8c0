//! Page and block size limits
//!
//! These bounds are enforced when a [`RamBlock`](crate::RamBlock) is built and
//! again when a block descriptor is decoded from a snapshot index, so a
//! corrupt index can never request an absurd page buffer.

/// Page size used by the guest when nothing else is specified (4KB).
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Smallest accepted page size (512 bytes).
pub const MIN_PAGE_SIZE: u32 = 512;

/// Largest accepted page size (2MB, a huge page).
pub const MAX_PAGE_SIZE: u32 = 2 * 1024 * 1024;

/// Maximum length of a block identifier in bytes.
///
/// The identifier is stored with a u16 length prefix in the index.
pub const MAX_BLOCK_ID_LEN: usize = 256;

/// Check whether `page_size` is an accepted page size.
pub fn is_valid_page_size(page_size: u32) -> bool {
    page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
}
