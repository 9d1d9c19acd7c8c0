//! Page content digests
//!
//! Change detection between snapshots compares a 128-bit digest of the raw,
//! uncompressed page bytes, so the result does not depend on whether either
//! snapshot stored its pages compressed.

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::xxh3_128;

/// Size of a page digest in bytes
pub const PAGE_HASH_SIZE: usize = 16;

/// 128-bit digest of a page's uncompressed content
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PageHash(pub [u8; PAGE_HASH_SIZE]);

impl PageHash {
    /// Hash the given page bytes
    pub fn of(bytes: &[u8]) -> Self {
        PageHash(xxh3_128(bytes).to_le_bytes())
    }

    /// Digest of an all-zero page of `page_size` bytes
    pub fn of_zero_page(page_size: usize) -> Self {
        Self::of(&vec![0u8; page_size])
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; PAGE_HASH_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageHash(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Check whether every byte of `bytes` is zero.
///
/// Scans eight bytes at a time; the compiler vectorizes the inner loop.
pub fn is_zero_page(bytes: &[u8]) -> bool {
    let mut chunks = bytes.chunks_exact(8);
    let words_zero = chunks
        .by_ref()
        .all(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) == 0);
    words_zero && chunks.remainder().iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let page = vec![7u8; 4096];
        assert_eq!(PageHash::of(&page), PageHash::of(&page));
    }

    #[test]
    fn test_single_byte_change_changes_hash() {
        let a = vec![1u8; 4096];
        let mut b = a.clone();
        b[4095] = 2;
        assert_ne!(PageHash::of(&a), PageHash::of(&b));
    }

    #[test]
    fn test_zero_page_hash_matches_explicit_zero_page() {
        assert_eq!(PageHash::of_zero_page(4096), PageHash::of(&[0u8; 4096]));
        assert_ne!(PageHash::of_zero_page(4096), PageHash::of_zero_page(8192));
    }

    #[test]
    fn test_is_zero_page() {
        assert!(is_zero_page(&[0u8; 4096]));
        assert!(is_zero_page(&[]));

        let mut page = vec![0u8; 4096];
        page[2049] = 1;
        assert!(!is_zero_page(&page));
    }

    #[test]
    fn test_is_zero_page_checks_remainder() {
        // Length not a multiple of eight: the tail is scanned bytewise
        let mut page = vec![0u8; 13];
        assert!(is_zero_page(&page));
        page[12] = 0xff;
        assert!(!is_zero_page(&page));
    }

    #[test]
    fn test_debug_is_hex() {
        let hash = PageHash([0xab; PAGE_HASH_SIZE]);
        let s = format!("{:?}", hash);
        assert!(s.starts_with("PageHash(abab"));
    }
}
