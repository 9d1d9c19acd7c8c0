//! Guest RAM fixtures

use ramsnap_core::RamBlock;
use std::sync::Arc;

/// A page of `page_size` bytes filled with a pattern derived from `seed`
///
/// Never all zero, and different seeds give different pages.
pub fn patterned_page(seed: u64, page_size: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..page_size)
        .map(|_| {
            // xorshift64
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// Builds the memory of one RAM block page by page
#[derive(Debug, Clone)]
pub struct GuestRamBuilder {
    page_size: usize,
    memory: Vec<u8>,
}

impl GuestRamBuilder {
    /// Empty region with the given page size
    pub fn new(page_size: usize) -> Self {
        GuestRamBuilder {
            page_size,
            memory: Vec::new(),
        }
    }

    /// Append an all-zero page
    pub fn zero_page(self) -> Self {
        let page = vec![0u8; self.page_size];
        self.page(&page)
    }

    /// Append a page from [`patterned_page`]
    pub fn patterned_page(self, seed: u64) -> Self {
        let page = patterned_page(seed, self.page_size);
        self.page(&page)
    }

    /// Append a page with the given content
    ///
    /// # Panics
    ///
    /// If `bytes` is not exactly one page long.
    pub fn page(mut self, bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), self.page_size, "fixture page has the wrong size");
        self.memory.extend_from_slice(bytes);
        self
    }

    /// The memory built so far
    pub fn build(self) -> Vec<u8> {
        self.memory
    }

    /// A RAM block over the built memory
    ///
    /// # Panics
    ///
    /// If the id or page size is not a valid block description.
    pub fn build_block(self, id: &str, start_offset: u64) -> RamBlock {
        let page_size = self.page_size as u32;
        RamBlock::new(id, start_offset, page_size, Arc::new(self.memory))
            .expect("fixture block must be valid")
    }
}
