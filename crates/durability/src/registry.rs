//! Registered guest-memory regions of one save

use ramsnap_core::RamBlock;

/// Ordered list of the RAM blocks taking part in a save
///
/// Registration order is the order of blocks in the saved index. Lookups by
/// guest start offset remember the last hit, since consecutive pages almost
/// always fall in the same block.
#[derive(Debug, Default)]
pub struct RamBlockRegistry {
    blocks: Vec<RamBlock>,
    last_hit: usize,
}

impl RamBlockRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block, returning its index
    ///
    /// # Panics
    ///
    /// Registering a second block with the same id or start offset, or one
    /// whose guest range overlaps a registered block, is a caller bug.
    pub fn register(&mut self, block: RamBlock) -> usize {
        for existing in &self.blocks {
            assert!(
                existing.id() != block.id(),
                "RAM block '{}' registered twice",
                block.id()
            );
            let overlaps = block.start_offset() < existing.start_offset() + existing.total_size()
                && existing.start_offset() < block.start_offset() + block.total_size();
            assert!(
                !overlaps && existing.start_offset() != block.start_offset(),
                "RAM block '{}' overlaps '{}'",
                block.id(),
                existing.id()
            );
        }
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    /// Index of the block starting at `start_offset`
    pub fn lookup(&mut self, start_offset: u64) -> Option<usize> {
        if let Some(block) = self.blocks.get(self.last_hit) {
            if block.start_offset() == start_offset {
                return Some(self.last_hit);
            }
        }
        let index = self
            .blocks
            .iter()
            .position(|b| b.start_offset() == start_offset)?;
        self.last_hit = index;
        Some(index)
    }

    /// Block at `index`
    pub fn get(&self, index: usize) -> Option<&RamBlock> {
        self.blocks.get(index)
    }

    /// Blocks in registration order
    pub fn blocks(&self) -> &[RamBlock] {
        &self.blocks
    }

    /// Number of registered blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether no block is registered
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Sum of page counts over all blocks
    pub fn total_pages(&self) -> u64 {
        self.blocks.iter().map(|b| b.page_count() as u64).sum()
    }
}
