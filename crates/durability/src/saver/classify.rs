//! Per-page classification: same, zero or changed
//!
//! Runs on the hashing workers (or the caller thread in sync mode). Turns a
//! [`QueuedPageInfo`] into a [`WriteInfo`] carrying the finished index entry
//! and, for changed pages, the bytes the writer has to store.

use ramsnap_core::{is_zero_page, PageHash, RamBlock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::codec::{PageCodec, ZstdCodec};
use crate::error::SnapshotError;
use crate::format::PageEntry;
use crate::loader::RamLoader;
use crate::pool::{FastReleasePool, PooledBuffer};
use crate::stats::{IncrementalStats, PageKind};

/// A page waiting to be classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedPageInfo {
    /// Block position in registration order
    pub block_index: usize,
    /// Page within the block
    pub page_index: u32,
}

/// Bytes the writer stores for a changed page
#[derive(Debug)]
pub enum PagePayload {
    /// Raw page, read straight from guest memory by the writer
    Guest,
    /// Compressed page in a pool buffer, returned to the pool after the write
    Pooled(PooledBuffer),
    /// Compressed page in a one-off allocation
    Owned(Vec<u8>),
}

/// A classified page on its way to the writer
#[derive(Debug)]
pub struct WriteInfo {
    /// Block position in registration order
    pub block_index: usize,
    /// Page within the block
    pub page_index: u32,
    /// Finished entry; the writer fills in position and size for a payload
    pub entry: PageEntry,
    /// Bytes to store, `None` for same and zero pages
    pub payload: Option<PagePayload>,
}

/// Prior snapshot data used for change detection
pub struct PriorSnapshot {
    loader: Arc<RamLoader>,
    /// For every registered block, the matching block position in the prior index
    blocks: Vec<Option<usize>>,
}

impl PriorSnapshot {
    /// Match each registered block with a block of the loader's index
    ///
    /// The block at the same position is preferred; otherwise the block is
    /// looked up by id. A prior block only matches if id, page size and
    /// total size agree.
    pub fn new(loader: Arc<RamLoader>, blocks: &[RamBlock]) -> Self {
        let index = loader.index();
        let matches = |pos: usize, block: &RamBlock| {
            index.blocks.get(pos).map_or(false, |prior| {
                prior.descriptor.id == block.id()
                    && prior.descriptor.page_size == block.page_size()
                    && prior.descriptor.total_size == block.total_size()
            })
        };
        let mapping = blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                if matches(i, block) {
                    return Some(i);
                }
                let found = loader.find_block(block.id()).filter(|&pos| matches(pos, block));
                if found.is_none() {
                    tracing::debug!(
                        target: "ramsnap::saver",
                        block = block.id(),
                        "No matching block in prior snapshot; saving all pages"
                    );
                }
                found
            })
            .collect();
        PriorSnapshot {
            loader,
            blocks: mapping,
        }
    }

    /// Prior entry of a page, as `(hash, position)`
    fn lookup(&self, block_index: usize, page_index: u32) -> Option<(PageHash, PageEntry)> {
        let prior_block = (*self.blocks.get(block_index)?)?;
        let hash = self.loader.hash_for_page(prior_block, page_index)?;
        let location = self.loader.file_pos_for_page(prior_block, page_index)?;
        let entry = PageEntry {
            size_on_disk: location.size,
            file_pos: location.offset,
            ..PageEntry::default()
        };
        Some((hash, entry))
    }

    /// Number of registered blocks with a prior match
    pub fn matched_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }
}

/// Compression resources of a compressed save
pub struct Compression {
    codec: ZstdCodec,
    pool: FastReleasePool,
}

impl Compression {
    /// Codec plus a pool of `buffers` destination buffers for pages of up to `max_page_size`
    pub fn new(codec: ZstdCodec, buffers: usize, max_page_size: usize) -> Self {
        let pool = FastReleasePool::new(buffers, codec.max_compressed_size(max_page_size));
        Compression { codec, pool }
    }

    /// The buffer pool
    pub fn pool(&self) -> &FastReleasePool {
        &self.pool
    }
}

/// Decides what happens to each page
///
/// Shared by all hashing workers; holds no mutable state besides the
/// atomic statistics.
pub struct PageClassifier {
    blocks: Arc<[RamBlock]>,
    prior: Option<PriorSnapshot>,
    compression: Option<Compression>,
    zero_hashes: HashMap<u32, PageHash>,
    stats: Arc<IncrementalStats>,
}

impl PageClassifier {
    /// Classifier over the registered blocks
    pub fn new(
        blocks: Arc<[RamBlock]>,
        prior: Option<PriorSnapshot>,
        compression: Option<Compression>,
        stats: Arc<IncrementalStats>,
    ) -> Self {
        let mut zero_hashes = HashMap::new();
        for block in blocks.iter() {
            zero_hashes
                .entry(block.page_size())
                .or_insert_with(|| PageHash::of_zero_page(block.page_size() as usize));
        }
        PageClassifier {
            blocks,
            prior,
            compression,
            zero_hashes,
            stats,
        }
    }

    /// Classify one page
    ///
    /// Every page is hashed, so the saved index can serve as the prior of
    /// the next incremental save. A page whose hash matches its prior entry
    /// is `same` and reuses the prior payload (this includes zero pages that
    /// were already zero). Otherwise a zero page is stored as size 0 and any
    /// other page becomes a payload, compressed if the save compresses.
    pub fn classify(&self, item: QueuedPageInfo) -> Result<WriteInfo, SnapshotError> {
        let block = &self.blocks[item.block_index];
        let bytes = block
            .page(item.page_index)
            .expect("page index validated by save_page");

        let started = Instant::now();
        let zero = is_zero_page(bytes);
        let hash = match self.zero_hashes.get(&block.page_size()) {
            Some(zero_hash) if zero => *zero_hash,
            _ => PageHash::of(bytes),
        };
        self.stats.add_hash_time(started.elapsed());

        let mut entry = PageEntry {
            hash_filled: true,
            hash,
            ..PageEntry::default()
        };

        if let Some(prior) = &self.prior {
            if let Some((prior_hash, prior_entry)) = prior.lookup(item.block_index, item.page_index) {
                if prior_hash == hash {
                    entry.same = true;
                    entry.size_on_disk = prior_entry.size_on_disk;
                    entry.file_pos = prior_entry.file_pos;
                    self.stats.count_page(PageKind::Same);
                    return Ok(self.finished(item, entry, None));
                }
            }
        }

        if zero {
            self.stats.count_page(PageKind::Zero);
            return Ok(self.finished(item, entry, None));
        }

        self.stats.count_page(PageKind::Changed);
        let payload = match &self.compression {
            Some(compression) => self.compress(compression, bytes)?,
            None => PagePayload::Guest,
        };
        Ok(self.finished(item, entry, Some(payload)))
    }

    fn compress(&self, compression: &Compression, bytes: &[u8]) -> Result<PagePayload, SnapshotError> {
        let started = Instant::now();
        let payload = match compression.pool.try_acquire() {
            Some(mut buf) => {
                let n = compression.codec.compress_into(bytes, buf.spare_mut())?;
                buf.set_len(n);
                PagePayload::Pooled(buf)
            }
            None => {
                // More pages in flight than the pool was sized for
                self.stats.count_pool_overflow();
                let mut buf = vec![0u8; compression.codec.max_compressed_size(bytes.len())];
                let n = compression.codec.compress_into(bytes, &mut buf)?;
                buf.truncate(n);
                PagePayload::Owned(buf)
            }
        };
        self.stats.add_compress_time(started.elapsed());
        Ok(payload)
    }

    fn finished(&self, item: QueuedPageInfo, entry: PageEntry, payload: Option<PagePayload>) -> WriteInfo {
        WriteInfo {
            block_index: item.block_index,
            page_index: item.page_index,
            entry,
            payload,
        }
    }

    /// Whether changed pages are compressed
    pub fn compresses(&self) -> bool {
        self.compression.is_some()
    }
}
