//! Snapshot loader
//!
//! Opens a saved snapshot file, validates its index once, and serves two
//! kinds of client:
//!
//! - the saver of the next incremental snapshot, through the per-page
//!   [`RamLoader::hash_for_page`] / [`RamLoader::file_pos_for_page`] lookups
//!   and [`RamLoader::gaps`];
//! - a restore path, through [`RamLoader::read_page`],
//!   [`RamLoader::read_block`] and [`RamLoader::restore_block`].
//!
//! The loader never writes to the file.

use parking_lot::Mutex;
use ramsnap_core::PageHash;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::codec::{codec_for_flags, PageCodec};
use crate::error::{LoadError, LoadResult};
use crate::format::{
    read_index_offset, FileIndex, PageLocation, FILE_HEADER_SIZE, INDEX_HEADER_SIZE,
    INDEX_TRAILER_SIZE,
};

/// Read access to one saved snapshot
pub struct RamLoader {
    path: PathBuf,
    file: Mutex<File>,
    file_len: u64,
    index: FileIndex,
    index_len: u64,
    codec: Box<dyn PageCodec>,
}

impl RamLoader {
    /// Open `path` and parse its published index
    ///
    /// Fails if no index was ever published, the offset slot points outside
    /// the file, or the index does not decode and validate completely.
    pub fn open(path: impl AsRef<Path>) -> LoadResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        let offset = read_index_offset(&mut file)?;
        if offset == 0 {
            return Err(LoadError::NoIndex);
        }
        let header_end = offset.checked_add(INDEX_HEADER_SIZE as u64);
        if offset < FILE_HEADER_SIZE || header_end.map_or(true, |end| end > file_len) {
            return Err(LoadError::IndexOutOfRange { offset, file_len });
        }

        let mut header = [0u8; INDEX_HEADER_SIZE];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut header)?;
        let body_len = FileIndex::decode_header(&header)?;

        let index_len = (INDEX_HEADER_SIZE as u64)
            .checked_add(body_len)
            .and_then(|n| n.checked_add(INDEX_TRAILER_SIZE as u64))
            .filter(|&n| offset.checked_add(n).map_or(false, |end| end <= file_len))
            .ok_or(LoadError::IndexOutOfRange { offset, file_len })?;

        let mut body = vec![0u8; (index_len - INDEX_HEADER_SIZE as u64) as usize];
        file.read_exact(&mut body)?;
        let index = FileIndex::decode_body(&body, offset)?;
        let codec = codec_for_flags(index.flags);

        info!(
            target: "ramsnap::loader",
            path = %path.display(),
            index_offset = offset,
            blocks = index.blocks.len(),
            total_pages = index.total_pages,
            compressed = index.flags.compressed_pages(),
            "Snapshot index loaded"
        );

        Ok(RamLoader {
            path,
            file: Mutex::new(file),
            file_len,
            index,
            index_len,
            codec,
        })
    }

    /// Stored hash of a page, if the prior save recorded one
    pub fn hash_for_page(&self, block_index: usize, page_index: u32) -> Option<PageHash> {
        self.index.page(block_index, page_index)?.hash()
    }

    /// Stored payload location of a page (size 0 for a zero page)
    pub fn file_pos_for_page(&self, block_index: usize, page_index: u32) -> Option<PageLocation> {
        Some(self.index.page(block_index, page_index)?.location())
    }

    /// The parsed index
    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    /// Whether stored pages are compressed
    pub fn compressed(&self) -> bool {
        self.index.flags.compressed_pages()
    }

    /// Path the loader was opened on
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File length when the loader was opened
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Position of the block with the given id
    pub fn find_block(&self, id: &str) -> Option<usize> {
        self.index.find_block(id)
    }

    /// One past the last byte of the index
    pub fn index_end(&self) -> u64 {
        self.index.start_pos_in_file + self.index_len
    }

    /// Byte ranges of the file no longer referenced, as `(offset, length)`
    ///
    /// Everything in `[8, file_len)` that is neither a stored page of the
    /// index nor the index itself.
    pub fn gaps(&self) -> Vec<(u64, u64)> {
        let mut used: Vec<(u64, u64)> = self
            .index
            .stored_ranges()
            .iter()
            .map(|r| (r.offset, r.end()))
            .collect();
        used.push((self.index.start_pos_in_file, self.index_end()));
        used.sort_unstable();

        let mut gaps = Vec::new();
        let mut cursor = FILE_HEADER_SIZE;
        for (start, end) in used {
            if start > cursor {
                gaps.push((cursor, start - cursor));
            }
            cursor = cursor.max(end);
        }
        if self.file_len > cursor {
            gaps.push((cursor, self.file_len - cursor));
        }
        debug!(
            target: "ramsnap::loader",
            count = gaps.len(),
            bytes = gaps.iter().map(|g| g.1).sum::<u64>(),
            "Computed free ranges"
        );
        gaps
    }

    /// Materialize one page into `dst`
    ///
    /// `dst` must be exactly one page long. Zero pages are zero-filled;
    /// stored pages are read and, for compressed snapshots, decompressed.
    pub fn read_page(&self, block_index: usize, page_index: u32, dst: &mut [u8]) -> LoadResult<()> {
        let block = self
            .index
            .blocks
            .get(block_index)
            .ok_or(LoadError::BlockOutOfRange(block_index))?;
        let entry = block.pages.get(page_index as usize).ok_or(LoadError::PageOutOfRange {
            block_index,
            page_index,
        })?;
        let page_size = block.descriptor.page_size as usize;
        if dst.len() != page_size {
            return Err(LoadError::SizeMismatch {
                expected: page_size as u64,
                actual: dst.len() as u64,
            });
        }

        if entry.zeroed() {
            dst.fill(0);
            return Ok(());
        }

        let mut stored = vec![0u8; entry.size_on_disk as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(entry.file_pos))?;
            file.read_exact(&mut stored)?;
        }
        let n = self.codec.decompress_into(&stored, dst)?;
        if n != page_size {
            return Err(LoadError::SizeMismatch {
                expected: page_size as u64,
                actual: n as u64,
            });
        }
        Ok(())
    }

    /// Materialize a whole block
    pub fn read_block(&self, block_index: usize) -> LoadResult<Vec<u8>> {
        let block = self
            .index
            .blocks
            .get(block_index)
            .ok_or(LoadError::BlockOutOfRange(block_index))?;
        let mut out = vec![0u8; block.descriptor.total_size as usize];
        self.fill_block(block_index, &mut out)?;
        Ok(out)
    }

    /// Materialize the block `id` into `dst`, which must match its size
    pub fn restore_block(&self, id: &str, dst: &mut [u8]) -> LoadResult<()> {
        let block_index = self
            .find_block(id)
            .ok_or_else(|| LoadError::UnknownBlock(id.to_string()))?;
        let total_size = self.index.blocks[block_index].descriptor.total_size;
        if dst.len() as u64 != total_size {
            return Err(LoadError::SizeMismatch {
                expected: total_size,
                actual: dst.len() as u64,
            });
        }
        self.fill_block(block_index, dst)
    }

    fn fill_block(&self, block_index: usize, dst: &mut [u8]) -> LoadResult<()> {
        let page_size = self.index.blocks[block_index].descriptor.page_size as usize;
        for (page_index, page) in dst.chunks_exact_mut(page_size).enumerate() {
            self.read_page(block_index, page_index as u32, page)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RamLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamLoader")
            .field("path", &self.path)
            .field("file_len", &self.file_len)
            .field("index_offset", &self.index.start_pos_in_file)
            .field("blocks", &self.index.blocks.len())
            .field("codec", &self.codec.codec_id())
            .finish()
    }
}
