//! The single writer stage
//!
//! [`PageWriter`] owns everything that decides file layout: the file handle,
//! the in-progress [`FileIndex`] and the [`GapTracker`]. Only one thread
//! applies writes at a time, so offsets are assigned without races and
//! each page entry is updated by exactly one party.

use ramsnap_core::RamBlock;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::error::SnapshotError;
use crate::format::{write_index_offset, FileIndex, FILE_HEADER_SIZE};
use crate::gap_tracker::GapTracker;
use crate::saver::{PagePayload, WriteInfo};
use crate::stats::IncrementalStats;

const WRITE_BUFFER_SIZE: usize = 1 << 20;

/// Marks the underlying file position as unknown
const POSITION_UNKNOWN: u64 = u64::MAX;

/// Writes page payloads and the index of one save
pub struct PageWriter {
    file: BufWriter<File>,
    position: u64,
    index: FileIndex,
    gaps: GapTracker,
    blocks: Arc<[RamBlock]>,
    stats: Arc<IncrementalStats>,
    /// Payload writes left before one fails
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl PageWriter {
    /// Writer over `file`, whose current position is `position`
    pub fn new(
        file: File,
        position: u64,
        index: FileIndex,
        gaps: GapTracker,
        blocks: Arc<[RamBlock]>,
        stats: Arc<IncrementalStats>,
    ) -> Self {
        PageWriter {
            file: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
            position,
            index,
            gaps,
            blocks,
            stats,
            #[cfg(test)]
            fail_after: None,
        }
    }

    /// Make the payload write after the next `writes` ones fail
    ///
    /// The failing write stores half of its payload first, as a short write
    /// would.
    #[cfg(test)]
    pub(crate) fn fail_payload_write_after(&mut self, writes: usize) {
        self.fail_after = Some(writes);
    }

    /// Store a classified page
    ///
    /// A payload is placed in the best-fitting gap or at the end of the
    /// file, then the page's entry is replaced. If the page was already
    /// written earlier in this save, its old payload range is freed. On a
    /// write failure the entry is left untouched and the error returned.
    /// The range of a failed write stays reserved until the end of the
    /// save: part of the payload may still sit in the write buffer, and no
    /// later page may be placed where it can land.
    pub fn apply(&mut self, info: WriteInfo) -> Result<(), SnapshotError> {
        let WriteInfo {
            block_index,
            page_index,
            mut entry,
            payload,
        } = info;

        if let Some(payload) = payload {
            let blocks = Arc::clone(&self.blocks);
            let bytes: &[u8] = match &payload {
                PagePayload::Guest => blocks[block_index]
                    .page(page_index)
                    .expect("page index validated by save_page"),
                PagePayload::Pooled(buf) => buf.bytes(),
                PagePayload::Owned(buf) => buf.as_slice(),
            };
            let size = bytes.len() as u64;

            let started = Instant::now();
            let end_before = self.gaps.end();
            let offset = self.gaps.reserve(size);
            if let Err(e) = self.write_payload(offset, bytes) {
                debug!(
                    target: "ramsnap::pipeline",
                    block_index,
                    page_index,
                    offset,
                    size,
                    "Payload write failed; range left reserved"
                );
                return Err(e.into());
            }
            self.stats.count_write(size, offset < end_before, started.elapsed());

            entry.size_on_disk = size as u32;
            entry.file_pos = offset;
            // payload drops here; a pooled buffer goes back to its pool
        }

        if let Some(slot) = self.index.page_mut(block_index, page_index) {
            if slot.size_on_disk > 0 && !slot.same {
                self.gaps.release(slot.file_pos, slot.size_on_disk as u64);
            }
            *slot = entry;
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn write_payload(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.write_at(offset, bytes)
    }

    #[cfg(test)]
    fn write_payload(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                self.write_at(offset, &bytes[..bytes.len() / 2])?;
                self.position = POSITION_UNKNOWN;
                Err(io::Error::new(io::ErrorKind::Other, "injected write failure"))
            }
            Some(n) => {
                self.fail_after = Some(n - 1);
                self.write_at(offset, bytes)
            }
            None => self.write_at(offset, bytes),
        }
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        if self.position != offset {
            if let Err(e) = self.file.seek(SeekFrom::Start(offset)) {
                self.position = POSITION_UNKNOWN;
                return Err(e);
            }
        }
        if let Err(e) = self.file.write_all(bytes) {
            self.position = POSITION_UNKNOWN;
            return Err(e);
        }
        self.position = offset + bytes.len() as u64;
        Ok(())
    }

    /// Push buffered payload bytes to the file
    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    /// Write the index at the end of the payload region
    ///
    /// Returns the index offset and the offset one past its last byte.
    /// Nothing points at the index until [`PageWriter::publish`].
    pub fn write_index(&mut self) -> io::Result<(u64, u64)> {
        let offset = self.gaps.end();
        self.index.start_pos_in_file = offset;
        let bytes = self.index.encode();
        self.write_at(offset, &bytes)?;
        self.file.flush()?;
        let end = offset + bytes.len() as u64;
        debug!(
            target: "ramsnap::saver",
            offset,
            len = bytes.len(),
            blocks = self.index.blocks.len(),
            total_pages = self.index.total_pages,
            "Index written"
        );
        Ok((offset, end))
    }

    /// Point the offset slot at the index written by `write_index`
    ///
    /// With `sync`, the index is made durable before the slot changes and
    /// the slot is made durable afterwards. Bytes past `index_end` (left by
    /// an earlier interrupted save) are truncated once the slot is
    /// published.
    pub fn publish(&mut self, index_offset: u64, index_end: u64, sync: bool) -> io::Result<()> {
        self.file.flush()?;
        let file = self.file.get_mut();
        if sync {
            file.sync_data()?;
        }
        write_index_offset(file, index_offset)?;
        self.position = FILE_HEADER_SIZE;
        if file.metadata()?.len() > index_end {
            file.set_len(index_end)?;
        }
        if sync {
            file.sync_all()?;
        }
        Ok(())
    }

    /// The index as built so far
    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    /// Free-space state of the payload region
    pub fn gaps(&self) -> &GapTracker {
        &self.gaps
    }
}
