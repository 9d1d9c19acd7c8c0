//! RAM snapshot saver
//!
//! One [`RamSaver`] performs one save:
//!
//! ```text
//! new ──► register_block* ──► save_page* ──► complete ──► join
//! ```
//!
//! Each page is classified (same as the prior snapshot, all zero, or
//! changed), hashed, optionally compressed and handed to a single writer
//! that assigns its file position. With [`SaveFlags::ASYNC`] the work runs
//! on a hashing pool and a writer thread; otherwise everything runs on the
//! caller thread.
//!
//! # Crash safety
//!
//! New payloads only ever go into ranges the previous index does not
//! reference, and the new index goes past everything else. The offset slot
//! at the start of the file is rewritten last, so until it changes the file
//! still reads as the previous snapshot.
//!
//! # Errors
//!
//! Per-page failures do not stop the save. They raise a sticky flag
//! ([`RamSaver::has_error`]) which the caller checks after `join`.

mod classify;

pub use classify::{
    Compression, PageClassifier, PagePayload, PriorSnapshot, QueuedPageInfo, WriteInfo,
};

use parking_lot::Mutex;
use ramsnap_core::RamBlock;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::codec::ZstdCodec;
use crate::config::SaverConfig;
use crate::error::{SnapshotError, SnapshotResult};
use crate::flags::SaveFlags;
use crate::format::{read_index_offset, FileIndex, IndexFlags, FILE_HEADER_SIZE};
use crate::gap_tracker::GapTracker;
use crate::loader::RamLoader;
use crate::pipeline::{PageWriter, Pipeline, StickyError};
use crate::registry::RamBlockRegistry;
use crate::stats::{IncrementalStats, SaveStats};
use crate::testing::CrashPoint;

/// How pages reach the writer
enum Dispatch {
    /// Classify and write on the caller thread
    Sync,
    /// Hashing pool plus writer thread
    Async(Pipeline),
}

enum Stage {
    /// Blocks may still be registered
    Registering {
        file: File,
        position: u64,
        gaps: GapTracker,
    },
    /// Pages are being saved
    Saving {
        dispatch: Dispatch,
        classifier: Arc<PageClassifier>,
        writer: Arc<Mutex<PageWriter>>,
    },
    /// `complete` has run (or the save could not proceed)
    Finished,
}

/// Saves guest RAM to a snapshot file, incrementally when a prior
/// snapshot of the same file is available
pub struct RamSaver {
    path: PathBuf,
    flags: SaveFlags,
    config: SaverConfig,
    is_on_exit: bool,
    registry: RamBlockRegistry,
    loader: Option<Arc<RamLoader>>,
    stage: Stage,
    stats: Arc<IncrementalStats>,
    errors: Arc<StickyError>,
    started: Instant,
    ended: Option<Instant>,
    index_offset: Option<u64>,
}

impl RamSaver {
    /// Open `path` for a save with the default configuration
    ///
    /// See [`RamSaver::with_config`].
    pub fn new(
        path: impl AsRef<Path>,
        flags: SaveFlags,
        loader: Option<Arc<RamLoader>>,
        is_on_exit: bool,
    ) -> SnapshotResult<Self> {
        Self::with_config(path, flags, loader, is_on_exit, SaverConfig::default())
    }

    /// Open `path` for a save
    ///
    /// `loader` is the previous snapshot of the same file. It is used only
    /// when it was opened on `path`, its index is still the one published
    /// there, and its compression matches `flags`; otherwise the save is a
    /// full save. A full save truncates the file and
    /// zeroes the offset slot. An incremental save keeps the file and leaves
    /// the slot pointing at the previous index until completion.
    ///
    /// With `is_on_exit`, or without [`SaveFlags::ASYNC`], no threads are
    /// started.
    pub fn with_config(
        path: impl AsRef<Path>,
        flags: SaveFlags,
        loader: Option<Arc<RamLoader>>,
        is_on_exit: bool,
        config: SaverConfig,
    ) -> SnapshotResult<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let loader = loader.filter(|l| accept_prior(l, &path, flags));

        let stage = match &loader {
            Some(prior) => {
                let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
                let file_len = file.seek(SeekFrom::End(0))?;
                let gaps = GapTracker::with_gaps(file_len.max(prior.file_len()), prior.gaps());
                Stage::Registering {
                    file,
                    position: file_len,
                    gaps,
                }
            }
            None => {
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)?;
                file.write_all(&0u64.to_le_bytes())?;
                Stage::Registering {
                    file,
                    position: FILE_HEADER_SIZE,
                    gaps: GapTracker::new(FILE_HEADER_SIZE),
                }
            }
        };

        info!(
            target: "ramsnap::saver",
            path = %path.display(),
            incremental = loader.is_some(),
            compress = flags.has_compress(),
            asynchronous = flags.has_async() && !is_on_exit,
            "Save started"
        );

        Ok(RamSaver {
            path,
            flags,
            config,
            is_on_exit,
            registry: RamBlockRegistry::new(),
            loader,
            stage,
            stats: Arc::new(IncrementalStats::new()),
            errors: Arc::new(StickyError::new()),
            started: Instant::now(),
            ended: None,
            index_offset: None,
        })
    }

    /// Add a guest RAM region to the save
    ///
    /// Blocks are stored in registration order.
    ///
    /// # Panics
    ///
    /// After the first `save_page`, or for a block that duplicates or
    /// overlaps one already registered.
    pub fn register_block(&mut self, block: RamBlock) {
        assert!(
            matches!(self.stage, Stage::Registering { .. }),
            "register_block called after saving started"
        );
        debug!(
            target: "ramsnap::saver",
            block = block.id(),
            start_offset = block.start_offset(),
            total_size = block.total_size(),
            page_size = block.page_size(),
            "Block registered"
        );
        self.registry.register(block);
    }

    /// Save one page
    ///
    /// `block_offset` is the start offset of a registered block and
    /// `page_offset` the page's byte offset inside it. Errors are recorded
    /// in the sticky flag, not returned. Pages never passed here are saved
    /// as zero pages.
    ///
    /// # Panics
    ///
    /// For an unregistered block, an offset outside the block, a page size
    /// other than the block's, or a call after `complete`.
    pub fn save_page(&mut self, block_offset: u64, page_offset: u64, page_size: u32) {
        let block_index = self
            .registry
            .lookup(block_offset)
            .unwrap_or_else(|| panic!("save_page for unregistered block at {:#x}", block_offset));
        let block = &self.registry.blocks()[block_index];
        assert_eq!(
            page_size,
            block.page_size(),
            "page size mismatch for block '{}'",
            block.id()
        );
        assert!(
            page_offset % page_size as u64 == 0 && page_offset < block.total_size(),
            "page offset {:#x} outside block '{}'",
            page_offset,
            block.id()
        );
        let item = QueuedPageInfo {
            block_index,
            page_index: (page_offset / page_size as u64) as u32,
        };

        self.start_saving();
        match &self.stage {
            Stage::Saving {
                dispatch: Dispatch::Async(pipeline),
                ..
            } => {
                if let Err(e) = pipeline.submit(item) {
                    self.errors.record(&e);
                }
            }
            Stage::Saving {
                dispatch: Dispatch::Sync,
                classifier,
                writer,
            } => {
                let result = classifier
                    .classify(item)
                    .and_then(|info| writer.lock().apply(info));
                if let Err(e) = result {
                    self.errors.record(&e);
                }
            }
            Stage::Finished => panic!("save_page called after complete"),
            Stage::Registering { .. } => unreachable!("saving started above"),
        }
    }

    /// Save every page of every registered block, in registration order
    pub fn save_all_pages(&mut self) {
        let pages: Vec<(u64, u32, u32)> = self
            .registry
            .blocks()
            .iter()
            .map(|b| (b.start_offset(), b.page_size(), b.page_count()))
            .collect();
        for (start_offset, page_size, page_count) in pages {
            for page in 0..page_count {
                self.save_page(start_offset, page as u64 * page_size as u64, page_size);
            }
        }
    }

    /// Finish the save
    ///
    /// Waits for every submitted page to be written, writes the index at
    /// the end of the file, then points the offset slot at it. Calling it
    /// again does nothing.
    pub fn complete(&mut self) {
        self.finish(None);
    }

    /// Run the completion protocol, stopping early at `stop_at`
    pub(crate) fn finish(&mut self, stop_at: Option<CrashPoint>) {
        if matches!(self.stage, Stage::Finished) {
            return;
        }
        self.start_saving();
        let page_writer = match std::mem::replace(&mut self.stage, Stage::Finished) {
            Stage::Saving {
                dispatch, writer, ..
            } => {
                if let Dispatch::Async(pipeline) = dispatch {
                    pipeline.drain();
                    pipeline.shutdown();
                }
                writer
            }
            _ => return,
        };
        let mut writer = page_writer.lock();

        if let Err(e) = writer.flush() {
            self.errors.record(&SnapshotError::Io(e));
        }
        if stop_at == Some(CrashPoint::BeforeIndex) {
            return;
        }

        let (offset, end) = match writer.write_index() {
            Ok(pos) => pos,
            Err(e) => {
                self.errors.record(&SnapshotError::Io(e));
                return;
            }
        };
        if stop_at == Some(CrashPoint::BeforePublish) {
            return;
        }

        if let Err(e) = writer.publish(offset, end, self.config.sync_on_complete) {
            self.errors.record(&SnapshotError::Io(e));
            return;
        }
        self.index_offset = Some(offset);
        self.ended = Some(Instant::now());

        let stats = self.stats.snapshot();
        info!(
            target: "ramsnap::saver",
            path = %self.path.display(),
            index_offset = offset,
            total_pages = stats.total_pages,
            same_pages = stats.same_pages,
            changed_pages = stats.changed_pages,
            zero_pages = stats.zero_pages,
            bytes_written = stats.bytes_written,
            gap_reuses = stats.gap_reuses,
            free_bytes = writer.gaps().total_free(),
            duration_ms = self.duration().map_or(0, |d| d.as_millis() as u64),
            errors = self.errors.is_set(),
            "Save complete"
        );
    }

    /// Wait for background threads to exit
    ///
    /// After `complete` the threads are already gone. Called before
    /// `complete`, it stops the pipeline and later pages are saved on the
    /// caller thread. Idempotent.
    pub fn join(&mut self) {
        if let Stage::Saving { dispatch, .. } = &mut self.stage {
            if let Dispatch::Async(pipeline) = std::mem::replace(dispatch, Dispatch::Sync) {
                pipeline.shutdown();
            }
        }
    }

    /// Whether any error occurred during the save
    pub fn has_error(&self) -> bool {
        self.errors.is_set()
    }

    /// Message of the first error, if any
    pub fn first_error(&self) -> Option<String> {
        self.errors.first()
    }

    /// Whether changed pages are stored compressed
    pub fn compressed(&self) -> bool {
        self.flags.has_compress()
    }

    /// Bytes before the index: offset slot plus payload region, gaps included
    ///
    /// Zero until the save has completed.
    pub fn disk_size(&self) -> u64 {
        self.index_offset.unwrap_or(0)
    }

    /// Whether a prior snapshot was used
    pub fn incremental(&self) -> bool {
        self.loader.is_some()
    }

    /// Wall-clock time of a completed save
    pub fn duration(&self) -> Option<Duration> {
        self.ended.map(|end| end.duration_since(self.started))
    }

    /// Counters of this save so far
    pub fn stats(&self) -> SaveStats {
        self.stats.snapshot()
    }

    /// Destination path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registered blocks in order
    pub fn blocks(&self) -> &[RamBlock] {
        self.registry.blocks()
    }

    fn start_saving(&mut self) {
        if !matches!(self.stage, Stage::Registering { .. }) {
            return;
        }
        let Stage::Registering {
            file,
            position,
            gaps,
        } = std::mem::replace(&mut self.stage, Stage::Finished)
        else {
            return;
        };

        let blocks: Arc<[RamBlock]> = Arc::from(self.registry.blocks());
        let index_flags = if self.flags.has_compress() {
            IndexFlags::COMPRESSED_PAGES
        } else {
            IndexFlags::EMPTY
        };
        let mut index = FileIndex::new(index_flags);
        for block in blocks.iter() {
            index.add_block(block.descriptor().clone());
        }

        let asynchronous = self.flags.has_async() && !self.is_on_exit;
        let prior = self
            .loader
            .as_ref()
            .map(|l| PriorSnapshot::new(Arc::clone(l), &blocks));
        if let Some(prior) = &prior {
            debug!(
                target: "ramsnap::saver",
                matched = prior.matched_blocks(),
                blocks = blocks.len(),
                "Prior snapshot blocks matched"
            );
        }
        let compression = self.flags.has_compress().then(|| {
            let buffers = if asynchronous {
                self.config.compress_buffer_count()
            } else {
                1
            };
            let max_page = blocks.iter().map(|b| b.page_size()).max().unwrap_or(0);
            Compression::new(
                ZstdCodec::new(self.config.compression_level),
                buffers,
                max_page as usize,
            )
        });

        let classifier = Arc::new(PageClassifier::new(
            Arc::clone(&blocks),
            prior,
            compression,
            Arc::clone(&self.stats),
        ));
        let writer = Arc::new(Mutex::new(PageWriter::new(
            file,
            position,
            index,
            gaps,
            blocks,
            Arc::clone(&self.stats),
        )));

        let dispatch = if asynchronous {
            match Pipeline::start(
                Arc::clone(&classifier),
                Arc::clone(&writer),
                &self.config,
                Arc::clone(&self.errors),
            ) {
                Ok(pipeline) => Dispatch::Async(pipeline),
                Err(e) => {
                    warn!(
                        target: "ramsnap::saver",
                        error = %e,
                        "Could not start save threads; saving on the caller thread"
                    );
                    Dispatch::Sync
                }
            }
        } else {
            Dispatch::Sync
        };

        self.stage = Stage::Saving {
            dispatch,
            classifier,
            writer,
        };
    }
}

impl Drop for RamSaver {
    fn drop(&mut self) {
        if let Stage::Saving { dispatch, .. } = std::mem::replace(&mut self.stage, Stage::Finished) {
            warn!(
                target: "ramsnap::saver",
                path = %self.path.display(),
                "Save dropped before completion; snapshot left unchanged"
            );
            if let Dispatch::Async(pipeline) = dispatch {
                pipeline.shutdown();
            }
        }
    }
}

impl std::fmt::Debug for RamSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamSaver")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("blocks", &self.registry.len())
            .field("incremental", &self.incremental())
            .field("has_error", &self.has_error())
            .finish()
    }
}

/// Whether `loader` can serve as the prior snapshot of a save to `path`
fn accept_prior(loader: &RamLoader, path: &Path, flags: SaveFlags) -> bool {
    let same_file = match (std::fs::canonicalize(loader.path()), std::fs::canonicalize(path)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if !same_file {
        warn!(
            target: "ramsnap::saver",
            prior = %loader.path().display(),
            path = %path.display(),
            "Prior snapshot is a different file; doing a full save"
        );
        return false;
    }
    if loader.compressed() != flags.has_compress() {
        warn!(
            target: "ramsnap::saver",
            prior_compressed = loader.compressed(),
            compress = flags.has_compress(),
            "Prior snapshot compression differs; doing a full save"
        );
        return false;
    }
    match is_published(loader, path) {
        Ok(true) => true,
        Ok(false) => {
            warn!(
                target: "ramsnap::saver",
                path = %path.display(),
                prior_offset = loader.index().start_pos_in_file,
                "Prior snapshot is no longer the published one; doing a full save"
            );
            false
        }
        Err(e) => {
            warn!(
                target: "ramsnap::saver",
                path = %path.display(),
                error = %e,
                "Could not read the published index; doing a full save"
            );
            false
        }
    }
}

/// Whether the offset slot of `path` still points at the index `loader` read
///
/// The loader's free ranges are only safe to write into while its index is
/// the published one. The slot and the index bytes are both compared, since
/// a later save can place its index at the same offset.
fn is_published(loader: &RamLoader, path: &Path) -> io::Result<bool> {
    let index = loader.index();
    let mut file = File::open(path)?;
    if read_index_offset(&mut file)? != index.start_pos_in_file {
        return Ok(false);
    }

    let expected = index.encode();
    let mut on_disk = vec![0u8; expected.len()];
    file.seek(SeekFrom::Start(index.start_pos_in_file))?;
    match file.read_exact(&mut on_disk) {
        Ok(()) => Ok(on_disk == expected),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
