//! Saver configuration.
//!
//! This module provides configuration for the RAM saver pipeline.

use crate::codec::DEFAULT_ZSTD_LEVEL;

/// Saver configuration parameters.
#[derive(Debug, Clone)]
pub struct SaverConfig {
    /// Number of hashing/compression workers (default: host parallelism).
    pub worker_count: usize,

    /// Pages that may wait for a worker before `save_page` blocks (default: 1024).
    pub work_queue_depth: usize,

    /// Classified pages that may wait for the writer before workers block
    /// (default: 256).
    pub write_queue_depth: usize,

    /// zstd level for compressed saves (default: 1).
    pub compression_level: i32,

    /// fsync the file when the save completes (default: true).
    ///
    /// The index is synced before the offset slot is published, and the
    /// file again afterwards.
    pub sync_on_complete: bool,
}

impl Default for SaverConfig {
    fn default() -> Self {
        SaverConfig {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            work_queue_depth: 1024,
            write_queue_depth: 256,
            compression_level: DEFAULT_ZSTD_LEVEL,
            sync_on_complete: true,
        }
    }
}

impl SaverConfig {
    /// Create a new saver configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set worker count (builder pattern).
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set work queue depth (builder pattern).
    pub fn with_work_queue_depth(mut self, depth: usize) -> Self {
        self.work_queue_depth = depth;
        self
    }

    /// Set write queue depth (builder pattern).
    pub fn with_write_queue_depth(mut self, depth: usize) -> Self {
        self.write_queue_depth = depth;
        self
    }

    /// Set compression level (builder pattern).
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Set whether completion fsyncs the file (builder pattern).
    pub fn with_sync_on_complete(mut self, sync: bool) -> Self {
        self.sync_on_complete = sync;
        self
    }

    /// Number of compression buffers the pipeline needs.
    ///
    /// Every compressed page holds a buffer from compression until its
    /// write: at most one per worker, one per write-queue slot and the one
    /// being written.
    pub fn compress_buffer_count(&self) -> usize {
        self.worker_count + self.write_queue_depth + 1
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), SaverConfigError> {
        if self.worker_count == 0 {
            return Err(SaverConfigError::NoWorkers);
        }
        if self.work_queue_depth == 0 || self.write_queue_depth == 0 {
            return Err(SaverConfigError::ZeroQueueDepth);
        }
        if !zstd::compression_level_range().contains(&self.compression_level) {
            return Err(SaverConfigError::InvalidCompressionLevel(
                self.compression_level,
            ));
        }
        Ok(())
    }

    /// Create a configuration optimized for testing (few threads, tiny queues).
    pub fn for_testing() -> Self {
        SaverConfig {
            worker_count: 2,
            work_queue_depth: 4,
            write_queue_depth: 2,
            compression_level: DEFAULT_ZSTD_LEVEL,
            sync_on_complete: false,
        }
    }
}

/// Saver configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SaverConfigError {
    /// At least one worker is required.
    #[error("Worker count must be at least 1")]
    NoWorkers,

    /// Queues must hold at least one item.
    #[error("Queue depths must be at least 1")]
    ZeroQueueDepth,

    /// Compression level outside zstd's range.
    #[error("Invalid zstd compression level {0}")]
    InvalidCompressionLevel(i32),
}
