//! Two-stage save pipeline.
//!
//! ```text
//! save_page ──► work queue ──► hashing workers ──► write queue ──► writer
//!              (QueuedPageInfo)  classify/compress   (WriteInfo)    PageWriter
//! ```
//!
//! Both queues are bounded, so memory use does not depend on guest RAM
//! size. Workers may finish pages out of order; each [`WriteInfo`] names
//! its own index slot, so the writer does not care.

mod queue;
mod workers;
mod writer;

pub use queue::{InFlightGuard, WorkQueue};
pub use workers::WorkerPool;
pub use writer::PageWriter;

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::SaverConfig;
use crate::error::SnapshotError;
use crate::saver::{PageClassifier, QueuedPageInfo, WriteInfo};

/// Error flag that stays set once raised
///
/// Keeps the first error's message for diagnostics; later errors are
/// logged but not stored.
#[derive(Debug, Default)]
pub struct StickyError {
    raised: AtomicBool,
    first: Mutex<Option<String>>,
}

impl StickyError {
    /// Flag in the clear state
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag for `err`
    pub fn record(&self, err: &SnapshotError) {
        error!(target: "ramsnap::pipeline", error = %err, "Save error");
        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(err.to_string());
        }
        self.raised.store(true, Ordering::Release);
    }

    /// Whether any error was recorded
    pub fn is_set(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Message of the first recorded error
    pub fn first(&self) -> Option<String> {
        self.first.lock().clone()
    }
}

/// Running background stages of one save
pub struct Pipeline {
    work: Arc<WorkQueue<QueuedPageInfo>>,
    writes: Arc<WorkQueue<WriteInfo>>,
    hashers: WorkerPool,
    writer: WorkerPool,
}

impl Pipeline {
    /// Start the writer thread and `config.worker_count` hashing workers
    ///
    /// The writer thread is the only user of `page_writer` until
    /// [`Pipeline::shutdown`] returns.
    pub fn start(
        classifier: Arc<PageClassifier>,
        page_writer: Arc<Mutex<PageWriter>>,
        config: &SaverConfig,
        errors: Arc<StickyError>,
    ) -> io::Result<Self> {
        let work = Arc::new(WorkQueue::new(config.work_queue_depth));
        let writes = Arc::new(WorkQueue::new(config.write_queue_depth));

        let mut writer = WorkerPool::spawn(
            "ramsnap-writer",
            1,
            Arc::clone(&writes),
            Arc::clone(&errors),
            move |info: WriteInfo| page_writer.lock().apply(info),
        )?;

        let outbox = Arc::clone(&writes);
        let hashers = WorkerPool::spawn(
            "ramsnap-hash",
            config.worker_count,
            Arc::clone(&work),
            Arc::clone(&errors),
            move |item: QueuedPageInfo| {
                let info = classifier.classify(item)?;
                outbox.push(info).map_err(|_| SnapshotError::PipelineClosed)
            },
        );
        let hashers = match hashers {
            Ok(hashers) => hashers,
            Err(e) => {
                writes.close();
                writer.join();
                return Err(e);
            }
        };

        debug!(
            target: "ramsnap::pipeline",
            workers = config.worker_count,
            work_queue_depth = config.work_queue_depth,
            write_queue_depth = config.write_queue_depth,
            "Pipeline started"
        );
        Ok(Pipeline {
            work,
            writes,
            hashers,
            writer,
        })
    }

    /// Queue a page for classification, blocking while the queue is full
    pub fn submit(&self, item: QueuedPageInfo) -> Result<(), SnapshotError> {
        self.work.push(item).map_err(|_| SnapshotError::PipelineClosed)
    }

    /// Block until every submitted page has been classified and written
    ///
    /// The work queue is drained first; only then can the write queue stop
    /// receiving items.
    pub fn drain(&self) {
        self.work.drain();
        self.writes.drain();
    }

    /// Drain both stages and join every thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.work.is_closed() && self.writes.is_closed() {
            return;
        }
        self.work.close();
        self.hashers.join();
        self.writes.close();
        self.writer.join();
        debug!(target: "ramsnap::pipeline", "Pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
