//! Fixed pool of named consumer threads.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

use super::queue::WorkQueue;
use super::StickyError;
use crate::error::SnapshotError;

/// Threads that consume one [`WorkQueue`] with a shared handler.
///
/// Handler errors and panics never stop a worker: both are recorded in the
/// shared [`StickyError`] and the worker moves on to the next item.
pub struct WorkerPool {
    handles: Vec<(String, JoinHandle<()>)>,
    errors: Arc<StickyError>,
}

impl WorkerPool {
    /// Spawn `count` workers named `{name_prefix}-0`, `{name_prefix}-1`, ...
    ///
    /// If a thread cannot be spawned, the queue is closed, the workers
    /// already started are joined and the spawn error is returned.
    pub fn spawn<T, F>(
        name_prefix: &str,
        count: usize,
        queue: Arc<WorkQueue<T>>,
        errors: Arc<StickyError>,
        handler: F,
    ) -> io::Result<Self>
    where
        T: Send + 'static,
        F: Fn(T) -> Result<(), SnapshotError> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let mut pool = WorkerPool {
            handles: Vec::with_capacity(count),
            errors: Arc::clone(&errors),
        };

        for i in 0..count {
            let name = format!("{}-{}", name_prefix, i);
            let queue_clone = Arc::clone(&queue);
            let handler_clone = Arc::clone(&handler);
            let errors_clone = Arc::clone(&errors);
            let thread_name = name.clone();
            let spawned = std::thread::Builder::new().name(name.clone()).spawn(move || {
                consume(&thread_name, &queue_clone, handler_clone.as_ref(), &errors_clone)
            });
            match spawned {
                Ok(handle) => pool.handles.push((name, handle)),
                Err(e) => {
                    error!(target: "ramsnap::pipeline", thread = %name, error = %e, "Failed to spawn worker");
                    queue.close();
                    pool.join();
                    return Err(e);
                }
            }
        }

        debug!(target: "ramsnap::pipeline", prefix = name_prefix, count, "Workers started");
        Ok(pool)
    }

    /// Number of worker threads.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no threads.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit.
    ///
    /// Workers exit once their queue is closed and empty, so close the
    /// queue first.
    pub fn join(&mut self) {
        for (name, handle) in self.handles.drain(..) {
            if let Err(payload) = handle.join() {
                self.errors.record(&SnapshotError::ThreadPanicked {
                    thread: name,
                    message: panic_message(payload.as_ref()),
                });
            }
        }
    }
}

fn consume<T, F>(name: &str, queue: &WorkQueue<T>, handler: &F, errors: &StickyError)
where
    F: Fn(T) -> Result<(), SnapshotError>,
{
    while let Some((item, _guard)) = queue.pop() {
        match catch_unwind(AssertUnwindSafe(|| handler(item))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.record(&e),
            Err(payload) => errors.record(&SnapshotError::ThreadPanicked {
                thread: name.to_string(),
                message: panic_message(payload.as_ref()),
            }),
        }
        // _guard drops here and marks the item finished
    }
    debug!(target: "ramsnap::pipeline", thread = name, "Worker exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "(non-string panic)".to_string())
}
