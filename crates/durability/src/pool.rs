//! Fixed pool of reusable compression buffers
//!
//! Each compressed page needs a destination buffer from the moment a worker
//! compresses it until the writer has flushed it. Leasing those buffers from
//! a fixed pool avoids a heap allocation per page during large saves.
//!
//! A [`PooledBuffer`] returns itself to the pool when dropped, so a lease is
//! released exactly once, on whichever thread drops it. In the save pipeline
//! that is the writer thread, after the bytes hit the file.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

struct PoolInner {
    free: Mutex<Vec<Box<[u8]>>>,
    buffer_size: usize,
    capacity: usize,
}

/// A bounded set of equally sized byte buffers
#[derive(Clone)]
pub struct FastReleasePool {
    inner: Arc<PoolInner>,
}

impl FastReleasePool {
    /// Allocate `capacity` buffers of `buffer_size` bytes up front
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let free = (0..capacity)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        FastReleasePool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                buffer_size,
                capacity,
            }),
        }
    }

    /// Lease a buffer, or `None` if every buffer is checked out
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        let buf = self.inner.free.lock().pop()?;
        Some(PooledBuffer {
            buf: Some(buf),
            len: 0,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Buffers currently available
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Total number of buffers
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Size of each buffer in bytes
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }
}

impl fmt::Debug for FastReleasePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastReleasePool")
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .field("buffer_size", &self.inner.buffer_size)
            .finish()
    }
}

/// A buffer leased from a [`FastReleasePool`]
///
/// Carries a length so it can hold a payload shorter than its capacity.
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// The whole buffer, for filling
    pub fn spare_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }

    /// Mark the first `len` bytes as the payload
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.pool.buffer_size, "payload longer than pool buffer");
        self.len = len;
    }

    /// The payload bytes
    pub fn bytes(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.lock().push(buf);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len).finish()
    }
}
