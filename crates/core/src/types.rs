//! Guest memory region types
//!
//! A [`RamBlock`] describes one contiguous host region that backs part of the
//! guest's physical address space. The snapshot engine only ever reads these
//! regions; the VM memory subsystem owns them and must keep them unchanged
//! while a save is in progress (the VM is paused).

use crate::error::{BlockError, BlockResult};
use crate::limits::{is_valid_page_size, MAX_BLOCK_ID_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Read-only view of a host memory region backing guest RAM
pub trait HostMemory: Send + Sync {
    /// The region's bytes
    fn as_bytes(&self) -> &[u8];
}

impl<T> HostMemory for T
where
    T: AsRef<[u8]> + Send + Sync,
{
    fn as_bytes(&self) -> &[u8] {
        self.as_ref()
    }
}

/// Persisted description of a RAM block (everything except the memory itself)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RamBlockDescriptor {
    /// Stable identifier of the region (e.g. "pc.ram")
    pub id: String,
    /// Offset of the region in the guest RAM address space
    pub start_offset: u64,
    /// Region size in bytes
    pub total_size: u64,
    /// Page size in bytes
    pub page_size: u32,
}

impl RamBlockDescriptor {
    /// Validate the descriptor's id, page size and size alignment
    pub fn validate(&self) -> BlockResult<()> {
        if self.id.is_empty() {
            return Err(BlockError::EmptyId);
        }
        if self.id.len() > MAX_BLOCK_ID_LEN {
            return Err(BlockError::IdTooLong {
                len: self.id.len(),
                max: MAX_BLOCK_ID_LEN,
            });
        }
        if !is_valid_page_size(self.page_size) {
            return Err(BlockError::InvalidPageSize(self.page_size));
        }
        if self.total_size % self.page_size as u64 != 0 {
            return Err(BlockError::PartialPage {
                total_size: self.total_size,
                page_size: self.page_size,
            });
        }
        let pages = self.total_size / self.page_size as u64;
        if pages > u32::MAX as u64 {
            return Err(BlockError::TooManyPages { pages });
        }
        Ok(())
    }

    /// Number of pages in the region
    pub fn page_count(&self) -> u32 {
        (self.total_size / self.page_size as u64) as u32
    }
}

/// A contiguous guest-memory region registered for snapshotting
///
/// Cloning is cheap: the memory is shared, never copied.
#[derive(Clone)]
pub struct RamBlock {
    descriptor: RamBlockDescriptor,
    memory: Arc<dyn HostMemory>,
}

impl RamBlock {
    /// Describe a region
    ///
    /// Fails if the id is empty or too long, the page size is unsupported, or
    /// the region is not a whole number of pages.
    pub fn new(
        id: impl Into<String>,
        start_offset: u64,
        page_size: u32,
        memory: Arc<dyn HostMemory>,
    ) -> BlockResult<Self> {
        let descriptor = RamBlockDescriptor {
            id: id.into(),
            start_offset,
            total_size: memory.as_bytes().len() as u64,
            page_size,
        };
        descriptor.validate()?;
        Ok(RamBlock { descriptor, memory })
    }

    /// Region identifier
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Offset of the region in the guest RAM address space
    pub fn start_offset(&self) -> u64 {
        self.descriptor.start_offset
    }

    /// Region size in bytes
    pub fn total_size(&self) -> u64 {
        self.descriptor.total_size
    }

    /// Page size in bytes
    pub fn page_size(&self) -> u32 {
        self.descriptor.page_size
    }

    /// Number of pages in the region
    pub fn page_count(&self) -> u32 {
        self.descriptor.page_count()
    }

    /// Persisted description of this block
    pub fn descriptor(&self) -> &RamBlockDescriptor {
        &self.descriptor
    }

    /// All bytes of the region
    pub fn bytes(&self) -> &[u8] {
        self.memory.as_bytes()
    }

    /// Bytes of page `index`, or `None` past the end of the region
    pub fn page(&self, index: u32) -> Option<&[u8]> {
        if index >= self.page_count() {
            return None;
        }
        let page_size = self.page_size() as usize;
        let start = index as usize * page_size;
        self.bytes().get(start..start + page_size)
    }
}

impl fmt::Debug for RamBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RamBlock")
            .field("id", &self.descriptor.id)
            .field("start_offset", &self.descriptor.start_offset)
            .field("total_size", &self.descriptor.total_size)
            .field("page_size", &self.descriptor.page_size)
            .finish()
    }
}
