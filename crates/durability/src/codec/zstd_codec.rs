//! Zstandard page codec.
//!
//! Uses the zstd bulk API so each page becomes one self-contained frame.

use super::traits::{CodecError, PageCodec};

/// Default compression level for page payloads.
///
/// Pages are small and saves happen on every VM pause, so speed wins over
/// ratio here.
pub const DEFAULT_ZSTD_LEVEL: i32 = 1;

/// Zstandard codec with a fixed compression level.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    /// Create a codec with the given compression level.
    pub fn new(level: i32) -> Self {
        ZstdCodec { level }
    }

    /// Compression level in use.
    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new(DEFAULT_ZSTD_LEVEL)
    }
}

impl PageCodec for ZstdCodec {
    fn compress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        let needed = self.max_compressed_size(src.len());
        if dst.len() < needed {
            return Err(CodecError::BufferTooSmall {
                needed,
                available: dst.len(),
            });
        }
        zstd::bulk::compress_to_buffer(src, dst, self.level)
            .map_err(|e| CodecError::encode(e.to_string(), self.codec_id(), src.len()))
    }

    fn decompress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        zstd::bulk::decompress_to_buffer(src, dst)
            .map_err(|e| CodecError::decode(e.to_string(), self.codec_id(), src.len()))
    }

    fn max_compressed_size(&self, len: usize) -> usize {
        zstd::zstd_safe::compress_bound(len)
    }

    fn codec_id(&self) -> &str {
        "zstd"
    }
}
