//! Identity codec (no transformation).
//!
//! Used when a save does not request compression: page bytes are stored
//! exactly as they appear in guest memory.

use super::traits::{CodecError, PageCodec};

/// Identity codec - no transformation.
///
/// # Example
///
/// ```
/// use ramsnap_durability::codec::{IdentityCodec, PageCodec};
///
/// let codec = IdentityCodec;
/// let data = b"hello world";
///
/// let mut encoded = [0u8; 11];
/// let n = codec.compress_into(data, &mut encoded).unwrap();
/// assert_eq!(&encoded[..n], data);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl PageCodec for IdentityCodec {
    fn compress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        copy_into(src, dst)
    }

    fn decompress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        copy_into(src, dst)
    }

    fn max_compressed_size(&self, len: usize) -> usize {
        len
    }

    fn codec_id(&self) -> &str {
        "identity"
    }
}

fn copy_into(src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
    if dst.len() < src.len() {
        return Err(CodecError::BufferTooSmall {
            needed: src.len(),
            available: dst.len(),
        });
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(src.len())
}
