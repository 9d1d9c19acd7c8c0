//! Page codec trait definitions.

/// Page codec trait.
///
/// Every stored page passes through a codec exactly once on save and once
/// on load. Pages are always encoded on their own; a codec never carries
/// state from one page to the next.
///
/// # Thread Safety
///
/// Codecs must be `Send + Sync`: hashing workers compress different pages
/// concurrently, each into its own destination buffer.
pub trait PageCodec: Send + Sync {
    /// Encode `src` into `dst`, returning the number of bytes produced.
    ///
    /// `dst` must hold at least `max_compressed_size(src.len())` bytes.
    fn compress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError>;

    /// Decode `src` into `dst`, returning the number of bytes produced.
    fn decompress_into(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError>;

    /// Worst-case encoded size for an input of `len` bytes.
    fn max_compressed_size(&self, len: usize) -> usize;

    /// Unique codec identifier, used in diagnostics.
    fn codec_id(&self) -> &str;
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Encoding failed.
    #[error("Encode error (codec={codec_id}, data_len={data_len}): {detail}")]
    EncodeError {
        /// Human-readable error description
        detail: String,
        /// Codec ID that attempted the encode
        codec_id: String,
        /// Length of the input
        data_len: usize,
    },

    /// Decoding failed (e.g., corrupt payload, wrong codec).
    ///
    /// Carries the codec identity and data length so callers can
    /// distinguish a wrong-codec error from data corruption.
    #[error("Decode error (codec={codec_id}, data_len={data_len}): {detail}")]
    DecodeError {
        /// Human-readable error description
        detail: String,
        /// Codec ID that attempted the decode
        codec_id: String,
        /// Length of the data that failed to decode
        data_len: usize,
    },

    /// Destination buffer is smaller than the codec requires.
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },
}

impl CodecError {
    /// Create an encode error with full diagnostic context.
    pub fn encode(detail: impl Into<String>, codec_id: impl Into<String>, data_len: usize) -> Self {
        CodecError::EncodeError {
            detail: detail.into(),
            codec_id: codec_id.into(),
            data_len,
        }
    }

    /// Create a decode error with full diagnostic context.
    pub fn decode(detail: impl Into<String>, codec_id: impl Into<String>, data_len: usize) -> Self {
        CodecError::DecodeError {
            detail: detail.into(),
            codec_id: codec_id.into(),
            data_len,
        }
    }
}
