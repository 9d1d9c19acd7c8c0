//! Page codec abstraction.
//!
//! Stored pages go through a codec on their way to and from disk. A save
//! without compression uses `IdentityCodec`; a compressed save uses
//! `ZstdCodec`. The index records which of the two was used through its
//! `COMPRESSED_PAGES` flag, so a loader picks the codec with
//! [`codec_for_flags`].
//!
//! # Usage
//!
//! ```ignore
//! use ramsnap_durability::codec::{PageCodec, ZstdCodec};
//!
//! let codec = ZstdCodec::default();
//! let mut buf = vec![0u8; codec.max_compressed_size(page.len())];
//! let n = codec.compress_into(&page, &mut buf)?;
//! ```

mod identity;
mod traits;
mod zstd_codec;

pub use zstd_codec::{ZstdCodec, DEFAULT_ZSTD_LEVEL};
pub use identity::IdentityCodec;
pub use traits::{CodecError, PageCodec};

use crate::format::IndexFlags;

/// Get the codec that decodes pages of an index with the given flags.
pub fn codec_for_flags(flags: IndexFlags) -> Box<dyn PageCodec> {
    if flags.compressed_pages() {
        Box::new(ZstdCodec::default())
    } else {
        Box::new(IdentityCodec)
    }
}
