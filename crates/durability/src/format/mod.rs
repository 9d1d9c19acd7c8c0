//! Binary on-disk format of a RAM snapshot file
//!
//! ```text
//! +------------------+ 0
//! | index offset     | u64 LE (0 until a save publishes its index)
//! +------------------+ 8
//! | page payloads    | raw or compressed pages, located by the index
//! | (and gaps)       |
//! +------------------+ index offset
//! | FileIndex        | see [`index`]
//! +------------------+ EOF
//! ```
//!
//! The offset slot is written last. Until it changes, the file reads exactly
//! as it did before the save started.

pub mod index;

pub use index::{
    FileIndex, IndexBlock, IndexError, IndexFlags, PageEntry, PageLocation, FILE_HEADER_SIZE,
    INDEX_FORMAT_VERSION, INDEX_HEADER_SIZE, INDEX_MAGIC, INDEX_TRAILER_SIZE,
};

use std::io::{self, Read, Seek, SeekFrom, Write};

/// Read the index offset stored in the first eight bytes of the file
pub fn read_index_offset<R: Read + Seek>(reader: &mut R) -> io::Result<u64> {
    let mut slot = [0u8; FILE_HEADER_SIZE as usize];
    reader.seek(SeekFrom::Start(0))?;
    reader.read_exact(&mut slot)?;
    Ok(u64::from_le_bytes(slot))
}

/// Store `offset` in the first eight bytes of the file
pub fn write_index_offset<W: Write + Seek>(writer: &mut W, offset: u64) -> io::Result<()> {
    writer.seek(SeekFrom::Start(0))?;
    writer.write_all(&offset.to_le_bytes())
}
