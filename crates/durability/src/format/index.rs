//! Snapshot index format
//!
//! The index is the manifest of a RAM snapshot: for every registered block,
//! one entry per page saying where the page's bytes live or that the page is
//! all zeroes. It is written once, as the last step of a save.
//!
//! # Encoding
//!
//! ```text
//! +--------------------+ index offset
//! | magic "RIDX"       | 4 bytes
//! | version            | u32
//! | body length        | u64
//! +--------------------+
//! | flags              | u32
//! | total pages        | u64
//! | block count        | u32
//! | blocks...          |
//! +--------------------+
//! | CRC32 of body      | u32
//! +--------------------+
//!
//! block: u16 id_len | id | u64 start_offset | u64 total_size
//!        | u32 page_size | u32 page_count | pages...
//! page:  u32 size_on_disk | u8 bits (0x1 same, 0x2 hash_filled)
//!        | u64 file_pos (only when size_on_disk > 0)
//!        | [u8; 16] hash (only when hash_filled)
//! ```
//!
//! All integers are little-endian.

use byteorder::{LittleEndian, ReadBytesExt};
use ramsnap_core::{BlockError, PageHash, RamBlockDescriptor, PAGE_HASH_SIZE};
use std::io::{Cursor, Read};

use crate::codec::codec_for_flags;

/// Magic bytes at the start of every index: "RIDX"
pub const INDEX_MAGIC: [u8; 4] = *b"RIDX";

/// Index format version
pub const INDEX_FORMAT_VERSION: u32 = 2;

/// Size of the fixed index header (magic, version, body length)
pub const INDEX_HEADER_SIZE: usize = 16;

/// Size of the CRC trailer following the index body
pub const INDEX_TRAILER_SIZE: usize = 4;

/// Size of the index-offset slot at the start of the file
pub const FILE_HEADER_SIZE: u64 = 8;

const PAGE_BIT_SAME: u8 = 0x1;
const PAGE_BIT_HASH_FILLED: u8 = 0x2;

/// Index-wide flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexFlags(u32);

impl IndexFlags {
    /// No flags set
    pub const EMPTY: IndexFlags = IndexFlags(0);
    /// Stored pages are zstd-compressed
    pub const COMPRESSED_PAGES: IndexFlags = IndexFlags(0x1);

    const KNOWN_BITS: u32 = 0x1;

    /// Raw bit representation
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, rejecting unknown bits
    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::KNOWN_BITS != 0 {
            return None;
        }
        Some(IndexFlags(bits))
    }

    /// Whether stored pages are compressed
    pub fn compressed_pages(self) -> bool {
        self.0 & Self::COMPRESSED_PAGES.0 != 0
    }

    /// Both sets of flags combined
    pub fn union(self, other: IndexFlags) -> IndexFlags {
        IndexFlags(self.0 | other.0)
    }
}

/// Location of a stored page payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLocation {
    /// Absolute file offset of the payload
    pub offset: u64,
    /// Payload size in bytes (0 for an all-zero page)
    pub size: u32,
}

impl PageLocation {
    /// One past the last payload byte
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }
}

/// Index entry for a single page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageEntry {
    /// Payload size on disk; 0 means the page is all zeroes and not stored
    pub size_on_disk: u32,
    /// Page is unchanged from the prior snapshot and reuses its payload
    pub same: bool,
    /// `hash` holds a valid digest
    pub hash_filled: bool,
    /// Absolute payload offset; meaningless when `size_on_disk == 0`
    pub file_pos: u64,
    /// Digest of the uncompressed page content
    pub hash: PageHash,
}

impl PageEntry {
    /// Page is all zeroes
    pub fn zeroed(&self) -> bool {
        self.size_on_disk == 0
    }

    /// Valid digest, if one was recorded
    pub fn hash(&self) -> Option<PageHash> {
        self.hash_filled.then_some(self.hash)
    }

    /// Payload location as stored in the index
    pub fn location(&self) -> PageLocation {
        if self.zeroed() {
            PageLocation { offset: 0, size: 0 }
        } else {
            PageLocation {
                offset: self.file_pos,
                size: self.size_on_disk,
            }
        }
    }
}

/// Index entries of one RAM block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    /// The block as it was registered
    pub descriptor: RamBlockDescriptor,
    /// One entry per page, `pages[i]` describing bytes `i * page_size..`
    pub pages: Vec<PageEntry>,
}

/// The persisted snapshot manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIndex {
    /// Absolute offset at which the index is stored
    pub start_pos_in_file: u64,
    /// Format version
    pub version: u32,
    /// Index-wide flags
    pub flags: IndexFlags,
    /// Sum of the page counts of all blocks
    pub total_pages: u64,
    /// Blocks in registration order
    pub blocks: Vec<IndexBlock>,
}

impl Default for FileIndex {
    fn default() -> Self {
        Self::new(IndexFlags::EMPTY)
    }
}

impl FileIndex {
    /// Create an empty index
    pub fn new(flags: IndexFlags) -> Self {
        FileIndex {
            start_pos_in_file: 0,
            version: INDEX_FORMAT_VERSION,
            flags,
            total_pages: 0,
            blocks: Vec::new(),
        }
    }

    /// Append a block whose pages all start out as zero pages
    pub fn add_block(&mut self, descriptor: RamBlockDescriptor) {
        let count = descriptor.page_count() as usize;
        self.total_pages += count as u64;
        self.blocks.push(IndexBlock {
            descriptor,
            pages: vec![PageEntry::default(); count],
        });
    }

    /// Drop all blocks
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.total_pages = 0;
        self.start_pos_in_file = 0;
    }

    /// Entry for `(block_index, page_index)`
    pub fn page(&self, block_index: usize, page_index: u32) -> Option<&PageEntry> {
        self.blocks
            .get(block_index)
            .and_then(|b| b.pages.get(page_index as usize))
    }

    /// Mutable entry for `(block_index, page_index)`
    pub fn page_mut(&mut self, block_index: usize, page_index: u32) -> Option<&mut PageEntry> {
        self.blocks
            .get_mut(block_index)
            .and_then(|b| b.pages.get_mut(page_index as usize))
    }

    /// Index of the block with the given id
    pub fn find_block(&self, id: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.descriptor.id == id)
    }

    /// Every `(block_index, page_index, entry)` in registration order
    pub fn iter_pages(&self) -> impl Iterator<Item = (usize, u32, &PageEntry)> + '_ {
        self.blocks.iter().enumerate().flat_map(|(bi, block)| {
            block
                .pages
                .iter()
                .enumerate()
                .map(move |(pi, page)| (bi, pi as u32, page))
        })
    }

    /// Locations of all stored (non-zero) pages, sorted by offset
    pub fn stored_ranges(&self) -> Vec<PageLocation> {
        let mut ranges: Vec<PageLocation> = self
            .iter_pages()
            .filter(|(_, _, p)| !p.zeroed())
            .map(|(_, _, p)| p.location())
            .collect();
        ranges.sort_by_key(|r| r.offset);
        ranges
    }

    /// Serialize header, body and CRC trailer
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64 + self.total_pages as usize * 13);
        body.extend_from_slice(&self.flags.bits().to_le_bytes());
        body.extend_from_slice(&self.total_pages.to_le_bytes());
        body.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());

        for block in &self.blocks {
            let d = &block.descriptor;
            body.extend_from_slice(&(d.id.len() as u16).to_le_bytes());
            body.extend_from_slice(d.id.as_bytes());
            body.extend_from_slice(&d.start_offset.to_le_bytes());
            body.extend_from_slice(&d.total_size.to_le_bytes());
            body.extend_from_slice(&d.page_size.to_le_bytes());
            body.extend_from_slice(&(block.pages.len() as u32).to_le_bytes());

            for page in &block.pages {
                body.extend_from_slice(&page.size_on_disk.to_le_bytes());
                let mut bits = 0u8;
                if page.same {
                    bits |= PAGE_BIT_SAME;
                }
                if page.hash_filled {
                    bits |= PAGE_BIT_HASH_FILLED;
                }
                body.push(bits);
                if !page.zeroed() {
                    body.extend_from_slice(&page.file_pos.to_le_bytes());
                }
                if page.hash_filled {
                    body.extend_from_slice(page.hash.as_bytes());
                }
            }
        }

        let mut out = Vec::with_capacity(INDEX_HEADER_SIZE + body.len() + INDEX_TRAILER_SIZE);
        out.extend_from_slice(&INDEX_MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&(crc32fast::hash(&body)).to_le_bytes());
        out
    }

    /// Parse the fixed header, returning the body length
    pub fn decode_header(bytes: &[u8; INDEX_HEADER_SIZE]) -> Result<u64, IndexError> {
        let magic: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != INDEX_MAGIC {
            return Err(IndexError::InvalidMagic {
                expected: INDEX_MAGIC,
                actual: magic,
            });
        }
        let mut cursor = Cursor::new(&bytes[4..]);
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != INDEX_FORMAT_VERSION {
            return Err(IndexError::UnsupportedVersion {
                version,
                supported: INDEX_FORMAT_VERSION,
            });
        }
        Ok(cursor.read_u64::<LittleEndian>()?)
    }

    /// Decode and validate an index body followed by its CRC trailer
    ///
    /// `start_pos` is the file offset the index was read from. Stored pages
    /// must lie in `[FILE_HEADER_SIZE, start_pos)` and must not overlap.
    pub fn decode_body(body_and_crc: &[u8], start_pos: u64) -> Result<FileIndex, IndexError> {
        if body_and_crc.len() < INDEX_TRAILER_SIZE {
            return Err(IndexError::Truncated);
        }
        let (body, trailer) = body_and_crc.split_at(body_and_crc.len() - INDEX_TRAILER_SIZE);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(IndexError::CrcMismatch { stored, computed });
        }

        let mut cursor = Cursor::new(body);
        let flag_bits = cursor.read_u32::<LittleEndian>()?;
        let flags = IndexFlags::from_bits(flag_bits).ok_or(IndexError::UnknownFlags(flag_bits))?;
        let total_pages = cursor.read_u64::<LittleEndian>()?;
        let block_count = cursor.read_u32::<LittleEndian>()?;

        let codec = codec_for_flags(flags);
        let mut blocks = Vec::new();
        let mut counted_pages = 0u64;

        for block_index in 0..block_count as usize {
            let id_len = cursor.read_u16::<LittleEndian>()? as usize;
            let mut id_bytes = vec![0u8; id_len];
            cursor.read_exact(&mut id_bytes)?;
            let id = String::from_utf8(id_bytes).map_err(|_| IndexError::InvalidBlockId { block_index })?;

            let descriptor = RamBlockDescriptor {
                id,
                start_offset: cursor.read_u64::<LittleEndian>()?,
                total_size: cursor.read_u64::<LittleEndian>()?,
                page_size: cursor.read_u32::<LittleEndian>()?,
            };
            descriptor
                .validate()
                .map_err(|source| IndexError::InvalidBlock { block_index, source })?;

            let page_count = cursor.read_u32::<LittleEndian>()?;
            if page_count != descriptor.page_count() {
                return Err(IndexError::PageCountMismatch {
                    block_index,
                    expected: descriptor.page_count(),
                    actual: page_count,
                });
            }
            // Every page entry takes at least 5 bytes; reject counts the body cannot hold
            let remaining = body.len() as u64 - cursor.position();
            if page_count as u64 * 5 > remaining {
                return Err(IndexError::Truncated);
            }

            let max_size = codec.max_compressed_size(descriptor.page_size as usize) as u64;
            let mut pages = Vec::with_capacity(page_count as usize);
            for page_index in 0..page_count {
                let size_on_disk = cursor.read_u32::<LittleEndian>()?;
                let bits = cursor.read_u8()?;
                if bits & !(PAGE_BIT_SAME | PAGE_BIT_HASH_FILLED) != 0 {
                    return Err(IndexError::InvalidPage {
                        block_index,
                        page_index,
                        reason: format!("unknown page bits {:#x}", bits),
                    });
                }
                let file_pos = if size_on_disk > 0 {
                    cursor.read_u64::<LittleEndian>()?
                } else {
                    0
                };
                let mut hash = PageHash::default();
                if bits & PAGE_BIT_HASH_FILLED != 0 {
                    let mut raw = [0u8; PAGE_HASH_SIZE];
                    cursor.read_exact(&mut raw)?;
                    hash = PageHash(raw);
                }

                if size_on_disk as u64 > max_size {
                    return Err(IndexError::InvalidPage {
                        block_index,
                        page_index,
                        reason: format!("size {} exceeds bound {}", size_on_disk, max_size),
                    });
                }
                if size_on_disk > 0
                    && (file_pos < FILE_HEADER_SIZE
                        || file_pos
                            .checked_add(size_on_disk as u64)
                            .map_or(true, |end| end > start_pos))
                {
                    return Err(IndexError::InvalidPage {
                        block_index,
                        page_index,
                        reason: format!(
                            "payload {}+{} outside payload region [{}, {})",
                            file_pos, size_on_disk, FILE_HEADER_SIZE, start_pos
                        ),
                    });
                }

                pages.push(PageEntry {
                    size_on_disk,
                    same: bits & PAGE_BIT_SAME != 0,
                    hash_filled: bits & PAGE_BIT_HASH_FILLED != 0,
                    file_pos,
                    hash,
                });
            }

            counted_pages += page_count as u64;
            blocks.push(IndexBlock { descriptor, pages });
        }

        if cursor.position() != body.len() as u64 {
            return Err(IndexError::TrailingBytes {
                count: body.len() as u64 - cursor.position(),
            });
        }
        if counted_pages != total_pages {
            return Err(IndexError::TotalPagesMismatch {
                expected: total_pages,
                actual: counted_pages,
            });
        }

        let index = FileIndex {
            start_pos_in_file: start_pos,
            version: INDEX_FORMAT_VERSION,
            flags,
            total_pages,
            blocks,
        };

        let ranges = index.stored_ranges();
        for pair in ranges.windows(2) {
            if pair[0].end() > pair[1].offset {
                return Err(IndexError::OverlappingPages {
                    first: pair[0].offset,
                    second: pair[1].offset,
                });
            }
        }

        Ok(index)
    }
}

/// Errors found while decoding an index
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Index ends before all declared fields were read
    #[error("Index truncated")]
    Truncated,

    /// Wrong magic bytes
    #[error("Invalid index magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        /// Expected magic bytes
        expected: [u8; 4],
        /// Actual magic bytes
        actual: [u8; 4],
    },

    /// Version this build does not understand
    #[error("Unsupported index version {version}, expected {supported}")]
    UnsupportedVersion {
        /// Version found in the file
        version: u32,
        /// Version this build writes and reads
        supported: u32,
    },

    /// Body checksum does not match
    #[error("Index CRC mismatch: stored {stored:#x}, computed {computed:#x}")]
    CrcMismatch {
        /// CRC stored in the trailer
        stored: u32,
        /// CRC computed over the body
        computed: u32,
    },

    /// Flag bits this build does not understand
    #[error("Unknown index flags {0:#x}")]
    UnknownFlags(u32),

    /// Block id is not UTF-8
    #[error("Block {block_index} has a non-UTF-8 id")]
    InvalidBlockId {
        /// Position of the block in the index
        block_index: usize,
    },

    /// Block descriptor fails validation
    #[error("Block {block_index} is invalid: {source}")]
    InvalidBlock {
        /// Position of the block in the index
        block_index: usize,
        /// Validation failure
        source: BlockError,
    },

    /// Declared page count disagrees with the block size
    #[error("Block {block_index} lists {actual} pages, expected {expected}")]
    PageCountMismatch {
        /// Position of the block in the index
        block_index: usize,
        /// Count implied by size and page size
        expected: u32,
        /// Count found in the index
        actual: u32,
    },

    /// Page entry fails validation
    #[error("Page {page_index} of block {block_index} is invalid: {reason}")]
    InvalidPage {
        /// Position of the block in the index
        block_index: usize,
        /// Page within the block
        page_index: u32,
        /// What is wrong
        reason: String,
    },

    /// Two stored pages share bytes
    #[error("Stored pages at {first} and {second} overlap")]
    OverlappingPages {
        /// Offset of the earlier payload
        first: u64,
        /// Offset of the later payload
        second: u64,
    },

    /// `total_pages` disagrees with the per-block counts
    #[error("Index declares {expected} pages, blocks hold {actual}")]
    TotalPagesMismatch {
        /// Declared total
        expected: u64,
        /// Sum over blocks
        actual: u64,
    },

    /// Bytes left over after the last block
    #[error("{count} unexpected bytes after the last block")]
    TrailingBytes {
        /// Number of extra bytes
        count: u64,
    },
}

impl From<std::io::Error> for IndexError {
    fn from(_: std::io::Error) -> Self {
        // Decoding reads from an in-memory cursor; the only possible failure is running out of bytes
        IndexError::Truncated
    }
}
