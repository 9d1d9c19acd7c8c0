//! Save option flags

/// Options requested for a save
///
/// A small bitmask with named predicates. Combine flags with
/// [`SaveFlags::union`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SaveFlags(u8);

impl SaveFlags {
    /// Synchronous, uncompressed
    pub const NONE: SaveFlags = SaveFlags(0);
    /// Hash and write on background threads
    pub const ASYNC: SaveFlags = SaveFlags(0x1);
    /// Store changed pages compressed
    pub const COMPRESS: SaveFlags = SaveFlags(0x4);

    /// Both sets of flags combined
    pub const fn union(self, other: SaveFlags) -> SaveFlags {
        SaveFlags(self.0 | other.0)
    }

    /// `self` without the flags in `other`
    pub const fn without(self, other: SaveFlags) -> SaveFlags {
        SaveFlags(self.0 & !other.0)
    }

    /// Background threads requested
    pub const fn has_async(self) -> bool {
        self.0 & Self::ASYNC.0 != 0
    }

    /// Compression requested
    pub const fn has_compress(self) -> bool {
        self.0 & Self::COMPRESS.0 != 0
    }
}
