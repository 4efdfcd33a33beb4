//! Core data model: record references, key schemas, and the persisted
//! per-table state header (spec.md §3).

/// CRC32 checksum helpers shared by the index and data files.
pub mod checksum;

mod collation;
mod keydef;
mod state;

pub use collation::{BinaryCollation, CaseFoldCollation, Collation, Utf8CiCollation};
pub use keydef::{
    KeyDef, KeyDefBuilder, KeySegment, SegFlags, SegType, BINARY_PACK_KEY, BLOB_PART,
    NULL_PART, PACK_KEY, REVERSE_SORT, SPACE_PACK, VAR_LENGTH_PART,
};
pub use state::StateInfo;

/// Valid on-disk page sizes (spec.md §6): `{1024,2048,4096,8192,16384}`.
pub const VALID_BLOCK_LENGTHS: [u32; 5] = [1024, 2048, 4096, 8192, 16384];

/// Minimum addressable key block length; child pointers are stored as this
/// many bytes worth of `block_length` units (spec.md §6).
pub const MIN_KEY_BLOCK_LENGTH: u32 = 1024;

/// Opaque, fixed-width identifier for a record in the external data file
/// (spec.md §3). 1 to 8 bytes, chosen at table-creation time. The all-zero
/// value is the sentinel "absent" reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecRef(pub u64);

impl RecRef {
    /// Sentinel denoting "absent" (spec.md §3).
    pub const ABSENT: RecRef = RecRef(0);

    /// True when this reference is the absent sentinel.
    pub fn is_absent(self) -> bool {
        self == Self::ABSENT
    }

    /// Encode into exactly `width` big-endian bytes (1..=8).
    pub fn encode(self, width: usize, out: &mut Vec<u8>) {
        debug_assert!((1..=8).contains(&width));
        let bytes = self.0.to_be_bytes();
        out.extend_from_slice(&bytes[8 - width..]);
    }

    /// Decode from exactly `width` big-endian bytes.
    pub fn decode(bytes: &[u8], width: usize) -> crate::error::Result<Self> {
        if bytes.len() < width {
            return Err(crate::error::PackTreeError::Corruption(
                "RecRef truncated in key suffix",
            ));
        }
        let mut buf = [0u8; 8];
        buf[8 - width..].copy_from_slice(&bytes[..width]);
        Ok(RecRef(u64::from_be_bytes(buf)))
    }
}

/// Identifier for one key page within an index file's page arena.
///
/// Pages are modeled as owned byte buffers addressed by an arena + index
/// rather than raw byte offsets (spec.md §9 REDESIGN FLAGS).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageId(pub u32);

impl PageId {
    /// Sentinel for "no page" (an empty tree's absent root, or a leaf with
    /// no sibling).
    pub const NONE: PageId = PageId(u32::MAX);

    /// True when this is the `NONE` sentinel.
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// Tagged discriminant for a full-text leaf's 4-byte tail field
/// (spec.md §3, §4.5, §9 REDESIGN FLAGS): either a positive weight or a
/// negative subkey count pointing at an FT2 subtree root.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LeafTail {
    /// The word occurs in exactly one document, with this relevance weight.
    Weight(f32),
    /// The word occurs in `count` documents; `root` is the FT2 subtree page
    /// holding their `RecRef`s.
    SubtreeRef {
        /// Number of documents indexed under this word.
        count: u32,
        /// Root page of the FT2 subtree.
        root: PageId,
    },
}

impl LeafTail {
    /// Decode the 4-byte tail plus the following `RecRef` suffix width. For
    /// `SubtreeRef` the trailing bytes hold the FT2 root page index instead
    /// of a `RecRef`.
    pub fn decode(tail: &[u8; 4], recref_field: &[u8]) -> crate::error::Result<(Self, RecRef)> {
        let as_i32 = i32::from_be_bytes(*tail);
        if as_i32 < 0 {
            let count = (-as_i32) as u32;
            let root = RecRef::decode(recref_field, recref_field.len())?;
            Ok((
                LeafTail::SubtreeRef {
                    count,
                    root: PageId(root.0 as u32),
                },
                RecRef::ABSENT,
            ))
        } else {
            let weight = f32::from_be_bytes(*tail);
            let recref = RecRef::decode(recref_field, recref_field.len())?;
            Ok((LeafTail::Weight(weight), recref))
        }
    }

    /// Encode the 4-byte tail discriminated by sign, per spec.md §6.
    pub fn encode(&self) -> [u8; 4] {
        match self {
            LeafTail::Weight(w) => w.to_be_bytes(),
            LeafTail::SubtreeRef { count, .. } => (-(*count as i32)).to_be_bytes(),
        }
    }
}
