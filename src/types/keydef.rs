//! `KeyDef` / `KeySegment`: the schema of one index (spec.md §3).

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::error::{PackTreeError, Result};
use crate::types::collation::{BinaryCollation, Collation};
use crate::types::RecRef;

bitflags::bitflags! {
    /// Per-segment packing flags (spec.md §3, §4.1).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct SegFlags: u16 {
        /// Precede the value with a 1- or 3-byte length (space-stripped text).
        const SPACE_PACK      = 0b0000_0001;
        /// This segment is the variable-length part of a composite key.
        const VAR_LENGTH_PART = 0b0000_0010;
        /// This segment stores a prefix of a BLOB/TEXT column.
        const BLOB_PART       = 0b0000_0100;
        /// Prefix-compress this segment against the previous key's segment.
        const PACK_KEY        = 0b0000_1000;
        /// Like `PACK_KEY` but for binary (non-collated) segments.
        const BINARY_PACK_KEY = 0b0001_0000;
        /// A 1-byte null marker precedes the segment; 0 means absent.
        const NULL_PART       = 0b0010_0000;
        /// Invert comparison order for this segment only.
        const REVERSE_SORT    = 0b0100_0000;
    }
}

pub use SegFlags as _SegFlagsReexport; // keep doc item grouping stable
/// Re-exported flag constants for ergonomic `SegFlags::SPACE_PACK`-free use.
pub const SPACE_PACK: SegFlags = SegFlags::SPACE_PACK;
pub const VAR_LENGTH_PART: SegFlags = SegFlags::VAR_LENGTH_PART;
pub const BLOB_PART: SegFlags = SegFlags::BLOB_PART;
pub const PACK_KEY: SegFlags = SegFlags::PACK_KEY;
pub const BINARY_PACK_KEY: SegFlags = SegFlags::BINARY_PACK_KEY;
pub const NULL_PART: SegFlags = SegFlags::NULL_PART;
pub const REVERSE_SORT: SegFlags = SegFlags::REVERSE_SORT;

/// Segment type tag (spec.md §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegType {
    /// Fixed-width text, space-padded.
    Text,
    /// Variable-length text (`VARCHAR`-like).
    VarText,
    /// Opaque fixed-width binary.
    Binary,
    /// Fixed-width signed integer, 1/2/3/4/8 bytes.
    Int { width: u8 },
    /// IEEE-754 single precision float.
    Float,
    /// IEEE-754 double precision float.
    Double,
    /// Prefix of a BLOB column.
    BlobPart,
}

impl SegType {
    /// Fixed on-disk width, if this segment type has one independent of
    /// `declared_len` (ints/float/double are always exactly this wide).
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            SegType::Int { width } => Some(*width as usize),
            SegType::Float => Some(4),
            SegType::Double => Some(8),
            _ => None,
        }
    }
}

/// One segment of a `KeyDef` (spec.md §3).
#[derive(Clone, Debug)]
pub struct KeySegment {
    pub seg_type: SegType,
    /// Declared byte length (for `Text`/`Binary`; ignored for fixed-width
    /// numeric types whose width comes from `seg_type`).
    pub declared_len: usize,
    pub nullable: bool,
    pub flags: SegFlags,
    pub collation: Arc<dyn Collation>,
}

impl KeySegment {
    /// Construct a fixed-width binary segment with no packing (the common
    /// case for `RecRef`-adjacent integer keys).
    pub fn fixed_binary(len: usize) -> Self {
        Self {
            seg_type: SegType::Binary,
            declared_len: len,
            nullable: false,
            flags: SegFlags::empty(),
            collation: Arc::new(BinaryCollation),
        }
    }

    /// Construct a fixed-width signed integer segment.
    pub fn int(width: u8) -> Self {
        Self {
            seg_type: SegType::Int { width },
            declared_len: width as usize,
            nullable: false,
            flags: SegFlags::empty(),
            collation: Arc::new(BinaryCollation),
        }
    }

    /// Construct a variable-length text segment, space-packed, under the
    /// given collation, with `PACK_KEY` prefix-compression enabled.
    pub fn var_text(max_len: usize, collation: Arc<dyn Collation>) -> Self {
        Self {
            seg_type: SegType::VarText,
            declared_len: max_len,
            nullable: false,
            flags: SegFlags::SPACE_PACK | SegFlags::VAR_LENGTH_PART | SegFlags::PACK_KEY,
            collation,
        }
    }

    /// The maximum number of bytes this segment can occupy once encoded,
    /// including its null marker/length prefix (spec.md §4.1 error rule).
    pub fn max_encoded_len(&self) -> usize {
        let mut len = self.declared_len;
        if self.flags.intersects(
            SegFlags::SPACE_PACK | SegFlags::VAR_LENGTH_PART | SegFlags::BLOB_PART,
        ) {
            len += if self.declared_len > 255 { 3 } else { 1 };
        }
        if self.flags.contains(SegFlags::NULL_PART) {
            len += 1;
        }
        len
    }

    /// Compare two already-decoded (unpacked) segment values.
    fn compare_values(&self, a: &[u8], b: &[u8]) -> Ordering {
        let ord = self.collation.compare(a, b);
        if self.flags.contains(SegFlags::REVERSE_SORT) {
            ord.reverse()
        } else {
            ord
        }
    }

    /// Decode one segment's logical value from the front of `buf`, per the
    /// `[null-marker?] [length-bytes?] value-bytes` shape (spec.md §3).
    /// Returns `(value_slice_or_none, bytes_consumed)`.
    pub fn decode_value<'a>(&self, buf: &'a [u8]) -> Result<(Option<&'a [u8]>, usize)> {
        let mut pos = 0usize;
        if self.flags.contains(SegFlags::NULL_PART) {
            if buf.is_empty() {
                return Err(PackTreeError::Corruption("segment null marker truncated"));
            }
            if buf[0] == 0 {
                return Ok((None, 1));
            }
            pos += 1;
        }
        if let Some(width) = self.seg_type.fixed_width() {
            if buf.len() < pos + width {
                return Err(PackTreeError::Corruption("fixed segment truncated"));
            }
            return Ok((Some(&buf[pos..pos + width]), pos + width));
        }
        if self
            .flags
            .intersects(SegFlags::SPACE_PACK | SegFlags::VAR_LENGTH_PART | SegFlags::BLOB_PART)
        {
            let (len, hdr) = decode_len_prefix(&buf[pos..], self.declared_len)?;
            let start = pos + hdr;
            if buf.len() < start + len {
                return Err(PackTreeError::Corruption("variable segment truncated"));
            }
            return Ok((Some(&buf[start..start + len]), start + len));
        }
        if buf.len() < pos + self.declared_len {
            return Err(PackTreeError::Corruption("fixed text segment truncated"));
        }
        Ok((Some(&buf[pos..pos + self.declared_len]), pos + self.declared_len))
    }

    /// Encode one logical value (`None` for SQL NULL) into `out`, per
    /// spec.md §4.1's packing rules table.
    pub fn encode_value(&self, value: Option<&[u8]>, out: &mut Vec<u8>) -> Result<()> {
        if self.flags.contains(SegFlags::NULL_PART) {
            match value {
                None => {
                    out.push(0);
                    return Ok(());
                }
                Some(_) => out.push(1),
            }
        }
        let value = match value {
            Some(v) => v,
            None => {
                return Err(PackTreeError::Invalid(
                    "null value for non-nullable segment",
                ))
            }
        };
        if let Some(width) = self.seg_type.fixed_width() {
            if value.len() != width {
                return Err(PackTreeError::Invalid("fixed segment value wrong width"));
            }
            out.extend_from_slice(value);
            return Ok(());
        }
        if self
            .flags
            .intersects(SegFlags::SPACE_PACK | SegFlags::VAR_LENGTH_PART | SegFlags::BLOB_PART)
        {
            encode_len_prefix(value.len(), self.declared_len, out)?;
            out.extend_from_slice(value);
            return Ok(());
        }
        if value.len() > self.declared_len {
            return Err(PackTreeError::Invalid("fixed text segment too long"));
        }
        out.extend_from_slice(value);
        out.resize(out.len() + (self.declared_len - value.len()), b' ');
        Ok(())
    }
}

/// Length-prefix shape per spec.md §4.1: 1 byte if `max_len <= 255`, else a
/// `0xFF` marker followed by a 2-byte length.
fn encode_len_prefix(len: usize, max_len: usize, out: &mut Vec<u8>) -> Result<()> {
    if max_len <= 255 {
        let len_u8 = u8::try_from(len).map_err(|_| PackTreeError::Invalid("segment too long"))?;
        out.push(len_u8);
    } else {
        out.push(0xFF);
        let len_u16 =
            u16::try_from(len).map_err(|_| PackTreeError::Invalid("segment too long"))?;
        out.extend_from_slice(&len_u16.to_be_bytes());
    }
    Ok(())
}

fn decode_len_prefix(buf: &[u8], max_len: usize) -> Result<(usize, usize)> {
    if buf.is_empty() {
        return Err(PackTreeError::Corruption("length prefix truncated"));
    }
    if max_len <= 255 {
        Ok((buf[0] as usize, 1))
    } else if buf[0] == 0xFF {
        if buf.len() < 3 {
            return Err(PackTreeError::Corruption("3-byte length prefix truncated"));
        }
        let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        Ok((len, 3))
    } else {
        Ok((buf[0] as usize, 1))
    }
}

bitflags::bitflags! {
    /// `KeyDef`-level flags (spec.md §3).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct KeyDefFlags: u16 {
        const UNIQUE   = 0b0000_0001;
        const FULLTEXT = 0b0000_0010;
        const SPATIAL  = 0b0000_0100;
        const AUTO_KEY = 0b0000_1000;
        const NO_SAME  = 0b0001_0000;
    }
}

/// Schema of one index: ordered segments plus flags and page size
/// (spec.md §3). Carries its own `version` counter for the BTree's
/// stale-cursor detection (spec.md §4.2).
#[derive(Debug)]
pub struct KeyDef {
    pub segments: Vec<KeySegment>,
    pub flags: KeyDefFlags,
    pub block_length: u32,
    /// Width in bytes of the `RecRef` suffix carried by every key entry.
    pub recref_width: usize,
    /// Incremented on every write to this index's tree (spec.md §4.2).
    pub version: AtomicU64,
}

impl KeyDef {
    pub fn new(
        segments: Vec<KeySegment>,
        flags: KeyDefFlags,
        block_length: u32,
        recref_width: usize,
    ) -> Result<Self> {
        if !crate::types::VALID_BLOCK_LENGTHS.contains(&block_length) {
            return Err(PackTreeError::Invalid("block_length not a valid page size"));
        }
        if !(1..=8).contains(&recref_width) {
            return Err(PackTreeError::Invalid("recref_width out of range 1..=8"));
        }
        Ok(Self {
            segments,
            flags,
            block_length,
            recref_width,
            version: AtomicU64::new(0),
        })
    }

    pub fn is_unique(&self) -> bool {
        self.flags.contains(KeyDefFlags::UNIQUE)
    }

    pub fn is_fulltext(&self) -> bool {
        self.flags.contains(KeyDefFlags::FULLTEXT)
    }

    pub fn no_same(&self) -> bool {
        self.flags.contains(KeyDefFlags::NO_SAME)
    }

    /// Maximum length any encoded key (segments only, excluding `RecRef`)
    /// can reach (spec.md §4.1 error condition).
    pub fn maxlength(&self) -> usize {
        self.segments.iter().map(|s| s.max_encoded_len()).sum()
    }

    /// Bump the version counter; readers compare against their cached
    /// version to detect invalidation (spec.md §4.2).
    pub fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, AtomicOrdering::SeqCst) + 1
    }

    pub fn current_version(&self) -> u64 {
        self.version.load(AtomicOrdering::SeqCst)
    }

    /// Encode a full logical key (all segments, `None` entries for NULLs)
    /// followed by its `RecRef` suffix.
    pub fn encode(&self, values: &[Option<&[u8]>], recref: RecRef, out: &mut Vec<u8>) -> Result<()> {
        if values.len() != self.segments.len() {
            return Err(PackTreeError::Invalid("value count does not match KeyDef"));
        }
        for (seg, val) in self.segments.iter().zip(values) {
            seg.encode_value(*val, out)?;
        }
        recref.encode(self.recref_width, out);
        Ok(())
    }

    /// Compare two fully-encoded keys (segments + `RecRef` suffix),
    /// segment by segment, tie-breaking on `RecRef` unless `NO_SAME` is
    /// set (spec.md §3 invariant 2).
    pub fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        let mut pa = a;
        let mut pb = b;
        for seg in &self.segments {
            let (va, consumed_a) = seg.decode_value(pa)?;
            let (vb, consumed_b) = seg.decode_value(pb)?;
            let ord = match (va, vb) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(xa), Some(xb)) => seg.compare_values(xa, xb),
            };
            if ord != Ordering::Equal {
                return Ok(ord);
            }
            pa = &pa[consumed_a..];
            pb = &pb[consumed_b..];
        }
        if self.no_same() {
            return Ok(Ordering::Equal);
        }
        let ra = RecRef::decode(pa, self.recref_width)?;
        let rb = RecRef::decode(pb, self.recref_width)?;
        Ok(ra.cmp(&rb))
    }

    /// Split a fully-encoded key into its segment span and trailing
    /// `RecRef` suffix.
    pub fn split_recref<'a>(&self, key: &'a [u8]) -> Result<(&'a [u8], RecRef)> {
        if key.len() < self.recref_width {
            return Err(PackTreeError::Corruption("key shorter than RecRef suffix"));
        }
        let split = key.len() - self.recref_width;
        let recref = RecRef::decode(&key[split..], self.recref_width)?;
        Ok((&key[..split], recref))
    }
}

/// Convenience builder for `KeyDef` (not in spec.md; purely ergonomic).
pub struct KeyDefBuilder {
    segments: Vec<KeySegment>,
    flags: KeyDefFlags,
    block_length: u32,
    recref_width: usize,
}

impl KeyDefBuilder {
    pub fn new(block_length: u32, recref_width: usize) -> Self {
        Self {
            segments: Vec::new(),
            flags: KeyDefFlags::empty(),
            block_length,
            recref_width,
        }
    }

    pub fn segment(mut self, seg: KeySegment) -> Self {
        self.segments.push(seg);
        self
    }

    pub fn unique(mut self) -> Self {
        self.flags |= KeyDefFlags::UNIQUE;
        self
    }

    pub fn no_same(mut self) -> Self {
        self.flags |= KeyDefFlags::NO_SAME;
        self
    }

    pub fn fulltext(mut self) -> Self {
        self.flags |= KeyDefFlags::FULLTEXT;
        self
    }

    pub fn build(self) -> Result<KeyDef> {
        KeyDef::new(self.segments, self.flags, self.block_length, self.recref_width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::collation::BinaryCollation;

    #[test]
    fn fixed_segment_roundtrip() {
        let seg = KeySegment::int(4);
        let mut out = Vec::new();
        seg.encode_value(Some(&42i32.to_be_bytes()), &mut out).unwrap();
        let (val, consumed) = seg.decode_value(&out).unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(val.unwrap(), &42i32.to_be_bytes());
    }

    #[test]
    fn keydef_compare_orders_by_segment_then_recref() {
        let kd = KeyDefBuilder::new(4096, 4)
            .segment(KeySegment::var_text(255, Arc::new(BinaryCollation)))
            .build()
            .unwrap();
        let mut a = Vec::new();
        kd.encode(&[Some(b"apple")], RecRef(1), &mut a).unwrap();
        let mut b = Vec::new();
        kd.encode(&[Some(b"banana")], RecRef(2), &mut b).unwrap();
        assert_eq!(kd.compare_encoded(&a, &b).unwrap(), Ordering::Less);

        let mut c = Vec::new();
        kd.encode(&[Some(b"apple")], RecRef(5), &mut c).unwrap();
        assert_eq!(kd.compare_encoded(&a, &c).unwrap(), Ordering::Less);
    }

    #[test]
    fn maxlength_accounts_for_length_prefix() {
        let seg = KeySegment::var_text(255, Arc::new(BinaryCollation));
        assert_eq!(seg.max_encoded_len(), 256);
    }
}
