//! Whole-page encode/decode helpers built on top of the streaming
//! [`get_key`]/[`pack_key`]/[`store_key`] primitives (spec.md §4.1).
//!
//! `BTree` operates on a page's full entry list at a time (decode, mutate
//! in memory, re-encode sequentially re-applying prefix compression
//! against each predecessor) rather than splicing bytes in place. This
//! keeps the split/rebalance logic in `btree` tractable while still
//! emitting byte-exact prefix/binary-packed pages through `PageCodec`.

use crate::error::{PackTreeError, Result};
use crate::types::{KeyDef, PageId};

use super::{get_key, pack_key, read_header, store_key, write_header, Cursor};

/// One leaf entry: an order-determining key (segments + `RecRef` suffix,
/// comparable via `KeyDef::compare_encoded`) plus an opaque payload tail
/// (e.g. the full-text weight/subkey-count field, spec.md §3).
#[derive(Clone, Debug)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

/// A decoded leaf page.
#[derive(Clone, Debug, Default)]
pub struct LeafPage {
    pub entries: Vec<LeafEntry>,
}

/// A decoded non-leaf page: `n` keys and `n + 1` children (spec.md §3
/// invariant 3 — `child_i` holds keys `< key_i`; `children[n]` holds keys
/// `>= key_{n-1}`). See DESIGN.md for why this interpretation of the
/// "child pointer precedes each key" byte grammar was chosen.
#[derive(Clone, Debug, Default)]
pub struct InternalPage {
    pub keys: Vec<Vec<u8>>,
    pub children: Vec<PageId>,
}

fn decode_leaf_key_only(buf: &[u8], pos: usize, endpos: usize, prev: &[u8], key_def: &KeyDef) -> Result<(Vec<u8>, usize)> {
    let entry = get_key(buf, Cursor(pos), endpos, prev, key_def, false, 0)?;
    Ok((entry.key, entry.next.0 - pos))
}

/// Decode a leaf page's entry list. Each entry's payload directly follows
/// the key bytes up to the next entry's key start (or `endpos`); payload
/// length is recovered by the caller supplying `payload_len`, a function
/// of the index kind (0 for plain indexes, 4 bytes for full-text leaves
/// whose tail precedes the `RecRef`, so in practice FT payload lives
/// *inside* `key_def`'s encoding via a dedicated tail segment handled by
/// `fulltext::index`).
pub fn decode_leaf(page: &[u8], key_def: &KeyDef, payload_len: usize) -> Result<LeafPage> {
    let (used_len, is_non_leaf) = read_header(page)?;
    if is_non_leaf {
        return Err(PackTreeError::Corruption("expected leaf page"));
    }
    let endpos = used_len as usize;
    let mut entries = Vec::new();
    let mut pos = 2usize;
    let mut prev = Vec::new();
    while pos < endpos {
        let (key, consumed) = decode_leaf_key_only(page, pos, endpos, &prev, key_def)?;
        pos += consumed;
        let payload = if payload_len > 0 {
            if pos + payload_len > endpos {
                return Err(PackTreeError::Corruption("leaf payload runs off endpos"));
            }
            let p = page[pos..pos + payload_len].to_vec();
            pos += payload_len;
            p
        } else {
            Vec::new()
        };
        prev = key.clone();
        entries.push(LeafEntry { key, payload });
    }
    Ok(LeafPage { entries })
}

/// Encode a leaf page's entries sequentially, prefix-compressing each
/// against its predecessor. Returns `Err(FileFull)` when the entries do
/// not fit in `block_length` bytes (spec.md §4.2 split trigger).
pub fn encode_leaf(entries: &[LeafEntry], key_def: &KeyDef, block_length: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut prev: Vec<u8> = Vec::new();
    for entry in entries {
        let plan = pack_key(&prev, &entry.key, key_def);
        store_key(&mut body, &plan)?;
        body.extend_from_slice(&entry.payload);
        prev = entry.key.clone();
    }
    let used_len = 2 + body.len();
    if used_len > block_length {
        return Err(PackTreeError::FileFull("leaf page entries exceed block_length"));
    }
    let mut page = vec![0u8; block_length];
    write_header(&mut page, used_len as u16, false);
    page[2..used_len].copy_from_slice(&body);
    Ok(page)
}

/// Decode a non-leaf page per the `n` keys / `n+1` children convention.
pub fn decode_internal(page: &[u8], key_def: &KeyDef, reflength: usize) -> Result<InternalPage> {
    let (used_len, is_non_leaf) = read_header(page)?;
    if !is_non_leaf {
        return Err(PackTreeError::Corruption("expected internal page"));
    }
    let endpos = used_len as usize;
    let mut keys = Vec::new();
    let mut children = Vec::new();
    let mut pos = 2usize;
    let mut prev = Vec::new();
    loop {
        if pos >= endpos {
            break;
        }
        // A bare trailing child pointer (no key follows it) marks the end.
        if endpos - pos == reflength {
            children.push(super_decode_child(&page[pos..endpos], reflength)?);
            break;
        }
        let entry = get_key(page, Cursor(pos), endpos, &prev, key_def, true, reflength)?;
        children.push(entry.child.expect("non-leaf entry always carries a child"));
        keys.push(entry.key.clone());
        prev = entry.key;
        pos = entry.next.0;
    }
    if children.len() != keys.len() + 1 {
        return Err(PackTreeError::Corruption(
            "non-leaf page child/key count mismatch",
        ));
    }
    Ok(InternalPage { keys, children })
}

fn super_decode_child(buf: &[u8], width: usize) -> Result<PageId> {
    if buf.len() < width {
        return Err(PackTreeError::Corruption("trailing child pointer truncated"));
    }
    let mut b = [0u8; 8];
    b[8 - width..].copy_from_slice(&buf[..width]);
    Ok(PageId(u64::from_be_bytes(b) as u32))
}

/// Encode a non-leaf page: `child_0 key_0 child_1 key_1 … child_{n-1}
/// key_{n-1} child_n`.
pub fn encode_internal(
    keys: &[Vec<u8>],
    children: &[PageId],
    key_def: &KeyDef,
    reflength: usize,
    block_length: usize,
) -> Result<Vec<u8>> {
    if children.len() != keys.len() + 1 {
        return Err(PackTreeError::Invalid("internal page needs keys.len()+1 children"));
    }
    let mut body = Vec::new();
    let mut prev: Vec<u8> = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        super::emit_child(children[i], reflength, &mut body);
        let plan = pack_key(&prev, key, key_def);
        store_key(&mut body, &plan)?;
        prev = key.clone();
    }
    super::emit_child(children[keys.len()], reflength, &mut body);
    let used_len = 2 + body.len();
    if used_len > block_length {
        return Err(PackTreeError::FileFull("internal page entries exceed block_length"));
    }
    let mut page = vec![0u8; block_length];
    write_header(&mut page, used_len as u16, true);
    page[2..used_len].copy_from_slice(&body);
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BinaryCollation;
    use crate::types::{KeyDefBuilder, KeySegment, RecRef};
    use std::sync::Arc;

    fn kd() -> KeyDef {
        KeyDefBuilder::new(4096, 4)
            .segment(KeySegment::var_text(255, Arc::new(BinaryCollation)))
            .build()
            .unwrap()
    }

    #[test]
    fn leaf_roundtrip_multiple_entries() {
        let kd = kd();
        let words = ["apple", "applesauce", "banana", "cherry"];
        let mut entries = Vec::new();
        for (i, w) in words.iter().enumerate() {
            let mut key = Vec::new();
            kd.encode(&[Some(w.as_bytes())], RecRef(i as u64 + 1), &mut key).unwrap();
            entries.push(LeafEntry { key, payload: Vec::new() });
        }
        let page = encode_leaf(&entries, &kd, 4096).unwrap();
        let decoded = decode_leaf(&page, &kd, 0).unwrap();
        assert_eq!(decoded.entries.len(), entries.len());
        for (a, b) in decoded.entries.iter().zip(entries.iter()) {
            assert_eq!(a.key, b.key);
        }
    }

    #[test]
    fn internal_roundtrip() {
        let kd = kd();
        let mut k1 = Vec::new();
        kd.encode(&[Some(b"m")], RecRef(0), &mut k1).unwrap();
        let mut k2 = Vec::new();
        kd.encode(&[Some(b"t")], RecRef(0), &mut k2).unwrap();
        let keys = vec![k1, k2];
        let children = vec![PageId(1), PageId(2), PageId(3)];
        let page = encode_internal(&keys, &children, &kd, 4, 4096).unwrap();
        let decoded = decode_internal(&page, &kd, 4).unwrap();
        assert_eq!(decoded.children, children);
        assert_eq!(decoded.keys, keys);
    }

    #[test]
    fn leaf_overflow_reports_file_full() {
        let kd = kd();
        let mut entries = Vec::new();
        for i in 0..2000u64 {
            let mut key = Vec::new();
            kd.encode(&[Some(format!("word{i}").as_bytes())], RecRef(i), &mut key).unwrap();
            entries.push(LeafEntry { key, payload: Vec::new() });
        }
        let err = encode_leaf(&entries, &kd, 1024).unwrap_err();
        assert!(matches!(err, PackTreeError::FileFull(_)));
    }
}
