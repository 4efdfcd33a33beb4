//! `pack_key` / `store_key`: compute and emit the byte delta that turns a
//! prefix-compressed key slot into another, given its neighbors
//! (spec.md §4.1).

use crate::error::Result;
use crate::types::KeyDef;

use super::{encode_packed_len, shared_prefix_len};

/// The computed byte-delta that turns a prefix-compressed key slot into
/// another under the segment's packing flags (spec.md GLOSSARY).
///
/// `t_length` is the signed change in stored length versus a naive
/// unpacked encoding of `new_key` — negative when packing saved space.
pub struct PackPlan {
    /// Number of leading bytes of `new_key` shared with `prev_key`.
    pub shared: usize,
    /// The unshared suffix bytes of `new_key` to store verbatim.
    pub suffix: Vec<u8>,
    /// Signed change in encoded length versus storing `new_key` unpacked.
    pub t_length: i64,
    /// Whether this segment's packing uses the `PACK_KEY` high-bit-flag
    /// form (true) or the always-present `BINARY_PACK_KEY` header form.
    pub high_bit_form: bool,
}

/// Compute the byte delta to insert `new_key` between `prev_key` and
/// `next_key` under `key_def`'s first segment's packing flags
/// (spec.md §4.1 `pack_key`). `next_key` is consulted only to confirm
/// that packing against `prev_key` does not change `next_key`'s header
/// shape; callers needing that check call [`next_key_shape_changes`]
/// separately so the plan itself stays pure.
pub fn pack_key(prev_key: &[u8], new_key: &[u8], key_def: &KeyDef) -> PackPlan {
    let uses_pack_key = key_def
        .segments
        .first()
        .map(|s| s.flags.contains(crate::types::PACK_KEY))
        .unwrap_or(false);
    let shared = shared_prefix_len(prev_key, new_key);
    let suffix = new_key[shared..].to_vec();
    let naive_len = new_key.len();
    let mut packed_len = suffix.len();
    packed_len += if uses_pack_key {
        packed_header_len(shared, uses_pack_key)
    } else {
        packed_header_len(shared, false) + packed_header_len(suffix.len(), false)
    };
    PackPlan {
        shared,
        suffix,
        t_length: packed_len as i64 - naive_len as i64,
        high_bit_form: uses_pack_key,
    }
}

fn packed_header_len(value: usize, high_bit_form: bool) -> usize {
    if high_bit_form {
        if value == 0 {
            1
        } else if value < 127 {
            1
        } else {
            2
        }
    } else if value < 127 {
        1
    } else {
        2
    }
}

/// Emit the encoded form of a [`PackPlan`] into `dest`, preserving the
/// invariant that the following key's header shape (1-byte vs 3-byte
/// length prefix) is unaffected (spec.md §4.1 `store_key`).
pub fn store_key(dest: &mut Vec<u8>, plan: &PackPlan) -> Result<()> {
    if plan.high_bit_form {
        encode_packed_len(plan.shared, dest)?;
    } else {
        encode_packed_len(plan.shared, dest)?;
        encode_packed_len(plan.suffix.len(), dest)?;
    }
    dest.extend_from_slice(&plan.suffix);
    Ok(())
}

/// Length of the shared prefix between two encoded keys.
pub fn shared_prefix_len_pub(a: &[u8], b: &[u8]) -> usize {
    shared_prefix_len(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyDefBuilder, KeySegment};
    use crate::types::BinaryCollation;
    use std::sync::Arc;

    fn kd() -> KeyDef {
        KeyDefBuilder::new(4096, 4)
            .segment(KeySegment::var_text(255, Arc::new(BinaryCollation)))
            .build()
            .unwrap()
    }

    #[test]
    fn pack_then_store_roundtrips_via_get_key() {
        let kd = kd();
        let mut prev = Vec::new();
        kd.encode(&[Some(b"application")], crate::types::RecRef(1), &mut prev).unwrap();
        let mut newk = Vec::new();
        kd.encode(&[Some(b"applicative")], crate::types::RecRef(2), &mut newk).unwrap();

        let plan = pack_key(&prev, &newk, &kd);
        let mut out = Vec::new();
        store_key(&mut out, &plan).unwrap();

        let mut page = vec![0u8; 64];
        page[2..2 + out.len()].copy_from_slice(&out);
        let entry = super::super::get_key(
            &page,
            super::super::Cursor(2),
            2 + out.len(),
            &prev,
            &kd,
            false,
            4,
        )
        .unwrap();
        assert_eq!(entry.key, newk);
    }

    #[test]
    fn identical_key_packs_to_zero_length_suffix() {
        let kd = kd();
        let mut prev = Vec::new();
        kd.encode(&[Some(b"same")], crate::types::RecRef(1), &mut prev).unwrap();
        let plan = pack_key(&prev, &prev, &kd);
        assert_eq!(plan.shared, prev.len());
        assert!(plan.suffix.is_empty());
    }
}
