//! `FTIndex`: maintains one full-text `BTree` as records are indexed,
//! updated, and removed, including FT2 subtree promotion for high-frequency
//! words.
//!
//! Below `ft2_threshold` distinct documents, a word's postings are stored
//! as one plain leaf entry per `(word, doc)` pair — ordering falls out of
//! `KeyDef::compare_encoded`'s `RecRef` tie-break, so no special casing is
//! needed for insert/search. At or above the threshold, all existing
//! entries for the word are collected, written into a nested `BTree` over
//! a zero-segment `KeyDef` (which orders purely by `RecRef`, since
//! `compare_encoded`'s segment loop is empty and falls through to the
//! suffix comparison — this requires `NO_SAME` to stay unset on that
//! `KeyDef`, or every pair would compare equal), and the parent entry's
//! key is rewritten as `word + subtree_root` with payload
//! `LeafTail::SubtreeRef { count, root }`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::btree::{BTree, SearchMode};
use crate::cache::KeyCache;
use crate::error::{PackTreeError, Result};
use crate::tokenizer::{StopwordSet, Tokenizer};
use crate::types::{KeyDef, KeyDefFlags, LeafTail, PageId, RecRef};

use super::{lws, DEMOTED_WEIGHT, PIVOT_VAL};

/// One full-text index over a table: the word `BTree` plus the tokenizer
/// and promotion policy it was opened with.
pub struct FTIndex {
    word_key_def: Arc<KeyDef>,
    cache: Arc<KeyCache>,
    tree: BTree,
    tokenizer: Tokenizer,
    stopwords: Option<Arc<StopwordSet>>,
    ft2_threshold: usize,
    recref_width: usize,
    block_length: u32,
}

/// One distinct word's per-document local weight, ready to write.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedWord {
    pub word: Vec<u8>,
    pub weight: f32,
}

impl FTIndex {
    /// Opens a full-text index whose word `BTree` root is `root` (or
    /// `PageId::NONE` for an empty index).
    pub fn open(
        word_key_def: Arc<KeyDef>,
        cache: Arc<KeyCache>,
        root: PageId,
        tokenizer: Tokenizer,
        stopwords: Option<Arc<StopwordSet>>,
        ft2_threshold: usize,
    ) -> Self {
        let recref_width = word_key_def.recref_width;
        let block_length = word_key_def.block_length;
        let tree = BTree::new(word_key_def.clone(), cache.clone(), root, 4);
        Self {
            word_key_def,
            cache,
            tree,
            tokenizer,
            stopwords,
            ft2_threshold: ft2_threshold.max(2),
            recref_width,
            block_length,
        }
    }

    /// Current root of the word `BTree`, for persisting into `StateInfo`.
    pub fn root(&self) -> PageId {
        self.tree.root()
    }

    /// Tokenize `segments` (one record's indexed columns) into the
    /// per-word local weight array.
    pub fn linearize(&self, segments: &[&[u8]]) -> Vec<WeightedWord> {
        let mut counts: BTreeMap<Vec<u8>, u32> = BTreeMap::new();
        for seg in segments {
            let words: Vec<_> = self
                .tokenizer
                .simple_scan(seg, true, self.stopwords.as_deref())
                .collect();
            for w in words {
                *counts.entry(w.bytes).or_insert(0) += 1;
            }
        }
        let uniq = counts.len() as f32;
        if uniq == 0.0 {
            return Vec::new();
        }
        let local: Vec<(Vec<u8>, f32)> = counts.into_iter().map(|(w, c)| (w, lws(c))).collect();
        let sum_w: f32 = local.iter().map(|(_, w)| *w).sum();
        let norm = 1.0 + PIVOT_VAL * uniq;
        local
            .into_iter()
            .map(|(word, w)| {
                let prenorm = if sum_w > 0.0 { w / sum_w * uniq } else { 0.0 };
                WeightedWord { word, weight: prenorm / norm }
            })
            .collect()
    }

    /// Index one record: tokenize `segments` and write one word entry per
    /// distinct word, applying FT2 promotion as needed.
    pub fn index_record(&self, recref: RecRef, segments: &[&[u8]]) -> Result<()> {
        for ww in self.linearize(segments) {
            self.insert_word(&ww.word, recref, ww.weight)?;
        }
        Ok(())
    }

    /// Remove one record's contribution to the index.
    pub fn delete_record(&self, recref: RecRef, segments: &[&[u8]]) -> Result<()> {
        for ww in self.linearize(segments) {
            self.delete_word(&ww.word, recref)?;
        }
        Ok(())
    }

    /// Diff `old_segments` against `new_segments` for the same `recref`
    /// and apply the minimal set of deletes/inserts: words only in the
    /// old array are deleted, words only in the new array are inserted,
    /// and words present in both but whose weight differs by more than
    /// `1e-5` are deleted then reinserted.
    pub fn update_record(&self, recref: RecRef, old_segments: &[&[u8]], new_segments: &[&[u8]]) -> Result<()> {
        let old: BTreeMap<Vec<u8>, f32> = self
            .linearize(old_segments)
            .into_iter()
            .map(|w| (w.word, w.weight))
            .collect();
        let new: BTreeMap<Vec<u8>, f32> = self
            .linearize(new_segments)
            .into_iter()
            .map(|w| (w.word, w.weight))
            .collect();

        for (word, _) in old.iter() {
            if !new.contains_key(word) {
                self.delete_word(word, recref)?;
            }
        }
        for (word, new_weight) in new.iter() {
            match old.get(word) {
                None => self.insert_word(word, recref, *new_weight)?,
                Some(old_weight) if (old_weight - new_weight).abs() > 1e-5 => {
                    self.delete_word(word, recref)?;
                    self.insert_word(word, recref, *new_weight)?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn encode_word_key(&self, word: &[u8], recref: RecRef) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.word_key_def.encode(&[Some(word)], recref, &mut out)?;
        Ok(out)
    }

    fn decode_word(&self, key: &[u8]) -> Result<Vec<u8>> {
        let (value, _) = self.word_key_def.segments[0].decode_value(key)?;
        Ok(value.map(|v| v.to_vec()).unwrap_or_default())
    }

    fn tail_of(&self, key: &[u8], payload: &[u8]) -> Result<(LeafTail, RecRef)> {
        let tail: [u8; 4] = payload
            .try_into()
            .map_err(|_| PackTreeError::Corruption("full-text leaf payload is not 4 bytes"))?;
        let (_, recref) = self.word_key_def.split_recref(key)?;
        let mut recref_field = Vec::new();
        recref.encode(self.recref_width, &mut recref_field);
        LeafTail::decode(&tail, &recref_field)
    }

    /// All leaf entries currently stored for `word`, in key order.
    fn word_entries(&self, word: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let probe = self.encode_word_key(word, RecRef::ABSENT)?;
        let mut out = Vec::new();
        let first = match self.tree.search(&probe, SearchMode::Bigger) {
            Ok(r) => r,
            Err(PackTreeError::NotFound(_)) => return Ok(out),
            Err(e) => return Err(e),
        };
        let mut current = Some(first);
        while let Some(result) = current {
            if self.decode_word(&result.key)? != word {
                break;
            }
            out.push((result.key.clone(), result.payload.clone()));
            current = self.tree.search_next(&result.cursor)?;
        }
        Ok(out)
    }

    fn zero_seg_key_def(&self) -> Result<Arc<KeyDef>> {
        Ok(Arc::new(KeyDef::new(Vec::new(), KeyDefFlags::empty(), self.block_length, self.recref_width)?))
    }

    fn open_subtree(&self, root: PageId) -> Result<BTree> {
        Ok(BTree::new(self.zero_seg_key_def()?, self.cache.clone(), root, 0))
    }

    fn insert_word(&self, word: &[u8], recref: RecRef, weight: f32) -> Result<()> {
        let entries = self.word_entries(word)?;
        if entries.is_empty() {
            let key = self.encode_word_key(word, recref)?;
            return self.tree.insert(&key, LeafTail::Weight(weight).encode().to_vec());
        }
        if entries.len() == 1 {
            if let (LeafTail::SubtreeRef { count, root }, _) = self.tail_of(&entries[0].0, &entries[0].1)? {
                let subtree = self.open_subtree(root)?;
                let zero_kd = self.zero_seg_key_def()?;
                let mut sub_key = Vec::new();
                zero_kd.encode(&[], recref, &mut sub_key)?;
                subtree.insert(&sub_key, Vec::new())?;
                let new_count = count + 1;
                let new_root = subtree.root();
                let new_key = self.encode_word_key(word, RecRef(new_root.0 as u64))?;
                self.tree.delete(&entries[0].0)?;
                self.tree.insert(&new_key, LeafTail::SubtreeRef { count: new_count, root: new_root }.encode().to_vec())?;
                return Ok(());
            }
        }

        let new_count = entries.len() + 1;
        if new_count < self.ft2_threshold {
            let key = self.encode_word_key(word, recref)?;
            return self.tree.insert(&key, LeafTail::Weight(weight).encode().to_vec());
        }

        // Promote: collect every existing doc recref plus the new one into
        // a fresh FT2 subtree, then replace the plain entries with one
        // subtree-reference entry.
        let zero_kd = self.zero_seg_key_def()?;
        let subtree = BTree::new(zero_kd.clone(), self.cache.clone(), PageId::NONE, 0);
        for (key, payload) in &entries {
            let (_, doc_recref) = self.tail_of(key, payload)?;
            let mut sub_key = Vec::new();
            zero_kd.encode(&[], doc_recref, &mut sub_key)?;
            subtree.insert(&sub_key, Vec::new())?;
        }
        let mut new_sub_key = Vec::new();
        zero_kd.encode(&[], recref, &mut new_sub_key)?;
        subtree.insert(&new_sub_key, Vec::new())?;

        for (key, _) in &entries {
            self.tree.delete(key)?;
        }
        let root = subtree.root();
        let merged_key = self.encode_word_key(word, RecRef(root.0 as u64))?;
        self.tree.insert(&merged_key, LeafTail::SubtreeRef { count: new_count as u32, root }.encode().to_vec())
    }

    fn delete_word(&self, word: &[u8], recref: RecRef) -> Result<()> {
        let entries = self.word_entries(word)?;
        if entries.is_empty() {
            return Ok(());
        }
        if entries.len() == 1 {
            if let (LeafTail::SubtreeRef { count, root }, _) = self.tail_of(&entries[0].0, &entries[0].1)? {
                let subtree = self.open_subtree(root)?;
                let zero_kd = self.zero_seg_key_def()?;
                let mut sub_key = Vec::new();
                zero_kd.encode(&[], recref, &mut sub_key)?;
                subtree.delete(&sub_key)?;
                let new_count = count - 1;
                if new_count == 0 {
                    self.tree.delete(&entries[0].0)?;
                    return Ok(());
                }
                if (new_count as usize) < self.ft2_threshold {
                    // Demote: flatten the remaining subtree entries back
                    // into plain per-doc entries. Original per-document
                    // weights are gone; assign DEMOTED_WEIGHT uniformly.
                    let mut remaining = Vec::new();
                    match subtree.search_first() {
                        Ok(first) => {
                            let (_, doc_recref) = zero_kd.split_recref(&first.key)?;
                            remaining.push(doc_recref);
                            let mut cursor = first.cursor;
                            while let Some(next) = subtree.search_next(&cursor)? {
                                let (_, doc_recref) = zero_kd.split_recref(&next.key)?;
                                remaining.push(doc_recref);
                                cursor = next.cursor;
                            }
                        }
                        Err(PackTreeError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                    self.tree.delete(&entries[0].0)?;
                    for doc_recref in remaining {
                        let key = self.encode_word_key(word, doc_recref)?;
                        self.tree.insert(&key, LeafTail::Weight(DEMOTED_WEIGHT).encode().to_vec())?;
                    }
                    return Ok(());
                }
                let new_key = self.encode_word_key(word, RecRef(root.0 as u64))?;
                self.tree.delete(&entries[0].0)?;
                self.tree.insert(&new_key, LeafTail::SubtreeRef { count: new_count, root }.encode().to_vec())?;
                return Ok(());
            }
        }
        for (key, payload) in &entries {
            let (_, doc_recref) = self.tail_of(key, payload)?;
            if doc_recref == recref {
                self.tree.delete(key)?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// The `BTree` backing this index, for direct cursor-based query
    /// evaluation (`fulltext::boolean`/`fulltext::nlq`).
    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    pub fn word_key_def(&self) -> &Arc<KeyDef> {
        &self.word_key_def
    }

    /// Open the FT2 subtree rooted at `root`, for evaluators that need to
    /// walk a promoted word's document list.
    pub fn subtree(&self, root: PageId) -> Result<BTree> {
        self.open_subtree(root)
    }

    pub fn ft2_threshold(&self) -> usize {
        self.ft2_threshold
    }

    /// Every `(RecRef, weight)` pair currently indexed under the exact
    /// word `word`. Documents reached through an FT2 subtree carry
    /// [`DEMOTED_WEIGHT`] in place of their original per-document weight,
    /// since the subtree only stores bare `RecRef`s.
    pub fn postings(&self, word: &[u8]) -> Result<Vec<(RecRef, f32)>> {
        let entries = self.word_entries(word)?;
        let mut out = Vec::new();
        for (key, payload) in &entries {
            let (tail, recref) = self.tail_of(key, payload)?;
            match tail {
                LeafTail::Weight(w) => out.push((recref, w)),
                LeafTail::SubtreeRef { root, .. } => out.extend(self.subtree_postings(root)?),
            }
        }
        Ok(out)
    }

    /// Every `(RecRef, weight)` pair for every word starting with
    /// `prefix` (truncation-query support).
    pub fn postings_prefix(&self, prefix: &[u8]) -> Result<Vec<(RecRef, f32)>> {
        let probe_key = self.encode_word_key(prefix, RecRef::ABSENT)?;
        let mut out = Vec::new();
        let mut current = match self.tree.search(&probe_key, SearchMode::Bigger) {
            Ok(r) => Some(r),
            Err(PackTreeError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        while let Some(result) = current {
            let word = self.decode_word(&result.key)?;
            if !word.starts_with(prefix) {
                break;
            }
            let (tail, recref) = self.tail_of(&result.key, &result.payload)?;
            match tail {
                LeafTail::Weight(w) => out.push((recref, w)),
                LeafTail::SubtreeRef { root, .. } => out.extend(self.subtree_postings(root)?),
            }
            current = self.tree.search_next(&result.cursor)?;
        }
        Ok(out)
    }

    fn subtree_postings(&self, root: PageId) -> Result<Vec<(RecRef, f32)>> {
        let subtree = self.open_subtree(root)?;
        let zero_kd = self.zero_seg_key_def()?;
        let mut out = Vec::new();
        let first = match subtree.search_first() {
            Ok(r) => r,
            Err(PackTreeError::NotFound(_)) => return Ok(out),
            Err(e) => return Err(e),
        };
        let (_, recref) = zero_kd.split_recref(&first.key)?;
        out.push((recref, DEMOTED_WEIGHT));
        let mut cursor = first.cursor;
        while let Some(next) = subtree.search_next(&cursor)? {
            let (_, recref) = zero_kd.split_recref(&next.key)?;
            out.push((recref, DEMOTED_WEIGHT));
            cursor = next.cursor;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyCache;
    use crate::primitives::io::StdFileIo;
    use crate::types::{KeyDefBuilder, KeySegment, Utf8CiCollation};
    use tempfile::tempdir;

    fn fresh_index(threshold: usize) -> (tempfile::TempDir, FTIndex) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ft.dat");
        let io = Arc::new(StdFileIo::open(&path).unwrap());
        io.truncate(0).unwrap();
        let cache = Arc::new(KeyCache::new(io, 4096, 0, 256).unwrap());
        let kd = Arc::new(
            KeyDefBuilder::new(4096, 4)
                .segment(KeySegment::var_text(84, Arc::new(Utf8CiCollation)))
                .fulltext()
                .build()
                .unwrap(),
        );
        let tokenizer = Tokenizer::new(Arc::new(Utf8CiCollation), 1, 84);
        let index = FTIndex::open(kd, cache, PageId::NONE, tokenizer, None, threshold);
        (dir, index)
    }

    #[test]
    fn index_then_lookup_single_doc() {
        let (_dir, index) = fresh_index(64);
        index.index_record(RecRef(1), &[b"the quick brown fox"]).unwrap();
        let entries = index.word_entries(b"quick").unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn multiple_docs_stay_plain_below_threshold() {
        let (_dir, index) = fresh_index(64);
        for i in 1..=5u64 {
            index.index_record(RecRef(i), &[b"shared word here"]).unwrap();
        }
        let entries = index.word_entries(b"shared").unwrap();
        assert_eq!(entries.len(), 5);
        for (key, payload) in &entries {
            assert!(matches!(index.tail_of(key, payload).unwrap().0, LeafTail::Weight(_)));
        }
    }

    #[test]
    fn promotes_to_ft2_at_threshold() {
        let (_dir, index) = fresh_index(4);
        for i in 1..=4u64 {
            index.index_record(RecRef(i), &[b"popular"]).unwrap();
        }
        let entries = index.word_entries(b"popular").unwrap();
        assert_eq!(entries.len(), 1);
        let (tail, _) = index.tail_of(&entries[0].0, &entries[0].1).unwrap();
        match tail {
            LeafTail::SubtreeRef { count, .. } => assert_eq!(count, 4),
            LeafTail::Weight(_) => panic!("expected promotion"),
        }
    }

    #[test]
    fn delete_record_removes_word_entry() {
        let (_dir, index) = fresh_index(64);
        index.index_record(RecRef(1), &[b"solo word"]).unwrap();
        index.delete_record(RecRef(1), &[b"solo word"]).unwrap();
        assert!(index.word_entries(b"solo").unwrap().is_empty());
    }

    #[test]
    fn update_record_adds_and_drops_words() {
        let (_dir, index) = fresh_index(64);
        index.index_record(RecRef(1), &[b"alpha beta"]).unwrap();
        index.update_record(RecRef(1), &[b"alpha beta"], &[b"alpha gamma"]).unwrap();
        assert!(index.word_entries(b"beta").unwrap().is_empty());
        assert_eq!(index.word_entries(b"gamma").unwrap().len(), 1);
        assert_eq!(index.word_entries(b"alpha").unwrap().len(), 1);
    }
}
