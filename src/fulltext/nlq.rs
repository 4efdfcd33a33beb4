//! `FTNLQEval`: natural-language relevance ranking against an [`FTIndex`].
//!
//! For each query word the evaluator walks that word's postings (plain
//! entries and any FT2 subtree alike, via [`FTIndex::postings`]) and folds
//! each document's local weight into a running per-document score, scaled
//! by the word's global weight. Optional query expansion re-tokenizes the
//! top-K initial results and feeds their words back in for a second pass.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::tokenizer::Tokenizer;
use crate::types::RecRef;

use super::index::FTIndex;
use super::{DOC_CNT_SAFETY_CAP, FIND_RELEVANCE_NONE};

/// One scored document.
#[derive(Clone, Debug, PartialEq)]
pub struct Hit {
    pub docid: RecRef,
    pub weight: f32,
}

/// Running per-document accumulator while folding in one word's postings.
#[derive(Clone, Copy, Debug, Default)]
struct SuperDoc {
    weight: f32,
}

/// Natural-language query evaluator over one [`FTIndex`].
pub struct FTNLQEval<'a> {
    index: &'a FTIndex,
    tokenizer: &'a Tokenizer,
    /// Total live record count, for the global-weight formula.
    total_records: u64,
}

impl<'a> FTNLQEval<'a> {
    pub fn new(index: &'a FTIndex, tokenizer: &'a Tokenizer, total_records: u64) -> Self {
        Self { index, tokenizer, total_records }
    }

    /// Global weight of a word occurring in `doc_count` of `total_records`
    /// documents: `ln((records - doc_count) / doc_count)`, floored at zero
    /// for words so common the ratio is non-positive.
    fn gws(&self, doc_count: u64) -> f32 {
        if doc_count == 0 || doc_count >= self.total_records {
            return 0.0;
        }
        let ratio = (self.total_records - doc_count) as f32 / doc_count as f32;
        if ratio <= 0.0 {
            0.0
        } else {
            ratio.ln().max(0.0)
        }
    }

    /// Score every document containing at least one word of `query`,
    /// without query expansion.
    pub fn search(&self, query: &[u8]) -> Result<Vec<Hit>> {
        let words: Vec<Vec<u8>> = self
            .tokenizer
            .simple_scan(query, true, None)
            .map(|w| w.bytes)
            .collect();
        self.search_words(&words)
    }

    /// Score documents for an explicit word list, then optionally expand
    /// the query with words drawn from the top `expand_top_k` results' own
    /// records and rerun the walk once (spec.md §4.7 "query expansion").
    /// `fetch_record` retrieves the stored bytes for a docid surfaced by
    /// the first pass, the way a real caller would reach through a
    /// `RecordStore`; returning `None` (record already gone) just drops
    /// that document's contribution to the expansion word set.
    pub fn search_with_expansion(
        &self,
        query: &[u8],
        expand_top_k: usize,
        fetch_record: &dyn Fn(RecRef) -> Option<Vec<u8>>,
    ) -> Result<Vec<Hit>> {
        let mut words: Vec<Vec<u8>> = self
            .tokenizer
            .simple_scan(query, true, None)
            .map(|w| w.bytes)
            .collect();
        let first_pass = self.search_words(&words)?;
        if expand_top_k == 0 || first_pass.is_empty() {
            return Ok(first_pass);
        }

        let mut expansion_words: Vec<Vec<u8>> = Vec::new();
        for hit in first_pass.iter().take(expand_top_k) {
            if let Some(bytes) = fetch_record(hit.docid) {
                expansion_words.extend(self.tokenizer.simple_scan(&bytes, true, None).map(|w| w.bytes));
            }
        }
        if expansion_words.is_empty() {
            return Ok(first_pass);
        }
        words.extend(expansion_words);
        words.sort();
        words.dedup();
        self.search_words(&words)
    }

    /// Relevance of one specific document against `query`, the single-
    /// record counterpart to `search`/`search_with_expansion` (spec.md §9's
    /// `find_relevance`). Returns [`FIND_RELEVANCE_NONE`] for an absent
    /// `RecRef` (the `POS_ERROR` case); callers should treat any negative
    /// return as "not applicable" rather than a weight, per spec.md §9.
    pub fn find_relevance(&self, recref: RecRef, query: &[u8]) -> Result<f32> {
        if recref.is_absent() {
            return Ok(FIND_RELEVANCE_NONE);
        }
        let words: Vec<Vec<u8>> = self.tokenizer.simple_scan(query, true, None).map(|w| w.bytes).collect();
        let hits = self.search_words(&words)?;
        Ok(hits.iter().find(|h| h.docid == recref).map(|h| h.weight).unwrap_or(0.0))
    }

    /// Score every document matched by at least one word in `words`,
    /// including documents whose accumulated weight is zero because every
    /// word they matched was too common to carry a positive global weight
    /// (spec.md §8 property 8: "docs containing only very-frequent words
    /// may receive weight 0" — zero weight, not exclusion).
    fn search_words(&self, words: &[Vec<u8>]) -> Result<Vec<Hit>> {
        let mut docs: BTreeMap<RecRef, SuperDoc> = BTreeMap::new();
        let mut unique_words: Vec<&Vec<u8>> = words.iter().collect();
        unique_words.sort();
        unique_words.dedup();

        for word in unique_words {
            let postings = self.index.postings(word)?;
            if postings.len() as u64 > DOC_CNT_SAFETY_CAP {
                continue;
            }
            let doc_count = postings.len() as u64;
            let gws = self.gws(doc_count);
            for (docid, local_weight) in postings {
                let entry = docs.entry(docid).or_insert_with(SuperDoc::default);
                entry.weight += local_weight * gws;
            }
        }

        let mut hits: Vec<Hit> = docs.into_iter().map(|(docid, sd)| Hit { docid, weight: sd.weight }).collect();
        hits.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyCache;
    use crate::primitives::io::StdFileIo;
    use crate::types::{KeyDefBuilder, KeySegment, PageId, Utf8CiCollation};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn fresh_index() -> (tempfile::TempDir, FTIndex, Tokenizer) {
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
        let index = FTIndex::open(kd, cache, PageId::NONE, tokenizer.clone(), None, 64);
        (dir, index, tokenizer)
    }

    #[test]
    fn rare_word_outranks_common_word() {
        let (_dir, index, tokenizer) = fresh_index();
        index.index_record(RecRef(1), &[b"apple banana"]).unwrap();
        index.index_record(RecRef(2), &[b"apple cherry"]).unwrap();
        index.index_record(RecRef(3), &[b"apple date"]).unwrap();
        index.index_record(RecRef(4), &[b"apple banana"]).unwrap();
        let eval = FTNLQEval::new(&index, &tokenizer, 4);
        let hits = eval.search(b"apple cherry").unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].docid, RecRef(2));
    }

    #[test]
    fn word_present_in_every_document_scores_zero_but_still_matches() {
        let (_dir, index, tokenizer) = fresh_index();
        index.index_record(RecRef(1), &[b"common only"]).unwrap();
        index.index_record(RecRef(2), &[b"common only"]).unwrap();
        let eval = FTNLQEval::new(&index, &tokenizer, 2);
        let hits = eval.search(b"common").unwrap();
        assert_eq!(hits.iter().map(|h| h.docid).collect::<std::collections::BTreeSet<_>>(), [RecRef(1), RecRef(2)].into_iter().collect());
        assert!(hits.iter().all(|h| h.weight == 0.0));
    }

    #[test]
    fn expansion_pulls_in_a_document_the_bare_query_missed() {
        let (_dir, index, tokenizer) = fresh_index();
        let records: [(RecRef, &[u8]); 5] = [
            (RecRef(1), b"kiwi lemon"),
            (RecRef(2), b"kiwi mango"),
            (RecRef(3), b"mango nectar"),
            (RecRef(4), b"nectar orange"),
            (RecRef(5), b"orange papaya"),
        ];
        let mut stored: BTreeMap<RecRef, Vec<u8>> = BTreeMap::new();
        for (id, body) in records {
            index.index_record(id, &[body]).unwrap();
            stored.insert(id, body.to_vec());
        }
        let eval = FTNLQEval::new(&index, &tokenizer, 5);

        let bare = eval.search(b"lemon").unwrap();
        assert_eq!(bare.iter().map(|h| h.docid).collect::<Vec<_>>(), vec![RecRef(1)]);

        let fetch = |r: RecRef| stored.get(&r).cloned();
        let expanded = eval.search_with_expansion(b"lemon", 1, &fetch).unwrap();
        let docids: std::collections::BTreeSet<RecRef> = expanded.iter().map(|h| h.docid).collect();
        assert!(docids.contains(&RecRef(1)));
        assert!(docids.contains(&RecRef(2)), "expansion should have pulled in RecRef(2) via the shared word 'kiwi'");
    }

    #[test]
    fn expansion_with_zero_top_k_is_a_plain_search() {
        let (_dir, index, tokenizer) = fresh_index();
        index.index_record(RecRef(1), &[b"apple banana"]).unwrap();
        let eval = FTNLQEval::new(&index, &tokenizer, 1);
        let plain = eval.search(b"apple").unwrap();
        let expanded = eval.search_with_expansion(b"apple", 0, &|_| None).unwrap();
        assert_eq!(plain, expanded);
    }

    #[test]
    fn find_relevance_returns_sentinel_for_absent_recref() {
        let (_dir, index, tokenizer) = fresh_index();
        index.index_record(RecRef(1), &[b"apple banana"]).unwrap();
        let eval = FTNLQEval::new(&index, &tokenizer, 1);
        assert_eq!(eval.find_relevance(RecRef::ABSENT, b"apple").unwrap(), FIND_RELEVANCE_NONE);
    }
}
