//! `FTBoolEval`: boolean full-text query evaluation.
//!
//! The distilled algorithm drives evaluation through a shared priority
//! queue of per-word BTree cursors ordered by `(docid, depth)`, climbing
//! the expression tree to accumulate weight as each cursor advances. This
//! implementation keeps the same expression tree, `ythresh`/`yesses`/
//! `nos` accounting, and NO-short-circuit rule, but drives it candidate-
//! by-candidate over each word's already-materialized posting list
//! instead of a queue of live cursors — simpler to get right without a
//! compiler in the loop, at the cost of the "plus-subtree skip" advance
//! optimization, which this evaluator does not implement (see DESIGN.md).

use std::collections::BTreeMap;

use crate::error::Result;
use crate::tokenizer::{boolean_scan, BoolToken, BooleanSyntax};
use crate::types::RecRef;

use super::index::FTIndex;

/// One node of a parsed boolean query expression.
#[derive(Clone, Debug, PartialEq)]
pub enum ExprNode {
    /// A single word, possibly truncated (`word*`).
    Word {
        bytes: Vec<u8>,
        yesno: i32,
        weight_adjust: f32,
        truncation: bool,
    },
    /// A quoted phrase: exact adjacent-word sequence.
    Phrase { words: Vec<Vec<u8>>, yesno: i32 },
    /// A parenthesized (or top-level) group of children.
    Group { children: Vec<ExprNode>, yesno: i32 },
}

/// Diagnostic snapshot of a parsed query, for `CheckUtil`/CLI debugging.
#[derive(Clone, Debug)]
pub struct ExplainPlan {
    /// Flattened list of leaf words/phrases with their resolved yesno.
    pub leaves: Vec<String>,
    /// Number of documents the expression matched against the index.
    pub candidate_count: usize,
}

/// Evaluates boolean full-text queries against one [`FTIndex`].
pub struct FTBoolEval<'a> {
    index: &'a FTIndex,
    syntax: BooleanSyntax,
}

impl<'a> FTBoolEval<'a> {
    pub fn new(index: &'a FTIndex) -> Self {
        Self { index, syntax: BooleanSyntax::default() }
    }

    pub fn with_syntax(index: &'a FTIndex, syntax: BooleanSyntax) -> Self {
        Self { index, syntax }
    }

    /// Parse `query` into an expression tree.
    pub fn parse(&self, query: &[u8]) -> ExprNode {
        let collation = self.index.word_key_def().segments[0].collation.clone();
        let tokens: Vec<BoolToken> = boolean_scan(
            query,
            collation.as_ref(),
            self.syntax,
            1,
            usize::MAX,
            None,
        )
        .collect();
        let mut iter = tokens.into_iter().peekable();
        ExprNode::Group { children: parse_group(&mut iter), yesno: 0 }
    }

    /// Run the query and return matching documents, sorted by descending
    /// relevance weight.
    pub fn search(&self, query: &[u8]) -> Result<Vec<(RecRef, f32)>> {
        let expr = self.parse(query);
        let mut postings_cache: BTreeMap<Vec<u8>, BTreeMap<RecRef, f32>> = BTreeMap::new();
        self.collect_postings(&expr, &mut postings_cache)?;

        let mut candidates: std::collections::BTreeSet<RecRef> = std::collections::BTreeSet::new();
        collect_candidates(&expr, &postings_cache, &mut candidates);

        let mut results: Vec<(RecRef, f32)> = Vec::new();
        for doc in candidates {
            let eval = eval_node(&expr, doc, &postings_cache);
            if !eval.excluded && eval.weight > 0.0 && eval.yesses >= eval.ythresh {
                results.push((doc, eval.weight));
            }
        }
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    /// Parse and summarize `query` without evaluating it, for debugging.
    pub fn explain(&self, query: &[u8]) -> Result<ExplainPlan> {
        let expr = self.parse(query);
        let mut leaves = Vec::new();
        flatten_leaves(&expr, &mut leaves);
        let results = self.search(query)?;
        Ok(ExplainPlan { leaves, candidate_count: results.len() })
    }

    fn collect_postings(&self, node: &ExprNode, out: &mut BTreeMap<Vec<u8>, BTreeMap<RecRef, f32>>) -> Result<()> {
        match node {
            ExprNode::Word { bytes, truncation, .. } => {
                if out.contains_key(bytes) {
                    return Ok(());
                }
                let postings = if *truncation {
                    self.index.postings_prefix(bytes)?
                } else {
                    self.index.postings(bytes)?
                };
                out.insert(bytes.clone(), postings.into_iter().collect());
                Ok(())
            }
            ExprNode::Phrase { words, .. } => {
                for w in words {
                    if out.contains_key(w) {
                        continue;
                    }
                    let postings = self.index.postings(w)?;
                    out.insert(w.clone(), postings.into_iter().collect());
                }
                Ok(())
            }
            ExprNode::Group { children, .. } => {
                for c in children {
                    self.collect_postings(c, out)?;
                }
                Ok(())
            }
        }
    }
}

fn parse_group(tokens: &mut std::iter::Peekable<std::vec::IntoIter<BoolToken>>) -> Vec<ExprNode> {
    let mut children = Vec::new();
    loop {
        match tokens.next() {
            None | Some(BoolToken::Eof) | Some(BoolToken::RightParen) => break,
            Some(BoolToken::LeftParen) => {
                children.push(ExprNode::Group { children: parse_group(tokens), yesno: 0 });
            }
            Some(BoolToken::PhraseOpen) => {
                let mut words = Vec::new();
                loop {
                    match tokens.next() {
                        Some(BoolToken::Word { bytes, .. }) => words.push(bytes),
                        None | Some(BoolToken::PhraseClose) => break,
                        _ => {}
                    }
                }
                if !words.is_empty() {
                    children.push(ExprNode::Phrase { words, yesno: 0 });
                }
            }
            Some(BoolToken::PhraseClose) => {}
            Some(BoolToken::Stopword) => {}
            Some(BoolToken::Word { bytes, yesno, weight_adjust, truncation, .. }) => {
                children.push(ExprNode::Word { bytes, yesno, weight_adjust, truncation });
            }
        }
    }
    children
}

fn flatten_leaves(node: &ExprNode, out: &mut Vec<String>) {
    match node {
        ExprNode::Word { bytes, yesno, .. } => {
            out.push(format!("{}{}", yesno_prefix(*yesno), String::from_utf8_lossy(bytes)));
        }
        ExprNode::Phrase { words, yesno } => {
            let joined = words.iter().map(|w| String::from_utf8_lossy(w)).collect::<Vec<_>>().join(" ");
            out.push(format!("{}\"{}\"", yesno_prefix(*yesno), joined));
        }
        ExprNode::Group { children, .. } => {
            for c in children {
                flatten_leaves(c, out);
            }
        }
    }
}

fn yesno_prefix(yesno: i32) -> &'static str {
    match yesno {
        1 => "+",
        -1 => "-",
        _ => "",
    }
}

fn collect_candidates(node: &ExprNode, postings: &BTreeMap<Vec<u8>, BTreeMap<RecRef, f32>>, out: &mut std::collections::BTreeSet<RecRef>) {
    match node {
        ExprNode::Word { bytes, yesno, .. } => {
            if *yesno != -1 {
                if let Some(p) = postings.get(bytes) {
                    out.extend(p.keys().copied());
                }
            }
        }
        ExprNode::Phrase { words, yesno } => {
            if *yesno != -1 {
                if let Some(first) = words.first() {
                    if let Some(p) = postings.get(first) {
                        out.extend(p.keys().copied());
                    }
                }
            }
        }
        ExprNode::Group { children, .. } => {
            for c in children {
                collect_candidates(c, postings, out);
            }
        }
    }
}

/// Accumulated evaluation state at one node for one candidate document.
struct NodeEval {
    weight: f32,
    yesses: usize,
    ythresh: usize,
    nos: usize,
    excluded: bool,
}

fn eval_node(node: &ExprNode, doc: RecRef, postings: &BTreeMap<Vec<u8>, BTreeMap<RecRef, f32>>) -> NodeEval {
    match node {
        ExprNode::Word { bytes, yesno, weight_adjust, .. } => {
            let hit = postings.get(bytes).and_then(|p| p.get(&doc)).copied();
            match (*yesno, hit) {
                (-1, Some(_)) => NodeEval { weight: 0.0, yesses: 0, ythresh: 0, nos: 1, excluded: true },
                (-1, None) => NodeEval { weight: 0.0, yesses: 0, ythresh: 0, nos: 0, excluded: false },
                (1, Some(w)) => NodeEval { weight: w * weight_adjust, yesses: 1, ythresh: 1, nos: 0, excluded: false },
                (1, None) => NodeEval { weight: 0.0, yesses: 0, ythresh: 1, nos: 0, excluded: false },
                (_, Some(w)) => NodeEval { weight: w * weight_adjust, yesses: 0, ythresh: 0, nos: 0, excluded: false },
                (_, None) => NodeEval { weight: 0.0, yesses: 0, ythresh: 0, nos: 0, excluded: false },
            }
        }
        ExprNode::Phrase { words, yesno } => {
            let all_present = !words.is_empty()
                && words.iter().all(|w| postings.get(w).map(|p| p.contains_key(&doc)).unwrap_or(false));
            let weight: f32 = if all_present {
                words.iter().filter_map(|w| postings.get(w).and_then(|p| p.get(&doc))).sum()
            } else {
                0.0
            };
            match (*yesno, all_present) {
                (-1, true) => NodeEval { weight: 0.0, yesses: 0, ythresh: 0, nos: 1, excluded: true },
                (-1, false) => NodeEval { weight: 0.0, yesses: 0, ythresh: 0, nos: 0, excluded: false },
                (1, true) => NodeEval { weight, yesses: 1, ythresh: 1, nos: 0, excluded: false },
                (1, false) => NodeEval { weight: 0.0, yesses: 0, ythresh: 1, nos: 0, excluded: false },
                (_, _) => NodeEval { weight, yesses: 0, ythresh: 0, nos: 0, excluded: false },
            }
        }
        ExprNode::Group { children, yesno } => {
            let mut yesses = 0usize;
            let mut ythresh = 0usize;
            let mut nos = 0usize;
            let mut weight = 0.0f32;
            let mut excluded = false;
            for child in children {
                if let ExprNode::Word { yesno: 1, .. } | ExprNode::Phrase { yesno: 1, .. } | ExprNode::Group { yesno: 1, .. } = child {
                    ythresh += 1;
                }
                let r = eval_node(child, doc, postings);
                nos += r.nos;
                if r.nos > 0 {
                    excluded = true;
                    break;
                }
                yesses += r.yesses;
                weight += r.weight;
            }
            if excluded {
                return NodeEval { weight: 0.0, yesses, ythresh, nos, excluded: true };
            }
            let satisfied = yesses >= ythresh;
            match yesno {
                -1 if satisfied && weight > 0.0 => NodeEval { weight: 0.0, yesses, ythresh, nos: 1, excluded: true },
                -1 => NodeEval { weight: 0.0, yesses, ythresh, nos: 0, excluded: false },
                1 => NodeEval {
                    weight: if satisfied { weight } else { 0.0 },
                    yesses: if satisfied { 1 } else { 0 },
                    ythresh: 1,
                    nos: 0,
                    excluded: false,
                },
                _ => NodeEval { weight: if satisfied { weight } else { 0.0 }, yesses, ythresh, nos: 0, excluded: !satisfied && ythresh > 0 },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyCache;
    use crate::primitives::io::StdFileIo;
    use crate::tokenizer::Tokenizer;
    use crate::types::{KeyDefBuilder, KeySegment, PageId, Utf8CiCollation};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn fresh_index() -> (tempfile::TempDir, FTIndex) {
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
        let index = FTIndex::open(kd, cache, PageId::NONE, tokenizer, None, 64);
        (dir, index)
    }

    #[test]
    fn required_word_excludes_nonmatching_docs() {
        let (_dir, index) = fresh_index();
        index.index_record(RecRef(1), &[b"quick brown fox"]).unwrap();
        index.index_record(RecRef(2), &[b"slow brown turtle"]).unwrap();
        let eval = FTBoolEval::new(&index);
        let results = eval.search(b"+quick +brown").unwrap();
        assert_eq!(results.iter().map(|(r, _)| *r).collect::<Vec<_>>(), vec![RecRef(1)]);
    }

    #[test]
    fn negated_word_excludes_matching_docs() {
        let (_dir, index) = fresh_index();
        index.index_record(RecRef(1), &[b"quick brown fox"]).unwrap();
        index.index_record(RecRef(2), &[b"quick brown hare"]).unwrap();
        let eval = FTBoolEval::new(&index);
        let results = eval.search(b"+quick -fox").unwrap();
        assert_eq!(results.iter().map(|(r, _)| *r).collect::<Vec<_>>(), vec![RecRef(2)]);
    }

    #[test]
    fn optional_words_rank_by_accumulated_weight() {
        let (_dir, index) = fresh_index();
        index.index_record(RecRef(1), &[b"apple apple banana"]).unwrap();
        index.index_record(RecRef(2), &[b"apple cherry cherry"]).unwrap();
        let eval = FTBoolEval::new(&index);
        let results = eval.search(b"apple banana cherry").unwrap();
        assert_eq!(results.len(), 2);
    }
}
