//! Word-boundary scanning over a byte sequence under a collation, plus the
//! boolean query mini-lexer (operators, phrases, stopwords) that
//! `fulltext::boolean`'s parser consumes.
//!
//! Two entry points: [`simple_scan`] yields plain word tokens (used by
//! `fulltext::index` to tokenize a record's indexed columns, and by
//! `fulltext::nlq` to tokenize a natural-language query), and
//! [`boolean_scan`] additionally recognizes `+ - < > ( ) ~ * "` operators
//! and phrase quoting for the boolean query grammar.

mod stopwords;

pub use stopwords::StopwordSet;

use std::sync::Arc;

use crate::types::Collation;

/// One decoded word: its folded bytes and its byte offset in the source.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Word {
    pub bytes: Vec<u8>,
    pub start: usize,
}

/// Lazily scans `src` for word tokens under `collation`, skipping runs
/// shorter than `min_word_len`, longer than `max_word_len`, or present in
/// `stopwords` (when `skip_stopwords` is set).
pub struct SimpleScan<'a> {
    src: &'a [u8],
    pos: usize,
    collation: &'a dyn Collation,
    min_word_len: usize,
    max_word_len: usize,
    skip_stopwords: bool,
    stopwords: Option<&'a StopwordSet>,
}

/// Construct a [`SimpleScan`] iterator (spec's "lazy sequence of Word").
pub fn simple_scan<'a>(
    src: &'a [u8],
    collation: &'a dyn Collation,
    min_word_len: usize,
    max_word_len: usize,
    skip_stopwords: bool,
    stopwords: Option<&'a StopwordSet>,
) -> SimpleScan<'a> {
    SimpleScan {
        src,
        pos: 0,
        collation,
        min_word_len,
        max_word_len,
        skip_stopwords,
        stopwords,
    }
}

impl<'a> Iterator for SimpleScan<'a> {
    type Item = Word;

    fn next(&mut self) -> Option<Word> {
        loop {
            // Skip to the next word-starting byte.
            while self.pos < self.src.len() && !self.collation.is_word_char(self.src[self.pos]) {
                self.pos += 1;
            }
            if self.pos >= self.src.len() {
                return None;
            }
            let start = self.pos;
            let mut end = self.pos;
            let mut true_end = self.pos;
            while end < self.src.len() {
                let b = self.src[end];
                if self.collation.is_word_char(b) {
                    end += 1;
                    true_end = end;
                } else if self.collation.is_misc_word_char(b)
                    && end + 1 < self.src.len()
                    && self.collation.is_word_char(self.src[end + 1])
                {
                    end += 1;
                } else {
                    break;
                }
            }
            self.pos = end;
            let len = true_end - start;
            if len < self.min_word_len || len > self.max_word_len {
                continue;
            }
            let bytes: Vec<u8> = self.src[start..true_end]
                .iter()
                .map(|b| self.collation.fold(*b))
                .collect();
            if self.skip_stopwords {
                if let Some(stop) = self.stopwords {
                    if stop.contains(&bytes) {
                        continue;
                    }
                }
            }
            return Some(Word { bytes, start });
        }
    }
}

/// The configurable operator/phrase-delimiter character set for
/// [`boolean_scan`]. Defaults to MyISAM's canonical
/// `"+ -><()~*:\"\""`: position 0 is YES, 1 is a plain separator, 2 is
/// NO, 3/4 are weight incr/decr, 5/6 are parens, 7 is NEGATE, 8 is
/// TRUNCATE, 9 is the (unused here) field-qualifier, and 10/11 are the
/// phrase open/close quote — the only pair allowed to collide.
#[derive(Clone, Copy, Debug)]
pub struct BooleanSyntax {
    pub yes: u8,
    pub no: u8,
    pub incr: u8,
    pub decr: u8,
    pub lparen: u8,
    pub rparen: u8,
    pub negate: u8,
    pub truncate: u8,
    pub lquote: u8,
    pub rquote: u8,
}

impl Default for BooleanSyntax {
    fn default() -> Self {
        Self {
            yes: b'+',
            no: b'-',
            incr: b'>',
            decr: b'<',
            lparen: b'(',
            rparen: b')',
            negate: b'~',
            truncate: b'*',
            lquote: b'"',
            rquote: b'"',
        }
    }
}

impl BooleanSyntax {
    /// Construct a custom syntax, rejecting any collision outside the
    /// lquote/rquote pair.
    pub fn custom(
        yes: u8,
        no: u8,
        incr: u8,
        decr: u8,
        lparen: u8,
        rparen: u8,
        negate: u8,
        truncate: u8,
        lquote: u8,
        rquote: u8,
    ) -> crate::error::Result<Self> {
        let others = [yes, no, incr, decr, lparen, rparen, negate, truncate];
        let mut seen = std::collections::HashSet::new();
        for &c in &others {
            if !seen.insert(c) {
                return Err(crate::error::PackTreeError::Invalid(
                    "boolean syntax operators must be distinct outside the quote pair",
                ));
            }
        }
        if others.contains(&lquote) || others.contains(&rquote) {
            return Err(crate::error::PackTreeError::Invalid(
                "quote characters must not collide with other operators",
            ));
        }
        Ok(Self { yes, no, incr, decr, lparen, rparen, negate, truncate, lquote, rquote })
    }
}

/// Weight multiplier table for `incr`/`decr` runs, clamped to +/-5 and
/// mapped through `1.5^i` (incr) or `-0.5 * 1.5^i` (decr).
pub fn weight_adjust(level: i32) -> f32 {
    let level = level.clamp(-5, 5);
    if level >= 0 {
        1.5f32.powi(level)
    } else {
        -0.5 * 1.5f32.powi(-level)
    }
}

/// One boolean-query lexer token.
#[derive(Clone, Debug, PartialEq)]
pub enum BoolToken {
    LeftParen,
    RightParen,
    /// `yesno`: -1 (NO), 0 (optional), +1 (YES). `weight_adjust`: the
    /// `>`/`<` run's multiplier (1.0 if none seen). `wasign`: whether a
    /// `~` preceded the word (WEIGHT_ONLY marker). `truncation`: a
    /// trailing `*` was present.
    Word { bytes: Vec<u8>, yesno: i32, weight_adjust: f32, wasign: bool, truncation: bool },
    Stopword,
    PhraseOpen,
    PhraseClose,
    Eof,
}

/// Scans a boolean full-text query into [`BoolToken`]s under `syntax`.
/// Operators only take effect when preceded by whitespace (or the start
/// of the query); inside an open phrase, only the closing quote is
/// meaningful and every other word is emitted as a plain `Word` with no
/// operators applied.
pub struct BooleanScan<'a> {
    src: &'a [u8],
    pos: usize,
    collation: &'a dyn Collation,
    syntax: BooleanSyntax,
    min_word_len: usize,
    max_word_len: usize,
    stopwords: Option<&'a StopwordSet>,
    in_phrase: bool,
    at_word_boundary: bool,
    done: bool,
}

pub fn boolean_scan<'a>(
    src: &'a [u8],
    collation: &'a dyn Collation,
    syntax: BooleanSyntax,
    min_word_len: usize,
    max_word_len: usize,
    stopwords: Option<&'a StopwordSet>,
) -> BooleanScan<'a> {
    BooleanScan {
        src,
        pos: 0,
        collation,
        syntax,
        min_word_len,
        max_word_len,
        stopwords,
        in_phrase: false,
        at_word_boundary: true,
        done: false,
    }
}

impl<'a> BooleanScan<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn scan_word_run(&mut self) -> (Vec<u8>, bool) {
        let start = self.pos;
        let mut end = self.pos;
        let mut true_end = self.pos;
        while end < self.src.len() {
            let b = self.src[end];
            if self.collation.is_word_char(b) {
                end += 1;
                true_end = end;
            } else if self.collation.is_misc_word_char(b)
                && end + 1 < self.src.len()
                && self.collation.is_word_char(self.src[end + 1])
            {
                end += 1;
            } else {
                break;
            }
        }
        let mut truncation = false;
        if end < self.src.len() && self.src[end] == self.syntax.truncate {
            truncation = true;
            end += 1;
        }
        self.pos = end;
        let bytes: Vec<u8> = self.src[start..true_end].iter().map(|b| self.collation.fold(*b)).collect();
        (bytes, truncation)
    }
}

impl<'a> Iterator for BooleanScan<'a> {
    type Item = BoolToken;

    fn next(&mut self) -> Option<BoolToken> {
        if self.done {
            return None;
        }
        loop {
            let Some(b) = self.peek() else {
                self.done = true;
                return Some(BoolToken::Eof);
            };

            if b.is_ascii_whitespace() {
                self.pos += 1;
                self.at_word_boundary = true;
                continue;
            }

            if self.in_phrase {
                if b == self.syntax.rquote {
                    self.pos += 1;
                    self.in_phrase = false;
                    return Some(BoolToken::PhraseClose);
                }
                if !self.collation.is_word_char(b) {
                    self.pos += 1;
                    continue;
                }
                let (bytes, _) = self.scan_word_run();
                if bytes.is_empty() {
                    continue;
                }
                return Some(BoolToken::Word { bytes, yesno: 0, weight_adjust: 1.0, wasign: false, truncation: false });
            }

            if self.at_word_boundary && b == self.syntax.lparen {
                self.pos += 1;
                self.at_word_boundary = true;
                return Some(BoolToken::LeftParen);
            }
            if b == self.syntax.rparen {
                self.pos += 1;
                self.at_word_boundary = false;
                return Some(BoolToken::RightParen);
            }
            if self.at_word_boundary && b == self.syntax.lquote {
                self.pos += 1;
                self.in_phrase = true;
                self.at_word_boundary = true;
                return Some(BoolToken::PhraseOpen);
            }

            if self.at_word_boundary {
                let mut yesno = 0i32;
                let mut level = 0i32;
                let mut wasign = false;
                loop {
                    match self.peek() {
                        Some(c) if c == self.syntax.yes => {
                            yesno = 1;
                            self.pos += 1;
                        }
                        Some(c) if c == self.syntax.no => {
                            yesno = -1;
                            self.pos += 1;
                        }
                        Some(c) if c == self.syntax.incr => {
                            level += 1;
                            self.pos += 1;
                        }
                        Some(c) if c == self.syntax.decr => {
                            level -= 1;
                            self.pos += 1;
                        }
                        Some(c) if c == self.syntax.negate => {
                            wasign = !wasign;
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                if !self.collation.is_word_char(self.peek().unwrap_or(0)) {
                    // A bare operator run with no following word is noise; drop it.
                    self.at_word_boundary = true;
                    continue;
                }
                let (bytes, truncation) = self.scan_word_run();
                self.at_word_boundary = false;
                if bytes.is_empty() {
                    continue;
                }
                let len = bytes.len();
                if (len < self.min_word_len || len > self.max_word_len) && !truncation {
                    return Some(BoolToken::Stopword);
                }
                if let Some(stop) = self.stopwords {
                    if stop.contains(&bytes) {
                        return Some(BoolToken::Stopword);
                    }
                }
                return Some(BoolToken::Word {
                    bytes,
                    yesno,
                    weight_adjust: weight_adjust(level),
                    wasign,
                    truncation,
                });
            }

            if !self.collation.is_word_char(b) {
                self.pos += 1;
                continue;
            }
            let (bytes, truncation) = self.scan_word_run();
            self.at_word_boundary = false;
            if bytes.is_empty() {
                continue;
            }
            let len = bytes.len();
            if (len < self.min_word_len || len > self.max_word_len) && !truncation {
                return Some(BoolToken::Stopword);
            }
            if let Some(stop) = self.stopwords {
                if stop.contains(&bytes) {
                    return Some(BoolToken::Stopword);
                }
            }
            return Some(BoolToken::Word { bytes, yesno: 0, weight_adjust: 1.0, wasign: false, truncation });
        }
    }
}

/// Convenience: the collation + length bounds a `Tokenizer` user carries
/// around, bundled so `fulltext` call sites don't thread four separate
/// arguments everywhere.
#[derive(Clone)]
pub struct Tokenizer {
    pub collation: Arc<dyn Collation>,
    pub min_word_len: usize,
    pub max_word_len: usize,
}

impl Tokenizer {
    pub fn new(collation: Arc<dyn Collation>, min_word_len: usize, max_word_len: usize) -> Self {
        Self { collation, min_word_len, max_word_len }
    }

    pub fn simple_scan<'a>(&'a self, src: &'a [u8], skip_stopwords: bool, stopwords: Option<&'a StopwordSet>) -> SimpleScan<'a> {
        simple_scan(src, self.collation.as_ref(), self.min_word_len, self.max_word_len, skip_stopwords, stopwords)
    }

    pub fn boolean_scan<'a>(&'a self, src: &'a [u8], syntax: BooleanSyntax, stopwords: Option<&'a StopwordSet>) -> BooleanScan<'a> {
        boolean_scan(src, self.collation.as_ref(), syntax, self.min_word_len, self.max_word_len, stopwords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BinaryCollation, CaseFoldCollation};

    #[test]
    fn simple_scan_splits_on_non_word_chars() {
        let c = BinaryCollation;
        let words: Vec<_> = simple_scan(b"the quick brown fox", &c, 1, 64, false, None)
            .map(|w| w.bytes)
            .collect();
        assert_eq!(words, vec![b"the".to_vec(), b"quick".to_vec(), b"brown".to_vec(), b"fox".to_vec()]);
    }

    #[test]
    fn simple_scan_keeps_misc_chars_mid_word() {
        let c = BinaryCollation;
        let words: Vec<_> = simple_scan(b"don't stop", &c, 1, 64, false, None).map(|w| w.bytes).collect();
        assert_eq!(words, vec![b"don't".to_vec(), b"stop".to_vec()]);
    }

    #[test]
    fn simple_scan_respects_length_bounds() {
        let c = BinaryCollation;
        let words: Vec<_> = simple_scan(b"a bb ccc dddd", &c, 2, 3, false, None).map(|w| w.bytes).collect();
        assert_eq!(words, vec![b"bb".to_vec(), b"ccc".to_vec()]);
    }

    #[test]
    fn stopword_idempotence() {
        let c = BinaryCollation;
        let stop = StopwordSet::from_words(["the"]);
        let with_stop: Vec<_> = simple_scan(b"X the Y", &c, 1, 64, true, Some(&stop)).map(|w| w.bytes).collect();
        let without: Vec<_> = simple_scan(b"X Y", &c, 1, 64, true, Some(&stop)).map(|w| w.bytes).collect();
        assert_eq!(with_stop, without);
    }

    #[test]
    fn boolean_scan_recognizes_operators() {
        let c = CaseFoldCollation;
        let syntax = BooleanSyntax::default();
        let tokens: Vec<_> = boolean_scan(b"+quick +brown -dogs", &c, syntax, 1, 64, None).collect();
        assert_eq!(
            tokens,
            vec![
                BoolToken::Word { bytes: b"quick".to_vec(), yesno: 1, weight_adjust: 1.0, wasign: false, truncation: false },
                BoolToken::Word { bytes: b"brown".to_vec(), yesno: 1, weight_adjust: 1.0, wasign: false, truncation: false },
                BoolToken::Word { bytes: b"dogs".to_vec(), yesno: -1, weight_adjust: 1.0, wasign: false, truncation: false },
                BoolToken::Eof,
            ]
        );
    }

    #[test]
    fn boolean_scan_handles_phrase() {
        let c = CaseFoldCollation;
        let syntax = BooleanSyntax::default();
        let tokens: Vec<_> = boolean_scan(b"\"quick brown\"", &c, syntax, 1, 64, None).collect();
        assert_eq!(
            tokens,
            vec![
                BoolToken::PhraseOpen,
                BoolToken::Word { bytes: b"quick".to_vec(), yesno: 0, weight_adjust: 1.0, wasign: false, truncation: false },
                BoolToken::Word { bytes: b"brown".to_vec(), yesno: 0, weight_adjust: 1.0, wasign: false, truncation: false },
                BoolToken::PhraseClose,
                BoolToken::Eof,
            ]
        );
    }

    #[test]
    fn boolean_scan_recognizes_truncation() {
        let c = CaseFoldCollation;
        let syntax = BooleanSyntax::default();
        let tokens: Vec<_> = boolean_scan(b"test*", &c, syntax, 1, 64, None).collect();
        assert_eq!(
            tokens,
            vec![
                BoolToken::Word { bytes: b"test".to_vec(), yesno: 0, weight_adjust: 1.0, wasign: false, truncation: true },
                BoolToken::Eof,
            ]
        );
    }

    #[test]
    fn weight_adjust_table_matches_geometric_progression() {
        assert_eq!(weight_adjust(0), 1.0);
        assert!((weight_adjust(1) - 1.5).abs() < 1e-6);
        assert!((weight_adjust(-1) - (-0.75)).abs() < 1e-6);
        assert_eq!(weight_adjust(10), weight_adjust(5));
        assert_eq!(weight_adjust(-10), weight_adjust(-5));
    }
}
