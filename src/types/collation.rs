//! Collation handles for key segments (spec.md §3: "a collation handle").
//!
//! The distilled spec leaves the comparison semantics for text segments
//! unspecified; `original_source`'s `CHARSET_INFO` plays the analogous role.
//! We model the seam as a small trait rather than pulling in a full
//! Unicode collation library, since spec.md's boolean/NLQ evaluators only
//! need ordering, equality, and "is this byte whitespace" predicates.

use std::cmp::Ordering;

/// A collation compares and normalizes byte sequences for one key segment.
pub trait Collation: Send + Sync + std::fmt::Debug {
    /// Compare two byte strings under this collation's ordering.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// True if `b` is considered a "word" character for tokenizing purposes
    /// (spec.md §4.4 `true_word_char`).
    fn is_word_char(&self, b: u8) -> bool;

    /// True if `b` is a "misc" word character: punctuation that may appear
    /// mid-word (apostrophes) but not at a boundary (spec.md §4.4).
    fn is_misc_word_char(&self, b: u8) -> bool {
        b == b'\'' || b == b'-'
    }

    /// Fold a byte to its canonical form for hashing/equality (identity for
    /// binary collations).
    fn fold(&self, b: u8) -> u8;

    /// Name used in diagnostics and the state header's `language` field.
    fn name(&self) -> &'static str;
}

/// Strict byte-for-byte collation: no folding, no case sensitivity changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCollation;

impl Collation for BinaryCollation {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn is_word_char(&self, b: u8) -> bool {
        b.is_ascii_alphanumeric() || b == b'_'
    }

    fn fold(&self, b: u8) -> u8 {
        b
    }

    fn name(&self) -> &'static str {
        "binary"
    }
}

/// ASCII case-insensitive collation: the common non-Unicode MyISAM default
/// (`latin1_swedish_ci`-equivalent behavior for the ASCII range).
#[derive(Debug, Default, Clone, Copy)]
pub struct CaseFoldCollation;

impl Collation for CaseFoldCollation {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let la = a.len();
        let lb = b.len();
        for i in 0..la.min(lb) {
            let fa = self.fold(a[i]);
            let fb = self.fold(b[i]);
            match fa.cmp(&fb) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        la.cmp(&lb)
    }

    fn is_word_char(&self, b: u8) -> bool {
        b.is_ascii_alphanumeric() || b == b'_'
    }

    fn fold(&self, b: u8) -> u8 {
        b.to_ascii_lowercase()
    }

    fn name(&self) -> &'static str {
        "case_fold_ascii"
    }
}

/// UTF-8 case-insensitive collation that folds ASCII and passes multi-byte
/// sequences through unchanged (spec.md §4.4 notes UCS2/UTF16/UTF32
/// stopword comparisons fall back to latin1 — we mirror that by treating
/// non-ASCII bytes as opaque for folding purposes).
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8CiCollation;

impl Collation for Utf8CiCollation {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        CaseFoldCollation.compare(a, b)
    }

    fn is_word_char(&self, b: u8) -> bool {
        b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
    }

    fn fold(&self, b: u8) -> u8 {
        if b < 0x80 {
            b.to_ascii_lowercase()
        } else {
            b
        }
    }

    fn name(&self) -> &'static str {
        "utf8_ci"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_fold_orders_ignoring_case() {
        let c = CaseFoldCollation;
        assert_eq!(c.compare(b"Apple", b"apple"), Ordering::Equal);
        assert_eq!(c.compare(b"Apple", b"Banana"), Ordering::Less);
    }

    #[test]
    fn binary_is_strict() {
        let c = BinaryCollation;
        assert_ne!(c.compare(b"Apple", b"apple"), Ordering::Equal);
    }
}
