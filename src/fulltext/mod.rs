//! Full-text indexing and query evaluation built on top of [`crate::btree`].
//!
//! Three collaborators: [`index::FTIndex`] maintains the on-disk word
//! index as records are inserted/updated/deleted, [`boolean::FTBoolEval`]
//! answers boolean (`+word -word "phrase"`) queries against it, and
//! [`nlq::FTNLQEval`] answers natural-language relevance queries. All
//! three share the weighting constants below.

pub mod boolean;
pub mod index;
pub mod nlq;

pub use boolean::{ExplainPlan, FTBoolEval};
pub use index::FTIndex;
pub use nlq::FTNLQEval;

/// Pivot value for the leaf-weight normalization divisor: `NORM = 1 +
/// PIVOT_VAL * uniq_word_count`.
pub const PIVOT_VAL: f32 = 0.0115;

/// Local weight scale for a word occurring `count` times in one record:
/// `LWS(count) = ln(count) + 1` for `count > 0`, else `0`.
pub fn lws(count: u32) -> f32 {
    if count == 0 {
        0.0
    } else {
        (count as f32).ln() + 1.0
    }
}

/// Weight placeholder assigned to a document re-inserted as a plain entry
/// after an FT2 subtree demotes below the promotion threshold — the
/// subtree only ever stored bare `RecRef`s, so the original per-document
/// weight is unrecoverable.
pub const DEMOTED_WEIGHT: f32 = 1.0;

/// Sentinel relevance returned by natural-language evaluation for a query
/// term with zero matching documents, distinguishing "never occurs" from
/// "occurs with zero computed weight".
pub const FIND_RELEVANCE_NONE: f32 = -5.0;

/// Safety ceiling on documents visited by a boolean-query sub-match or an
/// NLQ accumulation pass — a runaway-query guard, not a tunable.
pub const DOC_CNT_SAFETY_CAP: u64 = 2_000_000;
