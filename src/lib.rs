//! # packtree - Packed-Key B-Tree and Full-Text Search Engine
//!
//! packtree is an embedded, file-backed storage engine built around a
//! single data structure: a B-tree whose keys are prefix/binary-packed
//! on disk, in the style of a classic ISAM table file. It provides
//! ordered indexing over fixed- and variable-length keys, a full-text
//! search index (boolean and natural-language query modes) built on top
//! of the same B-tree, and the external-lock/repair machinery needed to
//! run it as a standalone table file.
//!
//! ## Quick Start
//!
//! ```rust
//! use packtree::types::{KeyDefBuilder, KeySegment, RecRef};
//! use packtree::types::BinaryCollation;
//! use std::sync::Arc;
//!
//! // Describe one index: a single variable-length text segment.
//! let key_def = KeyDefBuilder::new(4096, 4)
//!     .segment(KeySegment::var_text(255, Arc::new(BinaryCollation)))
//!     .build()?;
//! let mut encoded = Vec::new();
//! key_def.encode(&[Some(b"hello")], RecRef(1), &mut encoded)?;
//! # Ok::<(), packtree::error::PackTreeError>(())
//! ```
//!
//! ## Architecture
//!
//! packtree is layered bottom-up:
//! - **`types`**: `KeyDef`/`KeySegment` schema, `RecRef`, `PageId`, collations.
//! - **`page`**: `PageCodec` — prefix/binary-packed key encode/decode within
//!   one fixed-size page.
//! - **`cache`**: `KeyCache` — a pinned, shared page cache.
//! - **`btree`**: `BTree` — search/insert/delete/split/underflow-merge over
//!   an index's pages.
//! - **`primitives`**: byte, I/O, and concurrency primitives shared by the
//!   layers above.
//! - **`config`**: `Config` — key cache sizing, flush policy, sort buffers,
//!   default collation, stopword source.
//! - **`external`**: `RecordStore` — the data-file collaborator seam, with
//!   in-memory and flat-file implementations for tests and fixtures.
//! - **`tokenizer`**: word-boundary scanning (`simple_scan`) and the boolean
//!   query mini-lexer (`boolean_scan`), plus the stopword set.
//! - **`fulltext`**: `FTIndex` (word-tree linearization, FT2 promotion),
//!   `FTBoolEval` (boolean query evaluation), `FTNLQEval` (natural-language
//!   query evaluation).
//! - **`repair`**: external merge sort and full index/data-file rebuild.
//! - **`coordinator`**: external file locking and persisted state-header I/O.
//! - **`checkutil`**: the check/repair/sort/analyze driver behind
//!   `packtree-chk`.

pub mod btree;
pub mod cache;
pub mod checkutil;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod external;
pub mod fulltext;
pub mod logging;
pub mod page;
pub mod primitives;
pub mod repair;
pub mod tokenizer;
pub mod types;

pub use crate::error::{PackTreeError, Result};
