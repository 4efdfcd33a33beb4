//! Tunable knobs for opening and operating on a table: key cache sizing,
//! flush policy, repair sort buffers, and the default collation/stopword
//! source. Grouped the way the teacher groups its own `db::Config`: one
//! struct, a handful of named presets instead of a builder.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::FlushPolicy;
use crate::types::Collation;

/// `TMPDIR`-style colon-separated directory list (spec.md §6
/// "Environment") read from `PACKTREE_TMPDIR`, falling back to
/// [`std::env::temp_dir`] when unset or empty.
pub fn temp_dirs_from_env() -> Vec<PathBuf> {
    match std::env::var_os("PACKTREE_TMPDIR") {
        Some(val) => {
            let dirs: Vec<PathBuf> = std::env::split_paths(&val).filter(|p| !p.as_os_str().is_empty()).collect();
            if dirs.is_empty() {
                vec![std::env::temp_dir()]
            } else {
                dirs
            }
        }
        None => vec![std::env::temp_dir()],
    }
}

/// Which stopword source a freshly opened table should use.
#[derive(Debug, Clone)]
pub enum StopwordSource {
    /// The built-in ~36-word English list.
    Builtin,
    /// Read one word per line from this path.
    File(std::path::PathBuf),
    /// No stopwords at all.
    None,
}

/// Tunable knobs for a `packtree` table.
#[derive(Clone)]
pub struct Config {
    /// Maximum resident pages in the shared `KeyCache`.
    pub key_cache_pages: usize,
    /// Policy applied when the coordinator flushes on unlock.
    pub flush_policy: FlushPolicy,
    /// In-memory sort buffer size (bytes) before `Repair` spills `BUFFPEK`
    /// runs to a temp file.
    pub sort_buffer_bytes: usize,
    /// Read-ahead buffer size (bytes) for Repair's data-file scan.
    pub read_buffer_bytes: usize,
    /// Write buffer size (bytes) for Repair's rebuilt data file.
    pub write_buffer_bytes: usize,
    /// Directories `Repair` round-robins `BUFFPEK` spill runs across
    /// (spec.md §6 "Environment": a `TMPDIR`-style multi-path list).
    pub temp_dirs: Vec<PathBuf>,
    /// Default collation applied to segments that don't specify one.
    pub default_collation: Arc<dyn Collation>,
    /// Stopword source consulted when opening a fulltext index.
    pub stopwords: StopwordSource,
    /// Minimum word length kept by the tokenizer.
    pub min_word_len: usize,
    /// Maximum word length kept by the tokenizer.
    pub max_word_len: usize,
    /// Word-document count past which `FTIndex` promotes a word's entries
    /// into an FT2 subtree.
    pub ft2_promote_threshold: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("key_cache_pages", &self.key_cache_pages)
            .field("flush_policy", &self.flush_policy)
            .field("sort_buffer_bytes", &self.sort_buffer_bytes)
            .field("read_buffer_bytes", &self.read_buffer_bytes)
            .field("write_buffer_bytes", &self.write_buffer_bytes)
            .field("temp_dirs", &self.temp_dirs)
            .field("default_collation", &self.default_collation.name())
            .field("stopwords", &self.stopwords)
            .field("min_word_len", &self.min_word_len)
            .field("max_word_len", &self.max_word_len)
            .field("ft2_promote_threshold", &self.ft2_promote_threshold)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_cache_pages: 8192,
            flush_policy: FlushPolicy::Keep,
            sort_buffer_bytes: 8 * 1024 * 1024,
            read_buffer_bytes: 256 * 1024,
            write_buffer_bytes: 256 * 1024,
            temp_dirs: temp_dirs_from_env(),
            default_collation: Arc::new(crate::types::Utf8CiCollation),
            stopwords: StopwordSource::Builtin,
            min_word_len: 4,
            max_word_len: 84,
            ft2_promote_threshold: 64,
        }
    }
}

impl Config {
    /// Large cache, force-write on every unlock: favors read throughput and
    /// crash safety over write latency.
    pub fn durable() -> Self {
        Self {
            key_cache_pages: 32768,
            flush_policy: FlushPolicy::ForceWrite,
            ..Self::default()
        }
    }

    /// Sized for `Repair`'s bulk-load path: large sort/read/write buffers,
    /// cache flushed only on release since the whole table is being
    /// rewritten in one pass.
    pub fn bulk_load() -> Self {
        Self {
            key_cache_pages: 4096,
            flush_policy: FlushPolicy::Release,
            sort_buffer_bytes: 64 * 1024 * 1024,
            read_buffer_bytes: 4 * 1024 * 1024,
            write_buffer_bytes: 4 * 1024 * 1024,
            ..Self::default()
        }
    }

    /// Minimal cache and no stopwords, for quick one-off checks where
    /// peak memory matters more than throughput.
    pub fn lightweight() -> Self {
        Self {
            key_cache_pages: 256,
            sort_buffer_bytes: 512 * 1024,
            read_buffer_bytes: 32 * 1024,
            write_buffer_bytes: 32 * 1024,
            stopwords: StopwordSource::None,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_differ_from_default() {
        let default = Config::default();
        let durable = Config::durable();
        assert_ne!(default.key_cache_pages, durable.key_cache_pages);
        assert!(matches!(Config::lightweight().stopwords, StopwordSource::None));
    }
}
