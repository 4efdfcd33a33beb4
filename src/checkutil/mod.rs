//! `CheckUtil`: drives descriptive, check, repair, sort, and analyze
//! operations over a table's indexes (spec.md §4.9, §6).
//!
//! This is the one collaborator in the core whose whole job is to be
//! driven by a CLI (`packtree-chk`, spec.md §6's flag table): every other
//! module exposes operations a caller invokes directly; `CheckUtil` just
//! sequences calls into [`crate::btree::BTree`], [`crate::fulltext::FTIndex`],
//! and [`crate::repair::Repair`] the way `myisamchk` sequences calls into
//! its own tree/record-cache internals, and packages the result into the
//! bitwise exit code spec.md §6 defines.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

pub use crate::btree::StatsMethod;
use crate::btree::{BTree, PageWalkStats};
use crate::cache::{FlushPolicy, KeyCache};
use crate::error::{PackTreeError, Result};
use crate::external::MemRecordStore;
use crate::fulltext::FTIndex;
use crate::repair::{IndexTarget, KeyExtractor, Repair, RepairOutcome, RepairProgress};
use crate::types::StateInfo;

bitflags::bitflags! {
    /// Bitwise-ORed process exit status (spec.md §6 "Exit codes"): 0 is OK,
    /// anything else is the OR of these hints to the caller.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ExitCode: u8 {
        /// A record or key was unrecoverable; the rebuilt table is missing data.
        const DATA_LOST = 0b001;
        /// The caller should retry the failed operation without `-q` (quick mode).
        const RETRY_WITHOUT_QUICK = 0b010;
        /// The caller should retry with a full repair rather than the attempted mode.
        const RETRY_REPAIR = 0b100;
    }
}

/// What kind of index a [`IndexHandle`] wraps: a plain `BTree` or a
/// full-text index (whose tree lives inside an [`FTIndex`]).
pub enum CheckTarget {
    Plain(BTree),
    FullText(FTIndex),
}

impl CheckTarget {
    fn tree(&self) -> &BTree {
        match self {
            CheckTarget::Plain(tree) => tree,
            CheckTarget::FullText(ft) => ft.tree(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            CheckTarget::Plain(_) => "plain",
            CheckTarget::FullText(_) => "fulltext",
        }
    }
}

/// One index as `CheckUtil` sees it: the tree to operate on, the cache it
/// lives in (for `flush_all`), and, when available, the recipe `Repair`
/// needs to rebuild it from scratch.
pub struct IndexHandle {
    pub target: CheckTarget,
    pub cache: Arc<KeyCache>,
    /// `None` for an index this run can check and analyze but not repair
    /// (no extraction recipe supplied by the caller).
    pub repair_target: Option<IndexTarget>,
}

/// Per-index summary returned by [`CheckUtil::describe`] (spec.md §6
/// "Descriptive" operation).
#[derive(Debug, Clone)]
pub struct IndexDescription {
    pub index: usize,
    pub kind: &'static str,
    pub enabled: bool,
    pub root: crate::types::PageId,
    pub segments: usize,
    pub unique: bool,
}

/// Result of [`CheckUtil::check`] (spec.md §6 `-c`/`-e`).
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub per_index: Vec<IndexCheckResult>,
    pub exit_code: ExitCode,
}

#[derive(Debug, Clone)]
pub struct IndexCheckResult {
    pub index: usize,
    pub keys_seen: u64,
    pub page_walk: Option<PageWalkStats>,
    pub error: Option<String>,
}

/// Result row of [`CheckUtil::analyze`] (spec.md §6 `-a`, `--stats_method`).
#[derive(Debug, Clone)]
pub struct IndexCardinality {
    pub index: usize,
    /// `cardinality[i]` is the distinct-value count over the first `i + 1`
    /// segments taken together.
    pub cardinality: Vec<u64>,
}

/// Which indexes and files one invocation of `CheckUtil` should touch,
/// collecting every flag from spec.md §6's CLI surface table.
#[derive(Debug, Clone)]
pub struct CheckOptions {
    /// `-e`: also walk every internal page, not just the leaf chain.
    pub extended: bool,
    /// `-q`: skip the data-file scan a non-quick repair would otherwise do.
    pub quick: bool,
    /// `-S`: treat this run as a sort-index-pages pass.
    pub force_sort_mode: bool,
    /// `-T`: never write anything back (state header included).
    pub read_only: bool,
    /// `-U`: persist the rebuilt state header once the run finishes.
    pub update_state: bool,
    /// `-B`: back up the data file before a repair touches it.
    pub backup_data_file: bool,
    /// `-k <mask>`: restrict the active key set, intersected with the
    /// table's own `key_map`.
    pub key_mask: Option<u64>,
    /// `-A [v]`: `Some(None)` means "max key + 1"; `Some(Some(v))` pins an
    /// explicit floor.
    pub auto_increment: Option<Option<u64>>,
    pub stats_method: StatsMethod,
    pub sort_buffer_bytes: usize,
    pub read_buffer_bytes: usize,
    pub write_buffer_bytes: usize,
    /// Directories a repair round-robins `BUFFPEK` spill runs across
    /// (spec.md §6 "Environment": a `TMPDIR`-style multi-path list).
    pub temp_dirs: Vec<PathBuf>,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            extended: false,
            quick: true,
            force_sort_mode: false,
            read_only: false,
            update_state: true,
            backup_data_file: false,
            key_mask: None,
            auto_increment: None,
            stats_method: StatsMethod::NullsEqual,
            sort_buffer_bytes: 8 * 1024 * 1024,
            read_buffer_bytes: 256 * 1024,
            write_buffer_bytes: 256 * 1024,
            temp_dirs: vec![std::env::temp_dir()],
        }
    }
}

/// Drives check/repair/sort/analyze over one table's indexes (spec.md §4.9).
pub struct CheckUtil<'a> {
    store: &'a MemRecordStore,
    indexes: Vec<IndexHandle>,
    options: CheckOptions,
}

impl<'a> CheckUtil<'a> {
    pub fn new(store: &'a MemRecordStore, indexes: Vec<IndexHandle>, options: CheckOptions) -> Self {
        Self { store, indexes, options }
    }

    /// True when index `i` is live under this run's `-k` mask (spec.md §6).
    fn index_active(&self, i: usize, state: &StateInfo) -> bool {
        if !state.index_enabled(i) {
            return false;
        }
        match self.options.key_mask {
            Some(mask) => (mask >> i) & 1 == 1,
            None => true,
        }
    }

    /// `-c`/descriptive pass: one summary row per index, active or not.
    pub fn describe(&self, state: &StateInfo) -> Vec<IndexDescription> {
        self.indexes
            .iter()
            .enumerate()
            .map(|(i, handle)| {
                let tree = handle.target.tree();
                IndexDescription {
                    index: i,
                    kind: handle.target.kind(),
                    enabled: state.index_enabled(i),
                    root: tree.root(),
                    segments: tree.key_def().segments.len(),
                    unique: tree.key_def().is_unique(),
                }
            })
            .collect()
    }

    /// `-c` (basic) / `-e` (extended, spec.md §6): verify leaf-chain
    /// ordering for every active index, and with `extended` set, also walk
    /// every internal page. Returns `RETRY_WITHOUT_QUICK` if any index
    /// failed to verify; a non-quick run that still finds damage escalates
    /// to `RETRY_REPAIR`.
    pub fn check(&self, state: &StateInfo) -> CheckReport {
        let mut report = CheckReport::default();
        for (i, handle) in self.indexes.iter().enumerate() {
            if !self.index_active(i, state) {
                continue;
            }
            let tree = handle.target.tree();
            let mut result = IndexCheckResult { index: i, keys_seen: 0, page_walk: None, error: None };
            match tree.verify_order() {
                Ok(n) => result.keys_seen = n,
                Err(e) => {
                    warn!(index = i, error = %e, "check: index failed ordering verification");
                    result.error = Some(e.to_string());
                    report.exit_code |= ExitCode::RETRY_WITHOUT_QUICK;
                }
            }
            if self.options.extended && result.error.is_none() {
                match tree.walk_all_pages() {
                    Ok(stats) => result.page_walk = Some(stats),
                    Err(e) => {
                        warn!(index = i, error = %e, "extended check: page walk failed");
                        result.error = Some(e.to_string());
                        report.exit_code |= ExitCode::RETRY_WITHOUT_QUICK;
                    }
                }
            }
            report.per_index.push(result);
        }
        if report.exit_code.contains(ExitCode::RETRY_WITHOUT_QUICK) && !self.options.quick {
            report.exit_code |= ExitCode::RETRY_REPAIR;
        }
        info!(indexes_checked = report.per_index.len(), exit_code = ?report.exit_code, "check complete");
        report
    }

    /// `-a`/`--stats_method` (spec.md §6): per-index, per-key-part
    /// cardinality.
    pub fn analyze(&self, state: &StateInfo) -> Result<Vec<IndexCardinality>> {
        let mut out = Vec::new();
        for (i, handle) in self.indexes.iter().enumerate() {
            if !self.index_active(i, state) {
                continue;
            }
            let tree = handle.target.tree();
            let num_segments = tree.key_def().segments.len();
            let cardinality = tree.cardinalities(num_segments, self.options.stats_method)?;
            out.push(IndexCardinality { index: i, cardinality });
        }
        Ok(out)
    }

    /// `-S` (spec.md §6): "sort index pages" — re-lay an index's pages in
    /// key order for sequential-scan locality. This build has no standalone
    /// in-place page shuffle, so it's expressed as a full rebuild-by-sort of
    /// just that one index through [`Repair`], which already bulk-loads
    /// pages in sorted key order (see DESIGN.md).
    pub fn sort_index_pages(&self, index: usize, extract: &KeyExtractor<'_>, progress: &dyn RepairProgress) -> Result<RepairOutcome> {
        let handle = &self.indexes[index];
        let target = handle
            .repair_target
            .clone()
            .ok_or(PackTreeError::Unsupported("index has no repair recipe"))?;
        // Single-target `Repair` run always calls back with target-list
        // index 0; `extract` is written against the original handle
        // numbering, so translate here too (see `repair_all`).
        let remapped = |_target_list_index: usize, recref: crate::types::RecRef, bytes: &[u8]| extract(index, recref, bytes);
        let repair = Repair::with_temp_dirs(
            self.store,
            vec![target],
            &remapped,
            self.options.sort_buffer_bytes,
            self.options.temp_dirs.clone(),
            progress,
        );
        repair.run(1)
    }

    /// `-R <n>` (spec.md §6): the `RecRef` order records would take if the
    /// data file were physically sorted by index `n`. Returns the order
    /// without rewriting the (out-of-scope, opaque) data file; a caller
    /// doing the actual data-file rewrite drives that separately.
    pub fn sort_records_by_key(&self, index: usize) -> Result<Vec<crate::types::RecRef>> {
        let tree = self.indexes[index].target.tree();
        let mut out = Vec::new();
        let mut result = match tree.search_first() {
            Ok(r) => r,
            Err(PackTreeError::NotFound(_)) => return Ok(out),
            Err(e) => return Err(e),
        };
        loop {
            let (_, recref) = tree.key_def().split_recref(&result.key)?;
            out.push(recref);
            match tree.search_next(&result.cursor)? {
                Some(next) => result = next,
                None => break,
            }
        }
        Ok(out)
    }

    /// `-r`/`-o`/`-p`/`-q`/`-n` (spec.md §4.8, §6): rebuild every active
    /// index by delegating to [`Repair`]. An index with no `repair_target`
    /// recipe is left untouched: its on-disk root and enabled bit carry
    /// over unchanged (spec.md §8 S6).
    ///
    /// `Repair` numbers its targets densely (0..targets.len()), which is not
    /// the same numbering as `self.indexes` once inactive/unrepairable
    /// indexes are skipped; `extract` is written against the original
    /// handle numbering, so it's wrapped here to translate back before
    /// `Repair` ever sees it.
    pub fn repair_all(&self, extract: &KeyExtractor<'_>, progress: &dyn RepairProgress, state: &StateInfo) -> Result<RepairOutcome> {
        let mut targets = Vec::new();
        let mut active_indices = Vec::new();
        for (i, handle) in self.indexes.iter().enumerate() {
            if !self.index_active(i, state) {
                continue;
            }
            if let Some(target) = &handle.repair_target {
                targets.push(target.clone());
                active_indices.push(i);
            }
        }
        let remapped = |target_list_index: usize, recref: crate::types::RecRef, bytes: &[u8]| {
            extract(active_indices[target_list_index], recref, bytes)
        };
        let repair = Repair::with_temp_dirs(
            self.store,
            targets,
            &remapped,
            self.options.sort_buffer_bytes,
            self.options.temp_dirs.clone(),
            progress,
        );
        let mut outcome = repair.run(self.indexes.len())?;

        for (i, original_root) in state.roots.iter().enumerate() {
            if !active_indices.contains(&i) && i < outcome.state.roots.len() {
                outcome.state.roots[i] = *original_root;
                outcome.state.set_index_enabled(i, state.index_enabled(i));
            }
        }
        if self.options.read_only {
            warn!("repair requested under --read-only (-T); state header will not be persisted by this call");
        }
        Ok(outcome)
    }

    /// `-A [v]` (spec.md §6): bump `state.auto_increment` to at least the
    /// requested floor, or to one past the largest key seen in `index` when
    /// no explicit value was given.
    pub fn apply_auto_increment(&self, state: &mut StateInfo, index: usize) -> Result<()> {
        let Some(requested) = self.options.auto_increment else { return Ok(()) };
        let floor = match requested {
            Some(v) => v,
            None => {
                let tree = self.indexes[index].target.tree();
                match tree.search_last() {
                    Ok(result) => {
                        let (_, recref) = tree.key_def().split_recref(&result.key)?;
                        recref.0 + 1
                    }
                    Err(PackTreeError::NotFound(_)) => 1,
                    Err(e) => return Err(e),
                }
            }
        };
        state.auto_increment = state.auto_increment.max(floor);
        Ok(())
    }

    /// `-U` (spec.md §6): flush every index's key cache under `policy`,
    /// the last step before the coordinator writes the state header back.
    pub fn flush_all(&self, policy: FlushPolicy) -> Result<()> {
        for handle in &self.indexes {
            handle.cache.flush(policy)?;
        }
        Ok(())
    }

    /// Per-index repair recipe accessor, for callers wiring a fresh
    /// [`Repair`] run themselves (e.g. `-S` restricted to one index).
    pub fn repair_target(&self, index: usize) -> Option<&IndexTarget> {
        self.indexes[index].repair_target.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileIo;
    use crate::types::{BinaryCollation, KeyDefBuilder, KeySegment, PageId, RecRef, StateInfo};
    use tempfile::tempdir;

    fn plain_index(dir: &tempfile::TempDir, name: &str) -> (Arc<crate::types::KeyDef>, Arc<KeyCache>, BTree) {
        let io = Arc::new(StdFileIo::open(dir.path().join(name)).unwrap());
        io.truncate(0).unwrap();
        let cache = Arc::new(KeyCache::new(io, 4096, 0, 256).unwrap());
        let key_def = Arc::new(
            KeyDefBuilder::new(4096, 4)
                .segment(KeySegment::var_text(64, Arc::new(BinaryCollation)))
                .no_same()
                .build()
                .unwrap(),
        );
        let tree = BTree::new(key_def.clone(), cache.clone(), PageId::NONE, 0);
        (key_def, cache, tree)
    }

    #[test]
    fn check_reports_clean_index_with_no_error() {
        let dir = tempdir().unwrap();
        let store = MemRecordStore::new();
        let (key_def, cache, tree) = plain_index(&dir, "idx0.dat");
        for (w, id) in [("apple", 1u64), ("banana", 2)] {
            let mut key = Vec::new();
            key_def.encode(&[Some(w.as_bytes())], RecRef(id), &mut key).unwrap();
            tree.insert(&key, Vec::new()).unwrap();
        }
        let handle = IndexHandle { target: CheckTarget::Plain(tree), cache, repair_target: None };
        let util = CheckUtil::new(&store, vec![handle], CheckOptions::default());
        let state = StateInfo::new(1);
        let report = util.check(&state);
        assert_eq!(report.exit_code, ExitCode::empty());
        assert_eq!(report.per_index[0].keys_seen, 2);
        assert!(report.per_index[0].error.is_none());
    }

    #[test]
    fn describe_lists_every_index_regardless_of_enabled_state() {
        let dir = tempdir().unwrap();
        let store = MemRecordStore::new();
        let (_kd, cache, tree) = plain_index(&dir, "idx0.dat");
        let handle = IndexHandle { target: CheckTarget::Plain(tree), cache, repair_target: None };
        let util = CheckUtil::new(&store, vec![handle], CheckOptions::default());
        let mut state = StateInfo::new(1);
        state.set_index_enabled(0, false);
        let described = util.describe(&state);
        assert_eq!(described.len(), 1);
        assert!(!described[0].enabled);
    }

    #[test]
    fn analyze_skips_disabled_indexes() {
        let dir = tempdir().unwrap();
        let store = MemRecordStore::new();
        let (key_def, cache, tree) = plain_index(&dir, "idx0.dat");
        for (w, id) in [("apple", 1u64), ("apple", 2), ("banana", 3)] {
            let mut key = Vec::new();
            key_def.encode(&[Some(w.as_bytes())], RecRef(id), &mut key).unwrap();
            tree.insert(&key, Vec::new()).unwrap();
        }
        let handle = IndexHandle { target: CheckTarget::Plain(tree), cache, repair_target: None };
        let util = CheckUtil::new(&store, vec![handle], CheckOptions::default());
        let mut state = StateInfo::new(1);
        let card = util.analyze(&state).unwrap();
        assert_eq!(card[0].cardinality, vec![2]);

        state.set_index_enabled(0, false);
        let card = util.analyze(&state).unwrap();
        assert!(card.is_empty());
    }

    #[test]
    fn sort_records_by_key_returns_ascending_recref_order_for_ascending_keys() {
        let dir = tempdir().unwrap();
        let store = MemRecordStore::new();
        let (key_def, cache, tree) = plain_index(&dir, "idx0.dat");
        for (w, id) in [("apple", 10u64), ("banana", 20), ("cherry", 30)] {
            let mut key = Vec::new();
            key_def.encode(&[Some(w.as_bytes())], RecRef(id), &mut key).unwrap();
            tree.insert(&key, Vec::new()).unwrap();
        }
        let handle = IndexHandle { target: CheckTarget::Plain(tree), cache, repair_target: None };
        let util = CheckUtil::new(&store, vec![handle], CheckOptions::default());
        let order = util.sort_records_by_key(0).unwrap();
        assert_eq!(order, vec![RecRef(10), RecRef(20), RecRef(30)]);
    }

    #[test]
    fn apply_auto_increment_defaults_to_max_plus_one() {
        let dir = tempdir().unwrap();
        let store = MemRecordStore::new();
        let (key_def, cache, tree) = plain_index(&dir, "idx0.dat");
        for (w, id) in [("apple", 5u64), ("banana", 9)] {
            let mut key = Vec::new();
            key_def.encode(&[Some(w.as_bytes())], RecRef(id), &mut key).unwrap();
            tree.insert(&key, Vec::new()).unwrap();
        }
        let handle = IndexHandle { target: CheckTarget::Plain(tree), cache, repair_target: None };
        let mut options = CheckOptions::default();
        options.auto_increment = Some(None);
        let util = CheckUtil::new(&store, vec![handle], options);
        let mut state = StateInfo::new(1);
        util.apply_auto_increment(&mut state, 0).unwrap();
        assert_eq!(state.auto_increment, 10);
    }
}
