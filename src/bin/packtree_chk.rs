//! `packtree-chk`: check, repair, sort, and analyze a packtree table
//! (spec.md §6).
//!
//! A table is one key file (`<table>.key`: a fixed-size header page
//! followed by the shared page arena every index's `BTree` lives in), one
//! lock file (`<table>.lock`), and, for anything that touches records, one
//! fixed-width-record data file (`<table>.dat`, `FlatFileRecordStore`'s
//! layout).

use std::path::{Path, PathBuf};
use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};

use packtree::cache::{FlushPolicy, KeyCache};
use packtree::checkutil::{
    CheckOptions, CheckTarget, CheckUtil, ExitCode, IndexHandle, StatsMethod,
};
use packtree::coordinator::{Coordinator, ReadSession, WriteSession};
use packtree::error::{PackTreeError, Result};
use packtree::external::MemRecordStore;
use packtree::fulltext::FTIndex;
use packtree::primitives::io::{FileIo, StdFileIo};
use packtree::repair::{FtTarget, IndexTarget, KeyExtractor, RepairProgress};
use packtree::tokenizer::Tokenizer;
use packtree::types::{
    BinaryCollation, KeyDef, KeyDefBuilder, KeySegment, PageId, RecRef, StateInfo,
};

/// One index's declared shape, parsed from `--index`.
#[derive(Debug, Clone)]
struct IndexSpec {
    fulltext: bool,
    unique: bool,
    seg_type: String,
    len: usize,
}

impl std::str::FromStr for IndexSpec {
    type Err = String;

    /// `type:len[:u][:f]`, e.g. `text:255`, `int4:4:u`, `text:64:f`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let seg_type = parts.next().ok_or("missing segment type")?.to_string();
        let len: usize = parts
            .next()
            .ok_or("missing segment length")?
            .parse()
            .map_err(|_| "segment length must be a positive integer".to_string())?;
        let mut unique = false;
        let mut fulltext = false;
        for flag in parts {
            match flag {
                "u" => unique = true,
                "f" => fulltext = true,
                other => return Err(format!("unknown index flag {other:?}")),
            }
        }
        Ok(IndexSpec { fulltext, unique, seg_type, len })
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatsMethodArg {
    NullsEqual,
    NullsUnequal,
    NullsIgnored,
}

impl From<StatsMethodArg> for StatsMethod {
    fn from(v: StatsMethodArg) -> Self {
        match v {
            StatsMethodArg::NullsEqual => StatsMethod::NullsEqual,
            StatsMethodArg::NullsUnequal => StatsMethod::NullsUnequal,
            StatsMethodArg::NullsIgnored => StatsMethod::NullsIgnored,
        }
    }
}

/// Check, repair, sort, and analyze a packtree table's indexes.
#[derive(Parser, Debug)]
#[command(name = "packtree-chk", version, about, disable_help_subcommand = true)]
struct Cli {
    /// Table base name; reads/writes `<table>.key`, `<table>.lock`, and,
    /// for record-touching operations, `<table>.dat`.
    table: PathBuf,

    /// One index's schema: `type:len[:u][:f]`, repeatable in index-number
    /// order. `type` is one of `text`, `binary`, `int1`, `int2`, `int4`,
    /// `int8`; `u` marks the index unique; `f` builds it as a full-text
    /// word index instead (ignoring `type`/`len`).
    #[arg(long = "index", value_name = "SPEC", required = true)]
    index: Vec<IndexSpec>,

    /// Page size shared by every index in this table's key file.
    #[arg(long, default_value_t = 4096)]
    block_length: u32,

    /// Width in bytes of the `RecRef` suffix carried by every key entry.
    #[arg(long, default_value_t = 4)]
    recref_width: usize,

    /// Fixed record width of the data file; required by `-r`/`-o`/`-n`/`-S`/`-R`.
    #[arg(long, value_name = "BYTES")]
    record_len: Option<u64>,

    /// Check every active index's ordering (the default when no other
    /// operation flag is given).
    #[arg(short = 'c', long)]
    check: bool,

    /// Extended check: also walk every internal page, not just the leaf chain.
    #[arg(short = 'e', long)]
    extended: bool,

    /// Repair every active index by rescanning the data file.
    #[arg(short = 'r', long)]
    repair: bool,

    /// Repair, forcing the thorough (non-quick) path.
    #[arg(short = 'o', long = "safe-recover")]
    safe_recover: bool,

    /// Repair using the sort-based rebuild path (this build's only path).
    #[arg(short = 'n', long = "sort-recover")]
    sort_recover: bool,

    /// Parallel repair by sort. Rejected: this build's `Repair` has no
    /// parallel master/worker path (spec.md §9's shared-IO-cache pattern);
    /// rerun with `-n`/`--sort-recover` for the sequential sort-recover path.
    #[arg(short = 'p', long = "parallel-recover")]
    parallel_recover: bool,

    /// Quick: skip the full data-file scan when the requested operation allows it.
    #[arg(short = 'q', long)]
    quick: bool,

    /// Analyze: report per-index key-part cardinality.
    #[arg(short = 'a', long)]
    analyze: bool,

    /// Rebuild one index with its pages laid out in key order.
    #[arg(short = 'S', long = "sort-index", value_name = "INDEX")]
    sort_index: Option<usize>,

    /// Print the RecRef order records would take if sorted by INDEX.
    #[arg(short = 'R', long = "sort-records", value_name = "INDEX")]
    sort_records: Option<usize>,

    /// Persist the rebuilt state header once the run finishes.
    #[arg(short = 'U', long = "update-state")]
    update_state: bool,

    /// Never write anything back (state header included).
    #[arg(short = 'T', long = "read-only")]
    read_only: bool,

    /// Copy the data file aside (`<table>.dat.bak`) before a repair touches it.
    #[arg(short = 'B', long = "backup")]
    backup: bool,

    /// Restrict the active key set to this bitmask.
    #[arg(short = 'k', long = "key-mask", value_name = "MASK")]
    key_mask: Option<u64>,

    /// Bump auto_increment; with no value, to one past the largest key seen.
    #[arg(short = 'A', long = "auto-increment", num_args = 0..=1, default_missing_value = "0", value_name = "VALUE")]
    auto_increment: Option<u64>,

    #[arg(long, value_enum, default_value_t = StatsMethodArg::NullsEqual)]
    stats_method: StatsMethodArg,

    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    sort_buffer_size: usize,

    #[arg(long, default_value_t = 256 * 1024)]
    read_buffer_size: usize,

    #[arg(long, default_value_t = 256 * 1024)]
    write_buffer_size: usize,

    #[arg(long, default_value_t = 8192)]
    key_buffer_size: usize,

    #[arg(long, default_value = "info", env = "PACKTREE_LOG")]
    log_level: String,
}

fn key_def_for_spec(spec: &IndexSpec, block_length: u32, recref_width: usize) -> Result<KeyDef> {
    let collation = Arc::new(BinaryCollation);
    let segment = match spec.seg_type.as_str() {
        "text" => KeySegment::var_text(spec.len, collation),
        "binary" => KeySegment::fixed_binary(spec.len),
        "int1" => KeySegment::int(1),
        "int2" => KeySegment::int(2),
        "int4" => KeySegment::int(4),
        "int8" => KeySegment::int(8),
        _ => return Err(PackTreeError::Invalid("unknown index type (expected text, binary, int1, int2, int4, or int8)")),
    };
    let mut builder = KeyDefBuilder::new(block_length, recref_width).segment(segment);
    if spec.unique {
        builder = builder.unique();
    }
    builder.build()
}

fn word_key_def(max_word_len: usize, block_length: u32, recref_width: usize) -> Result<KeyDef> {
    KeyDefBuilder::new(block_length, recref_width)
        .segment(KeySegment::var_text(max_word_len, Arc::new(BinaryCollation)))
        .fulltext()
        .build()
}

/// Loads a `FlatFileRecordStore`-layout data file into an in-memory store,
/// preserving `RecRef` identity (`Repair` only operates on `MemRecordStore`;
/// see DESIGN.md).
fn load_mem_store(path: &Path, record_len: u64) -> Result<MemRecordStore> {
    let io = StdFileIo::open(path)?;
    let slot_len = record_len + 1;
    let file_len = io.len()?;
    let store = MemRecordStore::new();
    let slots = file_len / slot_len;
    for slot_no in 0..slots {
        let mut buf = vec![0u8; slot_len as usize];
        io.read_at(slot_no * slot_len, &mut buf)?;
        let recref = RecRef(slot_no + 1);
        match buf[0] {
            1 => store.insert_at(recref, buf[1..].to_vec()),
            _ => store.mark_deleted_at(recref),
        }
    }
    Ok(store)
}

struct CliProgress;
impl RepairProgress for CliProgress {
    fn on_phase(&self, phase: &str) {
        tracing::info!(phase, "repair phase");
    }
    fn on_record_scanned(&self, scanned: u64, skipped: u64) {
        tracing::debug!(scanned, skipped, "repair scan progress");
    }
}

/// Either lock kind `run` might hold, unified so one session can be kept
/// alive for the whole operation and released (persisting the header, for
/// a write session) only once the run is complete.
enum Session<'a> {
    Read(ReadSession<'a>),
    Write(WriteSession<'a>),
}

impl<'a> Session<'a> {
    fn state(&self) -> StateInfo {
        match self {
            Session::Read(s) => s.state(),
            Session::Write(s) => s.state(),
        }
    }

    fn persist(&self, state: &StateInfo) {
        if let Session::Write(w) = self {
            w.with_state_mut(|s| *s = state.clone());
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    if cli.parallel_recover {
        return Err(PackTreeError::Unsupported(
            "-p/--parallel-recover is not implemented in this build; rerun without -p (sort-recover repairs indexes sequentially)",
        ));
    }

    let key_path = cli.table.with_extension("key");
    let lock_path = cli.table.with_extension("lock");
    let data_path = cli.table.with_extension("dat");

    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&key_path)?);
    let cache = Arc::new(KeyCache::new(io.clone(), cli.block_length, cli.block_length as u64, cli.key_buffer_size)?);
    let num_indexes = cli.index.len();
    let coordinator = Coordinator::open(&lock_path, cache.clone(), io, 0, FlushPolicy::Keep, StateInfo::new(num_indexes))?;

    let want_write = cli.repair
        || cli.safe_recover
        || cli.sort_recover
        || cli.sort_index.is_some()
        || cli.update_state
        || cli.auto_increment.is_some();

    // `with_write` never reloads the on-disk header itself (only a reader's
    // 0->1 transition does); take a throwaway read lock first so a write
    // session starts from the real persisted state rather than the empty
    // one `Coordinator::open` was seeded with.
    drop(coordinator.with_read()?);

    // Held for the whole run: a write session must not release the external
    // lock (and persist the header) until every mutation below is done.
    let session = if want_write && !cli.read_only {
        Session::Write(coordinator.with_write()?)
    } else {
        Session::Read(coordinator.with_read()?)
    };
    let state = session.state();

    let mut handles = Vec::with_capacity(num_indexes);
    for (i, spec) in cli.index.iter().enumerate() {
        let root = state.roots.get(i).copied().unwrap_or(PageId::NONE);
        if spec.fulltext {
            let kd = Arc::new(word_key_def(84, cli.block_length, cli.recref_width)?);
            let tokenizer = Tokenizer::new(Arc::new(BinaryCollation), 4, 84);
            let ft = FTIndex::open(kd.clone(), cache.clone(), root, tokenizer.clone(), None, 64);
            let repair_target = cli.record_len.map(|_| IndexTarget {
                key_def: kd.clone(),
                cache: cache.clone(),
                fulltext: Some(FtTarget {
                    ft_key_def: kd,
                    tokenizer,
                    stopwords: None,
                    ft2_threshold: 64,
                    segments: vec![0],
                }),
            });
            handles.push(IndexHandle { target: CheckTarget::FullText(ft), cache: cache.clone(), repair_target });
        } else {
            let kd = Arc::new(key_def_for_spec(spec, cli.block_length, cli.recref_width)?);
            let tree = packtree::btree::BTree::new(kd.clone(), cache.clone(), root, 0);
            let repair_target = cli.record_len.map(|_| IndexTarget { key_def: kd.clone(), cache: cache.clone(), fulltext: None });
            handles.push(IndexHandle { target: CheckTarget::Plain(tree), cache: cache.clone(), repair_target });
        }
    }

    let options = CheckOptions {
        extended: cli.extended,
        quick: cli.quick,
        force_sort_mode: cli.sort_index.is_some(),
        read_only: cli.read_only,
        update_state: cli.update_state,
        backup_data_file: cli.backup,
        key_mask: cli.key_mask,
        auto_increment: cli.auto_increment.map(|v| if v == 0 { None } else { Some(v) }),
        stats_method: cli.stats_method.into(),
        sort_buffer_bytes: cli.sort_buffer_size,
        read_buffer_bytes: cli.read_buffer_size,
        write_buffer_bytes: cli.write_buffer_size,
        temp_dirs: packtree::config::temp_dirs_from_env(),
    };

    // Every caller needs `store` in scope for repair-shaped operations;
    // build it lazily since plain check/describe/analyze never touch it.
    let repairing = cli.repair || cli.safe_recover || cli.sort_recover || cli.sort_index.is_some();
    let store = if repairing {
        let record_len = cli
            .record_len
            .ok_or(PackTreeError::Invalid("--record-len is required for repair/sort-index operations"))?;
        if cli.backup {
            std::fs::copy(&data_path, data_path.with_extension("dat.bak"))?;
        }
        Some(load_mem_store(&data_path, record_len)?)
    } else {
        None
    };

    let mut state = state;
    let mut exit_code = ExitCode::empty();
    let util = CheckUtil::new(store.as_ref().unwrap_or(&EMPTY_STORE), handles, options);

    if let Some(index) = cli.sort_index {
        let extractor: Box<KeyExtractor> = whole_record_extractor(&util);
        let outcome = util.sort_index_pages(index, extractor.as_ref(), &CliProgress)?;
        println!("sort-index {index}: {} live, {} deleted", outcome.scan_report.live_records, outcome.scan_report.deleted_records);
        state.roots[index] = outcome.state.roots[0];
    } else if let Some(index) = cli.sort_records {
        for recref in util.sort_records_by_key(index)? {
            println!("{}", recref.0);
        }
    } else if repairing {
        let extractor: Box<KeyExtractor> = whole_record_extractor(&util);
        let outcome = util.repair_all(extractor.as_ref(), &CliProgress, &state)?;
        println!(
            "repair: {} live, {} deleted, {} corrupt",
            outcome.scan_report.live_records, outcome.scan_report.deleted_records, outcome.scan_report.corrupt_records
        );
        if outcome.scan_report.corrupt_records > 0 {
            exit_code |= ExitCode::DATA_LOST;
        }
        state = outcome.state;
    } else if cli.analyze {
        for row in util.analyze(&state)? {
            println!("index {}: cardinality {:?}", row.index, row.cardinality);
        }
    } else {
        // describe + check is the default operation (spec.md §6).
        for d in util.describe(&state) {
            println!(
                "index {} ({}): enabled={} unique={} segments={} root={:?}",
                d.index, d.kind, d.enabled, d.unique, d.segments, d.root
            );
        }
        let report = util.check(&state);
        for r in &report.per_index {
            match &r.error {
                Some(e) => println!("index {}: FAILED ({e})", r.index),
                None => println!("index {}: OK, {} keys", r.index, r.keys_seen),
            }
        }
        exit_code |= report.exit_code;
    }

    if cli.auto_increment.is_some() && !cli.index.is_empty() {
        util.apply_auto_increment(&mut state, 0)?;
    }

    if cli.update_state && !cli.read_only {
        util.flush_all(FlushPolicy::Keep)?;
        session.persist(&state);
    }
    drop(session);

    Ok(exit_code)
}

/// Placeholder store for operations that never dereference one (describe,
/// check, analyze, sort-records-by-key); `CheckUtil` only touches `store`
/// inside `Repair`, which those paths never call.
static EMPTY_STORE: once_store::OnceStore = once_store::OnceStore::new();

mod once_store {
    use packtree::external::MemRecordStore;
    use std::sync::OnceLock;

    pub struct OnceStore(OnceLock<MemRecordStore>);
    impl OnceStore {
        pub const fn new() -> Self {
            Self(OnceLock::new())
        }
    }
    impl std::ops::Deref for OnceStore {
        type Target = MemRecordStore;
        fn deref(&self) -> &MemRecordStore {
            self.0.get_or_init(MemRecordStore::new)
        }
    }
}

/// Extracts a key by encoding the whole record body against the target
/// index's `KeyDef`; the data-file layout has no column splitting of its
/// own (see `external`'s module docs), so every segment reads the full
/// record. `checkutil` remaps the target-list-local index `Repair` hands
/// back into the original handle index before this is ever called.
fn whole_record_extractor<'a>(util: &'a CheckUtil<'_>) -> Box<KeyExtractor<'a>> {
    Box::new(move |index, recref, bytes| {
        let tree = match util.repair_target(index) {
            Some(target) => target,
            None => return None,
        };
        let mut out = Vec::new();
        target_key_def(tree).encode(&[Some(bytes)], recref, &mut out).ok()?;
        Some(out)
    })
}

fn target_key_def(target: &IndexTarget) -> &KeyDef {
    &target.key_def
}

fn main() -> ProcessExitCode {
    let cli = Cli::parse();
    let _ = packtree::logging::init_logging(&cli.log_level);
    match run(&cli) {
        Ok(code) => ProcessExitCode::from(code.bits()),
        Err(e) => {
            tracing::error!(error = %e, "packtree-chk failed");
            eprintln!("packtree-chk: {e}");
            ProcessExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_spec_parses_flags() {
        let spec: IndexSpec = "text:255:u".parse().unwrap();
        assert_eq!(spec.seg_type, "text");
        assert_eq!(spec.len, 255);
        assert!(spec.unique);
        assert!(!spec.fulltext);
    }

    #[test]
    fn index_spec_rejects_unknown_flag() {
        assert!("text:255:z".parse::<IndexSpec>().is_err());
    }
}
