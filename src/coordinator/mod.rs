//! `Coordinator`: owns one table's external lock and persisted state
//! header, on top of [`crate::primitives::concurrency::SingleWriter`].
//!
//! On first write lock, stamps `open_count`/`unique`/`update_count` and
//! marks the table changed; on last unlock, flushes the key cache and
//! writes the state header back. On a read-lock transition through 0→1,
//! the header is reloaded from disk and the cache purged if an
//! invalidation counter moved — another process may have repaired or
//! rewritten the table between this process's locks.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::{FlushPolicy, KeyCache};
use crate::error::Result;
use crate::primitives::concurrency::{ReaderGuard, SingleWriter, WriterGuard};
use crate::types::StateInfo;

/// Coordinates external locking and state-header I/O for one table file.
pub struct Coordinator {
    lock: SingleWriter,
    cache: Arc<KeyCache>,
    flush_policy: FlushPolicy,
    header: Mutex<HeaderSlot>,
    state_offset: u64,
    io: Arc<dyn crate::primitives::io::FileIo>,
}

struct HeaderSlot {
    state: StateInfo,
    /// Reader count observed the last time this process reloaded the
    /// header; used to detect the 0→1 reader transition.
    active_readers: u32,
    changed: bool,
}

/// RAII guard returned by [`Coordinator::with_read`]; reloads the header
/// on construction if this is the first reader, and carries no special
/// behavior on drop beyond releasing the external lock.
pub struct ReadSession<'a> {
    _reader: ReaderGuard,
    coordinator: &'a Coordinator,
}

impl<'a> ReadSession<'a> {
    pub fn state(&self) -> StateInfo {
        self.coordinator.header.lock().state.clone()
    }
}

/// RAII guard returned by [`Coordinator::with_write`]; on drop, flushes
/// the key cache and writes the state header back if this was the last
/// writer (the external lock is released after, by `WriterGuard`'s own
/// drop).
pub struct WriteSession<'a> {
    _writer: WriterGuard,
    coordinator: &'a Coordinator,
}

impl<'a> WriteSession<'a> {
    pub fn state(&self) -> StateInfo {
        self.coordinator.header.lock().state.clone()
    }

    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut StateInfo) -> R) -> R {
        let mut guard = self.coordinator.header.lock();
        let result = f(&mut guard.state);
        guard.changed = true;
        result
    }
}

impl<'a> Drop for WriteSession<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.coordinator.finish_write() {
            debug!(error = %e, "coordinator: failed to flush/persist state header on writer release");
        }
    }
}

impl Coordinator {
    /// Opens (or creates) the external lock file at `lock_path`, wrapping
    /// `cache` (the table's shared key cache) and `io` (the index file,
    /// for state-header persistence at `state_offset`).
    pub fn open(
        lock_path: impl AsRef<std::path::Path>,
        cache: Arc<KeyCache>,
        io: Arc<dyn crate::primitives::io::FileIo>,
        state_offset: u64,
        flush_policy: FlushPolicy,
        initial_state: StateInfo,
    ) -> Result<Self> {
        let lock = SingleWriter::open(lock_path)?;
        Ok(Self {
            lock,
            cache,
            flush_policy,
            header: Mutex::new(HeaderSlot { state: initial_state, active_readers: 0, changed: false }),
            state_offset,
            io,
        })
    }

    /// Acquires a read lock. On the 0→1 reader transition, reloads the
    /// header from disk and purges the key cache if `update_count` moved
    /// (another process wrote since this process's last reload).
    pub fn with_read(&self) -> Result<ReadSession<'_>> {
        let reader = self.lock.acquire_reader()?;
        let snapshot = self.lock.snapshot();
        if snapshot.readers == 1 && !self.lock.snapshot().writer {
            self.reload_if_stale()?;
        }
        Ok(ReadSession { _reader: reader, coordinator: self })
    }

    /// Acquires the write lock. On first acquisition for this table since
    /// open, stamps `open_count`/`unique`/`update_count` and marks the
    /// header changed so a subsequent crash is detectable on reopen.
    pub fn with_write(&self) -> Result<WriteSession<'_>> {
        let writer = self.lock.acquire_writer()?;
        {
            let mut guard = self.header.lock();
            guard.state.open_count = guard.state.open_count.saturating_add(1);
            guard.state.unique = guard.state.unique.wrapping_add(1);
            guard.state.update_count = guard.state.update_count.wrapping_add(1);
            guard.state.process = std::process::id();
            guard.changed = true;
        }
        Ok(WriteSession { _writer: writer, coordinator: self })
    }

    fn reload_if_stale(&self) -> Result<()> {
        let on_disk = self.read_header_from_disk()?;
        let mut guard = self.header.lock();
        if on_disk.update_count != guard.state.update_count {
            info!(
                was = guard.state.update_count,
                now = on_disk.update_count,
                "coordinator: state header changed on disk, purging key cache"
            );
            self.cache.purge();
            guard.state = on_disk;
        }
        Ok(())
    }

    fn finish_write(&self) -> Result<()> {
        let snapshot = self.lock.snapshot();
        if snapshot.writer {
            // Another writer (re-entrant acquisition is rejected by
            // `SingleWriter`, so this only happens if a second table
            // handle shares this coordinator) still holds the lock.
            return Ok(());
        }
        self.cache.flush(self.flush_policy)?;
        let mut guard = self.header.lock();
        if guard.changed {
            self.write_header_to_disk(&guard.state)?;
            guard.changed = false;
        }
        Ok(())
    }

    fn read_header_from_disk(&self) -> Result<StateInfo> {
        let len = self.io.len()?;
        if len < self.state_offset {
            return Ok(StateInfo::new(guess_num_indexes(&self.header.lock().state)));
        }
        let mut buf = vec![0u8; (len - self.state_offset) as usize];
        self.io.read_at(self.state_offset, &mut buf)?;
        StateInfo::from_bytes(&buf)
    }

    fn write_header_to_disk(&self, state: &StateInfo) -> Result<()> {
        let bytes = state.to_bytes();
        self.io.write_at(self.state_offset, &bytes)?;
        self.io.sync_all()
    }

    /// Current lock occupancy, for diagnostics.
    pub fn lock_snapshot(&self) -> crate::primitives::concurrency::LockSnapshot {
        self.lock.snapshot()
    }
}

fn guess_num_indexes(state: &StateInfo) -> usize {
    state.roots.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileIo;
    use tempfile::tempdir;

    fn coordinator(dir: &tempfile::TempDir) -> Coordinator {
        let io = Arc::new(StdFileIo::open(dir.path().join("idx.dat")).unwrap());
        io.truncate(4096).unwrap();
        let cache = Arc::new(KeyCache::new(io.clone(), 4096, 4096, 16).unwrap());
        Coordinator::open(dir.path().join("idx.lock"), cache, io, 0, FlushPolicy::Keep, StateInfo::new(2)).unwrap()
    }

    #[test]
    fn write_session_stamps_header_and_persists_on_drop() {
        let dir = tempdir().unwrap();
        let coord = coordinator(&dir);
        {
            let session = coord.with_write().unwrap();
            session.with_state_mut(|s| s.records = 7);
            assert_eq!(session.state().open_count, 1);
        }
        let reloaded = coord.read_header_from_disk().unwrap();
        assert_eq!(reloaded.records, 7);
        assert_eq!(reloaded.open_count, 1);
    }

    #[test]
    fn read_lock_reloads_header_on_first_reader() {
        let dir = tempdir().unwrap();
        let coord = coordinator(&dir);
        {
            let session = coord.with_write().unwrap();
            session.with_state_mut(|s| s.records = 3);
        }
        let read = coord.with_read().unwrap();
        assert_eq!(read.state().records, 3);
    }

    #[test]
    fn second_writer_is_rejected_while_first_holds_lock() {
        let dir = tempdir().unwrap();
        let coord = coordinator(&dir);
        let _first = coord.with_write().unwrap();
        assert!(coord.with_write().is_err());
    }
}
