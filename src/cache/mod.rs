//! `KeyCache`: a pinned, shared page cache with per-buffer latching
//! (spec.md §4.3).
//!
//! The cache is process-wide and shared across every index of a table
//! (and, in principle, across tables); the per-index logical-shape lock
//! (`key_root_lock` in spec.md's terms) is owned by [`crate::btree::BTree`]
//! itself, not by the cache, since the cache has no notion of "index".
//! `KeyCache` only knows about pages: fetch them pinned, let callers
//! mutate behind the returned lock, and flush dirty pages back to the
//! backing [`FileIo`] under one of four policies.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::error::{PackTreeError, Result};
use crate::page::PageBuf;
use crate::primitives::io::FileIo;
use crate::types::PageId;

/// How [`KeyCache::flush`] should treat resident pages (spec.md §4.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushPolicy {
    /// Write dirty pages, then drop them from the cache.
    Release,
    /// Write dirty pages, keep them resident.
    Keep,
    /// Drop dirty pages without writing them (abandon in-flight changes).
    IgnoreChanged,
    /// Write every resident page regardless of its dirty bit.
    ForceWrite,
}

type Slot = Arc<RwLock<PageBuf>>;

struct Shared {
    io: Arc<dyn FileIo>,
    block_length: u32,
    base_offset: u64,
    file_length_pages: AtomicU64,
    entries: Mutex<LruCache<PageId, Slot>>,
    dirty: Mutex<HashSet<PageId>>,
}

/// A pinned, shared reference to one page's buffer. Dropping it releases
/// the pin implicitly (the cache entry, not this handle, owns the
/// buffer); call [`KeyCache::mark_dirty`] after writing through it.
pub type PageHandle = Slot;

/// Process-wide page cache (spec.md §4.3).
pub struct KeyCache {
    shared: Arc<Shared>,
}

impl KeyCache {
    /// Opens a cache over `io`, whose pages are `block_length` bytes each
    /// starting at `base_offset` (past the index file's fixed header,
    /// spec.md §6). `capacity` bounds the number of resident pages.
    pub fn new(io: Arc<dyn FileIo>, block_length: u32, base_offset: u64, capacity: usize) -> Result<Self> {
        let file_len = io.len()?;
        let file_length_pages = file_len.saturating_sub(base_offset) / block_length as u64;
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Ok(Self {
            shared: Arc::new(Shared {
                io,
                block_length,
                base_offset,
                file_length_pages: AtomicU64::new(file_length_pages),
                entries: Mutex::new(LruCache::new(capacity)),
                dirty: Mutex::new(HashSet::new()),
            }),
        })
    }

    fn offset_of(&self, page_id: PageId) -> u64 {
        self.shared.base_offset + page_id.0 as u64 * self.shared.block_length as u64
    }

    /// Returns a pinned, shared handle to `page_id`, reading it from disk
    /// on first access. `for_update` only affects the caller's intent
    /// (whether they intend to call [`mark_dirty`](Self::mark_dirty)); the
    /// returned handle's inner `RwLock` is the actual latch.
    pub fn fetch(&self, page_id: PageId, _for_update: bool) -> Result<PageHandle> {
        if let Some(slot) = self.shared.entries.lock().get(&page_id) {
            return Ok(slot.clone());
        }
        let mut buf = vec![0u8; self.shared.block_length as usize];
        self.shared.io.read_at(self.offset_of(page_id), &mut buf)?;
        let slot: Slot = Arc::new(RwLock::new(buf));
        self.shared.entries.lock().put(page_id, slot.clone());
        Ok(slot)
    }

    /// Marks `page_id` dirty; `flush` will write it back under any policy
    /// except [`FlushPolicy::IgnoreChanged`].
    pub fn mark_dirty(&self, page_id: PageId) {
        self.shared.dirty.lock().insert(page_id);
    }

    /// Allocates a fresh all-zero page at the end of the file (callers
    /// wanting delete-chain reuse should check the chain themselves before
    /// calling this; see `btree::BTree::allocate_page`).
    pub fn allocate_page(&self) -> Result<PageId> {
        let page_no = self.shared.file_length_pages.fetch_add(1, AtomicOrdering::SeqCst);
        let page_id = PageId(u32::try_from(page_no).map_err(|_| PackTreeError::FileFull("index file exceeds 2^32 pages"))?);
        let buf = vec![0u8; self.shared.block_length as usize];
        let slot: Slot = Arc::new(RwLock::new(buf));
        self.shared.entries.lock().put(page_id, slot);
        self.mark_dirty(page_id);
        Ok(page_id)
    }

    /// Number of pages the backing file currently spans.
    pub fn file_length_pages(&self) -> u64 {
        self.shared.file_length_pages.load(AtomicOrdering::SeqCst)
    }

    /// Writes dirty pages back to `io` and, depending on `policy`, evicts
    /// or retains them (spec.md §4.3).
    pub fn flush(&self, policy: FlushPolicy) -> Result<()> {
        match policy {
            FlushPolicy::IgnoreChanged => {
                self.shared.dirty.lock().clear();
            }
            FlushPolicy::Keep | FlushPolicy::Release => {
                let dirty: Vec<PageId> = self.shared.dirty.lock().drain().collect();
                for page_id in dirty {
                    self.write_back(page_id)?;
                }
            }
            FlushPolicy::ForceWrite => {
                let resident: Vec<PageId> = {
                    let entries = self.shared.entries.lock();
                    entries.iter().map(|(id, _)| *id).collect()
                };
                for page_id in resident {
                    self.write_back(page_id)?;
                }
                self.shared.dirty.lock().clear();
            }
        }
        if matches!(policy, FlushPolicy::Release) {
            self.shared.entries.lock().clear();
        }
        self.shared.io.sync_all()?;
        Ok(())
    }

    /// Drops every resident page without writing it back, and forgets the
    /// dirty set. Used when a reopening reader detects its cached pages no
    /// longer match the file (the invalidation-counter mismatch case).
    pub fn purge(&self) {
        self.shared.entries.lock().clear();
        self.shared.dirty.lock().clear();
    }

    fn write_back(&self, page_id: PageId) -> Result<()> {
        let slot = {
            let mut entries = self.shared.entries.lock();
            entries.get(&page_id).cloned()
        };
        if let Some(slot) = slot {
            let buf = slot.read();
            self.shared.io.write_at(self.offset_of(page_id), &buf)?;
        }
        Ok(())
    }
}

impl Clone for KeyCache {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileIo;
    use tempfile::tempdir;

    fn cache(block_length: u32) -> (tempfile::TempDir, KeyCache) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx.dat");
        let io = Arc::new(StdFileIo::open(&path).unwrap());
        io.truncate(4096).unwrap();
        let cache = KeyCache::new(io, block_length, 0, 16).unwrap();
        (dir, cache)
    }

    #[test]
    fn allocate_then_fetch_roundtrips() {
        let (_dir, cache) = cache(1024);
        let page_id = cache.allocate_page().unwrap();
        {
            let handle = cache.fetch(page_id, true).unwrap();
            handle.write()[0] = 0xAB;
            cache.mark_dirty(page_id);
        }
        cache.flush(FlushPolicy::Keep).unwrap();
        let handle = cache.fetch(page_id, false).unwrap();
        assert_eq!(handle.read()[0], 0xAB);
    }

    #[test]
    fn release_evicts_resident_pages() {
        let (_dir, cache) = cache(1024);
        let page_id = cache.allocate_page().unwrap();
        cache.fetch(page_id, false).unwrap();
        cache.flush(FlushPolicy::Release).unwrap();
        assert!(cache.shared.entries.lock().is_empty());
    }
}
