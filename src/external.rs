//! The data-file collaborator: everything the core treats as opaque
//! except for `RecRef` interpretation and `read_record`. SQL parsing,
//! dynamic-record compression, and the Huffman-table reader live outside
//! this crate entirely; `RecordStore` is the seam a real data-file
//! implementation would plug into.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{PackTreeError, Result};
use crate::types::RecRef;

/// A record store: opaque byte storage addressed by `RecRef`.
///
/// Implementors are free to interpret `RecRef` however they like (a byte
/// offset, a slot id, ...); this crate only ever round-trips the value it
/// was handed back to this trait.
pub trait RecordStore: Send + Sync {
    /// Fetch the live record at `recref`.
    ///
    /// Returns `Err(NotFound)` for a tombstoned record and `Err(Corruption)`
    /// if the reference is out of range or the stored bytes are malformed.
    fn read_record(&self, recref: RecRef) -> Result<Vec<u8>>;

    /// Append `bytes` as a new record, returning its `RecRef`.
    fn insert_record(&self, bytes: &[u8]) -> Result<RecRef>;

    /// Tombstone the record at `recref` without reclaiming its space.
    fn delete_record(&self, recref: RecRef) -> Result<()>;

    /// High-water mark used by readers to detect references inserted
    /// concurrently with a scan in progress.
    fn data_file_length(&self) -> u64;

    /// CRC32 (or equivalent) checksum of one record's bytes, summed across
    /// all live records to produce `StateInfo::checksum`.
    fn record_checksum(&self, bytes: &[u8]) -> u32 {
        let mut hasher = crate::types::checksum::Crc32Fast::default();
        crate::types::checksum::Checksum::update(&mut hasher, bytes);
        crate::types::checksum::Checksum::finalize(&hasher)
    }
}

/// An in-memory `RecordStore`, for tests and for tables small enough to
/// live entirely in a process's heap.
#[derive(Default)]
pub struct MemRecordStore {
    records: RwLock<HashMap<u64, Option<Vec<u8>>>>,
    next: std::sync::atomic::AtomicU64,
}

impl MemRecordStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Insert `bytes` under an explicit `RecRef`, bumping the auto-assign
    /// counter past it if needed. Used by callers loading a snapshot of an
    /// on-disk store (e.g. `FlatFileRecordStore`) into memory for a
    /// `Repair` run while preserving the original `RecRef` identity.
    pub fn insert_at(&self, recref: RecRef, bytes: Vec<u8>) {
        self.records.write().unwrap().insert(recref.0, Some(bytes));
        self.next.fetch_max(recref.0 + 1, std::sync::atomic::Ordering::SeqCst);
    }

    /// Mark `recref` as tombstoned in this snapshot without requiring it to
    /// have been loaded via `insert_at` first (a deleted slot still needs a
    /// `None` entry so `data_file_length`-derived deleted counts line up).
    pub fn mark_deleted_at(&self, recref: RecRef) {
        self.records.write().unwrap().entry(recref.0).or_insert(None);
        self.next.fetch_max(recref.0 + 1, std::sync::atomic::Ordering::SeqCst);
    }

    /// Iterate every still-live `(RecRef, bytes)` pair in insertion order
    /// of `RecRef`. Used by `Repair`'s data-file scan.
    pub fn iter_live(&self) -> Vec<(RecRef, Vec<u8>)> {
        let guard = self.records.read().unwrap();
        let mut out: Vec<(RecRef, Vec<u8>)> = guard
            .iter()
            .filter_map(|(id, v)| v.clone().map(|b| (RecRef(*id), b)))
            .collect();
        out.sort_by_key(|(r, _)| r.0);
        out
    }
}

impl RecordStore for MemRecordStore {
    fn read_record(&self, recref: RecRef) -> Result<Vec<u8>> {
        let guard = self.records.read().unwrap();
        match guard.get(&recref.0) {
            Some(Some(bytes)) => Ok(bytes.clone()),
            Some(None) => Err(PackTreeError::NotFound("record deleted")),
            None => Err(PackTreeError::Corruption("recref out of range")),
        }
    }

    fn insert_record(&self, bytes: &[u8]) -> Result<RecRef> {
        let id = self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.records.write().unwrap().insert(id, Some(bytes.to_vec()));
        Ok(RecRef(id))
    }

    fn delete_record(&self, recref: RecRef) -> Result<()> {
        let mut guard = self.records.write().unwrap();
        match guard.get_mut(&recref.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            Some(None) => Err(PackTreeError::NotFound("record already deleted")),
            None => Err(PackTreeError::Corruption("recref out of range")),
        }
    }

    fn data_file_length(&self) -> u64 {
        self.next.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// A fixed-width-record data file backed by `FileIo`: every record is
/// exactly `record_len` bytes, addressed by `RecRef(offset / record_len)`,
/// with a one-byte live/deleted flag as the first byte of each slot.
/// Enough to drive the end-to-end fixtures; a dynamic-record,
/// Huffman-compressed reader is explicitly out of scope.
pub struct FlatFileRecordStore {
    io: std::sync::Arc<dyn crate::primitives::io::FileIo>,
    record_len: u64,
}

const LIVE: u8 = 1;
const DELETED: u8 = 0;

impl FlatFileRecordStore {
    pub fn new(io: std::sync::Arc<dyn crate::primitives::io::FileIo>, record_len: u64) -> Self {
        Self { io, record_len }
    }

    fn slot_len(&self) -> u64 {
        self.record_len + 1
    }

    fn offset(&self, recref: RecRef) -> Result<u64> {
        if recref.is_absent() {
            return Err(PackTreeError::Invalid("absent RecRef has no data-file offset"));
        }
        Ok((recref.0 - 1) * self.slot_len())
    }
}

impl RecordStore for FlatFileRecordStore {
    fn read_record(&self, recref: RecRef) -> Result<Vec<u8>> {
        let off = self.offset(recref)?;
        let mut buf = vec![0u8; self.slot_len() as usize];
        self.io.read_at(off, &mut buf)?;
        match buf[0] {
            LIVE => Ok(buf[1..].to_vec()),
            DELETED => Err(PackTreeError::NotFound("record deleted")),
            _ => Err(PackTreeError::Corruption("bad record liveness flag")),
        }
    }

    fn insert_record(&self, bytes: &[u8]) -> Result<RecRef> {
        if bytes.len() as u64 != self.record_len {
            return Err(PackTreeError::Invalid("record does not match fixed record_len"));
        }
        let file_len = self.io.len()?;
        let slot_no = file_len / self.slot_len();
        let mut slot = Vec::with_capacity(self.slot_len() as usize);
        slot.push(LIVE);
        slot.extend_from_slice(bytes);
        self.io.write_at(slot_no * self.slot_len(), &slot)?;
        Ok(RecRef(slot_no + 1))
    }

    fn delete_record(&self, recref: RecRef) -> Result<()> {
        let off = self.offset(recref)?;
        self.io.write_at(off, &[DELETED])
    }

    fn data_file_length(&self) -> u64 {
        self.io.len().unwrap_or(0) / self.slot_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_insert_read_delete() {
        let store = MemRecordStore::new();
        let r = store.insert_record(b"hello").unwrap();
        assert_eq!(store.read_record(r).unwrap(), b"hello");
        store.delete_record(r).unwrap();
        assert!(matches!(store.read_record(r), Err(PackTreeError::NotFound(_))));
    }

    #[test]
    fn mem_store_insert_at_preserves_explicit_recref() {
        let store = MemRecordStore::new();
        store.insert_at(RecRef(5), b"loaded".to_vec());
        store.mark_deleted_at(RecRef(3));
        assert_eq!(store.read_record(RecRef(5)).unwrap(), b"loaded");
        assert!(matches!(store.read_record(RecRef(3)), Err(PackTreeError::NotFound(_))));
        let next = store.insert_record(b"fresh").unwrap();
        assert_eq!(next, RecRef(6));
    }

    #[test]
    fn flat_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let io = std::sync::Arc::new(crate::primitives::io::StdFileIo::open(dir.path().join("data.dat")).unwrap());
        let store = FlatFileRecordStore::new(io, 8);
        let a = store.insert_record(b"12345678").unwrap();
        let b = store.insert_record(b"abcdefgh").unwrap();
        assert_eq!(store.read_record(a).unwrap(), b"12345678");
        assert_eq!(store.read_record(b).unwrap(), b"abcdefgh");
        store.delete_record(a).unwrap();
        assert!(store.read_record(a).is_err());
        assert_eq!(store.read_record(b).unwrap(), b"abcdefgh");
    }
}
