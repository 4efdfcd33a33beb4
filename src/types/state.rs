//! Persisted per-table state header (spec.md §3, §6).

use std::collections::HashMap;

use crate::types::PageId;

/// Per-table persisted header. One instance lives in memory per open table
/// and is written back on unlock or close (spec.md §3 Lifecycles).
#[derive(Debug, Clone)]
pub struct StateInfo {
    /// Root page per index, keyed by index number.
    pub roots: Vec<PageId>,
    /// Delete-chain head per block size (spec.md §3 invariant 4).
    pub key_del_chain_head: HashMap<u32, PageId>,
    /// High-water mark of the index file, in pages.
    pub key_file_length: u64,
    /// High-water mark of the data file, in bytes.
    pub data_file_length: u64,
    /// Live record count.
    pub records: u64,
    /// Deleted (tombstoned, not yet reclaimed) record count.
    pub deleted: u64,
    /// Number of B-tree page splits performed over the table's lifetime.
    pub split_count: u64,
    /// Number of times the table has been opened.
    pub open_count: u32,
    /// Next value to hand out for an `AUTO_KEY` index.
    pub auto_increment: u64,
    /// Sum of per-record checksums across live records (spec.md §3 invariant 6).
    pub checksum: u64,
    /// Bitset of enabled indexes (bit `i` set means index `i` is maintained).
    pub key_map: u64,
    /// Monotonic counter bumped on every successful write-committed operation.
    pub unique: u64,
    /// Bumped on every write-committed operation (distinct from `unique`
    /// only in that repair resets `unique` but not `update_count`).
    pub update_count: u64,
    /// PID of the process that currently holds (or most recently held) the
    /// write lock; used for stale-lock diagnostics.
    pub process: u32,
    /// Sticky crashed/crashed-on-repair bit (spec.md §7).
    pub crashed: bool,
    /// Collation id applied when no per-segment collation is specified.
    pub language: u16,
}

impl StateInfo {
    /// A fresh, empty table: no roots, no records, not crashed.
    pub fn new(num_indexes: usize) -> Self {
        Self {
            roots: vec![PageId::NONE; num_indexes],
            key_del_chain_head: HashMap::new(),
            key_file_length: 0,
            data_file_length: 0,
            records: 0,
            deleted: 0,
            split_count: 0,
            open_count: 0,
            auto_increment: 0,
            checksum: 0,
            key_map: (1u64 << num_indexes) - 1,
            unique: 0,
            update_count: 0,
            process: std::process::id(),
            crashed: false,
            language: 0,
        }
    }

    pub fn index_enabled(&self, index: usize) -> bool {
        (self.key_map >> index) & 1 == 1
    }

    pub fn set_index_enabled(&mut self, index: usize, enabled: bool) {
        if enabled {
            self.key_map |= 1 << index;
        } else {
            self.key_map &= !(1 << index);
        }
    }

    /// Record-count invariant check (spec.md §3 invariant 6): callers that
    /// track dynamic-record block counts pass the total here.
    pub fn records_plus_deleted_matches(&self, total_blocks: u64) -> bool {
        self.records + self.deleted == total_blocks
    }

    /// Serialize the header to a fixed-offset byte layout for on-disk
    /// persistence: a 4-byte root count, that many 4-byte `PageId`s, a
    /// 4-byte delete-chain-head-count, that many `(block_length: u32,
    /// PageId: u32)` pairs, then the scalar fields in declaration order,
    /// and finally the `crashed` flag as one byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.roots.len() as u32).to_be_bytes());
        for root in &self.roots {
            out.extend_from_slice(&root.0.to_be_bytes());
        }
        out.extend_from_slice(&(self.key_del_chain_head.len() as u32).to_be_bytes());
        let mut chains: Vec<(&u32, &PageId)> = self.key_del_chain_head.iter().collect();
        chains.sort_by_key(|(block_length, _)| **block_length);
        for (block_length, page_id) in chains {
            out.extend_from_slice(&block_length.to_be_bytes());
            out.extend_from_slice(&page_id.0.to_be_bytes());
        }
        out.extend_from_slice(&self.key_file_length.to_be_bytes());
        out.extend_from_slice(&self.data_file_length.to_be_bytes());
        out.extend_from_slice(&self.records.to_be_bytes());
        out.extend_from_slice(&self.deleted.to_be_bytes());
        out.extend_from_slice(&self.split_count.to_be_bytes());
        out.extend_from_slice(&self.open_count.to_be_bytes());
        out.extend_from_slice(&self.auto_increment.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.key_map.to_be_bytes());
        out.extend_from_slice(&self.unique.to_be_bytes());
        out.extend_from_slice(&self.update_count.to_be_bytes());
        out.extend_from_slice(&self.process.to_be_bytes());
        out.push(self.crashed as u8);
        out.extend_from_slice(&self.language.to_be_bytes());
        out
    }

    /// Parse the layout written by [`Self::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> crate::error::Result<Self> {
        let mut cur = Cursor { buf, pos: 0 };
        let num_roots = cur.u32()? as usize;
        let mut roots = Vec::with_capacity(num_roots);
        for _ in 0..num_roots {
            roots.push(PageId(cur.u32()?));
        }
        let num_chains = cur.u32()? as usize;
        let mut key_del_chain_head = HashMap::with_capacity(num_chains);
        for _ in 0..num_chains {
            let block_length = cur.u32()?;
            let page_id = PageId(cur.u32()?);
            key_del_chain_head.insert(block_length, page_id);
        }
        Ok(Self {
            roots,
            key_del_chain_head,
            key_file_length: cur.u64()?,
            data_file_length: cur.u64()?,
            records: cur.u64()?,
            deleted: cur.u64()?,
            split_count: cur.u64()?,
            open_count: cur.u32()?,
            auto_increment: cur.u64()?,
            checksum: cur.u64()?,
            key_map: cur.u64()?,
            unique: cur.u64()?,
            update_count: cur.u64()?,
            process: cur.u32()?,
            crashed: cur.u8()? != 0,
            language: cur.u16()?,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> crate::error::Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(crate::error::PackTreeError::Corruption("state header truncated"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> crate::error::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> crate::error::Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> crate::error::Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> crate::error::Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_info_roundtrips_through_bytes() {
        let mut state = StateInfo::new(3);
        state.roots[1] = PageId(42);
        state.key_del_chain_head.insert(4096, PageId(7));
        state.records = 100;
        state.deleted = 3;
        state.checksum = 0xdead_beef;
        state.crashed = true;
        let bytes = state.to_bytes();
        let back = StateInfo::from_bytes(&bytes).unwrap();
        assert_eq!(back.roots, state.roots);
        assert_eq!(back.key_del_chain_head, state.key_del_chain_head);
        assert_eq!(back.records, state.records);
        assert_eq!(back.deleted, state.deleted);
        assert_eq!(back.checksum, state.checksum);
        assert!(back.crashed);
    }
}
