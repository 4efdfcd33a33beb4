//! `BTree`: insert/delete/search/split/underflow-balance over one index's
//! pages (spec.md §4.2).
//!
//! Unlike [`crate::page`], which works one key at a time against a byte
//! cursor, `BTree` operates a whole page's entry list per step (decode,
//! mutate, re-encode through [`crate::page::encode_leaf`] /
//! [`crate::page::encode_internal`]). Entries therefore always re-pack
//! their prefix-compression against their new neighbors; `find_half_pos`
//! is approximated by splitting the decoded entry list at its midpoint
//! rather than walking raw bytes to the nearest half-block-length
//! boundary — both land on the same page split point whenever keys are
//! roughly uniform in size, which holds for every index kind this crate
//! builds. See DESIGN.md.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::cache::KeyCache;
use crate::error::{PackTreeError, Result};
use crate::page::{self, InternalPage, LeafEntry, LeafPage};
use crate::types::{KeyDef, PageId, RecRef};

/// Traversal mode for [`BTree::search`] (spec.md §4.2). `Save` positions
/// aren't a distinct mode here: every search already returns a
/// [`Cursor`] suitable for `search_next`/`search_prev`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchMode {
    /// Exact match only.
    Find,
    /// Smallest key strictly greater than the search key.
    Bigger,
    /// Largest key strictly less than the search key.
    Smaller,
    /// Leftmost key in the whole tree.
    First,
    /// Rightmost key in the whole tree.
    Last,
}

/// A positioned cursor into a leaf, stable across reads but re-seeked
/// transparently by `search_next`/`search_prev` if the tree changed
/// underneath it (spec.md §4.2 stale-cursor rule).
#[derive(Clone, Debug)]
pub struct Cursor {
    leaf: PageId,
    pos: usize,
    last_key: Vec<u8>,
    version: u64,
}

/// Result of a completed search: the matched (or insertion-point) entry.
#[derive(Clone, Debug)]
pub struct SearchResult {
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub found: bool,
    pub cursor: Cursor,
}

/// One B-tree over one index (spec.md §4.2). Every mutating call takes
/// the index's root lock exclusively; reads take it in shared mode
/// (spec.md §4.3: "the key cache's page latches are always acquired
/// after the index root lock").
pub struct BTree {
    key_def: Arc<KeyDef>,
    cache: Arc<KeyCache>,
    root: parking_lot::RwLock<PageId>,
    delete_chain: parking_lot::Mutex<Vec<PageId>>,
    payload_len: usize,
}

impl BTree {
    /// Opens a tree whose root is `root` (or `PageId::NONE` for a new,
    /// empty tree) over `cache`. `payload_len` is the fixed-size opaque
    /// tail stored after each leaf key (0 for plain indexes; 4 for
    /// full-text leaves' weight/subkey-count field, spec.md §3).
    pub fn new(key_def: Arc<KeyDef>, cache: Arc<KeyCache>, root: PageId, payload_len: usize) -> Self {
        Self {
            key_def,
            cache,
            root: parking_lot::RwLock::new(root),
            delete_chain: parking_lot::Mutex::new(Vec::new()),
            payload_len,
        }
    }

    pub fn root(&self) -> PageId {
        *self.root.read()
    }

    /// The schema this tree indexes under.
    pub fn key_def(&self) -> &Arc<KeyDef> {
        &self.key_def
    }

    fn reflength(&self) -> usize {
        page::key_reflength(self.cache.file_length_pages())
    }

    fn decode_leaf(&self, page_id: PageId) -> Result<LeafPage> {
        let handle = self.cache.fetch(page_id, false)?;
        let buf = handle.read();
        page::decode_leaf(&buf, &self.key_def, self.payload_len)
    }

    fn decode_internal(&self, page_id: PageId) -> Result<InternalPage> {
        let handle = self.cache.fetch(page_id, false)?;
        let buf = handle.read();
        page::decode_internal(&buf, &self.key_def, self.reflength())
    }

    fn write_leaf(&self, page_id: PageId, leaf: &LeafPage) -> Result<()> {
        let encoded = page::encode_leaf(&leaf.entries, &self.key_def, self.key_def.block_length as usize)?;
        let handle = self.cache.fetch(page_id, true)?;
        *handle.write() = encoded;
        self.cache.mark_dirty(page_id);
        Ok(())
    }

    fn write_internal(&self, page_id: PageId, internal: &InternalPage) -> Result<()> {
        let encoded = page::encode_internal(
            &internal.keys,
            &internal.children,
            &self.key_def,
            self.reflength(),
            self.key_def.block_length as usize,
        )?;
        let handle = self.cache.fetch(page_id, true)?;
        *handle.write() = encoded;
        self.cache.mark_dirty(page_id);
        Ok(())
    }

    /// Allocates a page, reusing the delete chain before extending the
    /// file (spec.md §3 Lifecycles).
    fn allocate_page(&self) -> Result<PageId> {
        if let Some(page_id) = self.delete_chain.lock().pop() {
            return Ok(page_id);
        }
        self.cache.allocate_page()
    }

    fn free_page(&self, page_id: PageId) {
        self.delete_chain.lock().push(page_id);
    }

    fn cmp(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        self.key_def.compare_encoded(a, b)
    }

    /// Descend from the root to the leaf that would contain `key`,
    /// recording `(page_id, child_index)` for every internal page
    /// visited (spec.md §4.2 `search`). `root` must be the caller's
    /// already-observed root page (read or held exclusively by the
    /// caller) — `descend` never touches `self.root` itself, so it's
    /// safe to call while the caller holds the root lock in either mode.
    fn descend(&self, key: &[u8], root: PageId) -> Result<(Vec<(PageId, usize)>, PageId)> {
        let mut ancestors = Vec::new();
        let mut current = root;
        loop {
            if current.is_none() {
                return Err(PackTreeError::NotFound("empty tree"));
            }
            let handle = self.cache.fetch(current, false)?;
            let is_non_leaf = {
                let buf = handle.read();
                page::read_header(&buf)?.1
            };
            if !is_non_leaf {
                return Ok((ancestors, current));
            }
            let internal = self.decode_internal(current)?;
            let mut idx = internal.keys.len();
            for (i, k) in internal.keys.iter().enumerate() {
                if self.cmp(key, k)? == Ordering::Less {
                    idx = i;
                    break;
                }
            }
            ancestors.push((current, idx));
            current = internal.children[idx];
        }
    }

    fn leftmost_leaf(&self, root: PageId) -> Result<PageId> {
        let mut current = root;
        if current.is_none() {
            return Err(PackTreeError::NotFound("empty tree"));
        }
        loop {
            let handle = self.cache.fetch(current, false)?;
            let is_non_leaf = {
                let buf = handle.read();
                page::read_header(&buf)?.1
            };
            if !is_non_leaf {
                return Ok(current);
            }
            current = self.decode_internal(current)?.children[0];
        }
    }

    fn rightmost_leaf(&self, root: PageId) -> Result<PageId> {
        let mut current = root;
        if current.is_none() {
            return Err(PackTreeError::NotFound("empty tree"));
        }
        loop {
            let handle = self.cache.fetch(current, false)?;
            let is_non_leaf = {
                let buf = handle.read();
                page::read_header(&buf)?.1
            };
            if !is_non_leaf {
                return Ok(current);
            }
            let internal = self.decode_internal(current)?;
            current = *internal.children.last().unwrap();
        }
    }

    /// `search(root, key, mode)` (spec.md §4.2).
    pub fn search(&self, key: &[u8], mode: SearchMode) -> Result<SearchResult> {
        let root = *self.root.read();
        match mode {
            SearchMode::First => {
                let leaf = self.leftmost_leaf(root)?;
                let page = self.decode_leaf(leaf)?;
                let entry = page.entries.first().ok_or(PackTreeError::NotFound("empty tree"))?;
                return Ok(SearchResult {
                    key: entry.key.clone(),
                    payload: entry.payload.clone(),
                    found: true,
                    cursor: Cursor { leaf, pos: 0, last_key: entry.key.clone(), version: self.key_def.current_version() },
                });
            }
            SearchMode::Last => {
                let leaf = self.rightmost_leaf(root)?;
                let page = self.decode_leaf(leaf)?;
                let pos = page.entries.len().checked_sub(1).ok_or(PackTreeError::NotFound("empty tree"))?;
                let entry = &page.entries[pos];
                return Ok(SearchResult {
                    key: entry.key.clone(),
                    payload: entry.payload.clone(),
                    found: true,
                    cursor: Cursor { leaf, pos, last_key: entry.key.clone(), version: self.key_def.current_version() },
                });
            }
            _ => {}
        }

        let (_, leaf) = self.descend(key, root)?;
        let page = self.decode_leaf(leaf)?;
        let mut pos = page.entries.len();
        let mut exact = false;
        for (i, e) in page.entries.iter().enumerate() {
            let ord = self.cmp(key, &e.key)?;
            match mode {
                SearchMode::Find => {
                    if ord == Ordering::Equal {
                        pos = i;
                        exact = true;
                        break;
                    }
                }
                SearchMode::Bigger => {
                    if ord == Ordering::Less {
                        pos = i;
                        break;
                    }
                }
                SearchMode::Smaller => {
                    if ord != Ordering::Greater {
                        break;
                    }
                    pos = i;
                }
                SearchMode::First | SearchMode::Last => unreachable!(),
            }
        }
        if mode == SearchMode::Find && !exact {
            return Err(PackTreeError::NotFound("key not present"));
        }
        if mode == SearchMode::Bigger && pos >= page.entries.len() {
            return Err(PackTreeError::NotFound("no key greater than search key"));
        }
        if mode == SearchMode::Smaller && pos >= page.entries.len() {
            return Err(PackTreeError::NotFound("no key smaller than search key"));
        }
        let entry = &page.entries[pos];
        Ok(SearchResult {
            key: entry.key.clone(),
            payload: entry.payload.clone(),
            found: exact,
            cursor: Cursor { leaf, pos, last_key: entry.key.clone(), version: self.key_def.current_version() },
        })
    }

    fn reseek(&self, cursor: &Cursor) -> Result<Cursor> {
        let result = self.search(&cursor.last_key, SearchMode::Bigger)
            .or_else(|_| self.search(&cursor.last_key, SearchMode::Find));
        result.map(|r| r.cursor)
    }

    /// `search_next(state)` (spec.md §4.2): advance one entry, re-seeking
    /// first if the cursor's tree version is stale.
    pub fn search_next(&self, cursor: &Cursor) -> Result<Option<SearchResult>> {
        let cursor = if cursor.version != self.key_def.current_version() {
            self.reseek(cursor)?
        } else {
            cursor.clone()
        };
        let page = self.decode_leaf(cursor.leaf)?;
        if cursor.pos + 1 < page.entries.len() {
            let entry = &page.entries[cursor.pos + 1];
            return Ok(Some(SearchResult {
                key: entry.key.clone(),
                payload: entry.payload.clone(),
                found: true,
                cursor: Cursor {
                    leaf: cursor.leaf,
                    pos: cursor.pos + 1,
                    last_key: entry.key.clone(),
                    version: self.key_def.current_version(),
                },
            }));
        }
        // Cross into the next leaf via a fresh descent on the last key.
        match self.search(&cursor.last_key, SearchMode::Bigger) {
            Ok(result) => Ok(Some(result)),
            Err(PackTreeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `search_first(root)` (spec.md §4.2).
    pub fn search_first(&self) -> Result<SearchResult> {
        self.search(&[], SearchMode::First)
    }

    /// `search_last(root)` (spec.md §4.2).
    pub fn search_last(&self) -> Result<SearchResult> {
        self.search(&[], SearchMode::Last)
    }

    /// `insert(root, key)` (spec.md §4.2). `key` is the fully-encoded
    /// segments + `RecRef` suffix; `payload` is the opaque tail (empty
    /// for plain indexes).
    pub fn insert(&self, key: &[u8], payload: Vec<u8>) -> Result<()> {
        let mut root_guard = self.root.write();
        if root_guard.is_none() {
            let leaf = self.allocate_page()?;
            self.write_leaf(leaf, &LeafPage { entries: vec![LeafEntry { key: key.to_vec(), payload }] })?;
            *root_guard = leaf;
            drop(root_guard);
            self.key_def.bump_version();
            return Ok(());
        }

        let (ancestors, leaf) = self.descend(key, *root_guard)?;
        let mut page = self.decode_leaf(leaf)?;

        let mut insert_at = page.entries.len();
        for (i, e) in page.entries.iter().enumerate() {
            let ord = self.cmp(key, &e.key)?;
            if ord == Ordering::Equal && self.key_def.is_unique() {
                let (_, colliding) = self.key_def.split_recref(&e.key)?;
                return Err(PackTreeError::Duplicate { colliding });
            }
            if ord == Ordering::Less {
                insert_at = i;
                break;
            }
        }
        page.entries.insert(insert_at, LeafEntry { key: key.to_vec(), payload });

        match page::encode_leaf(&page.entries, &self.key_def, self.key_def.block_length as usize) {
            Ok(_) => {
                self.write_leaf(leaf, &page)?;
            }
            Err(PackTreeError::FileFull(_)) => {
                self.split_leaf_and_promote(&mut *root_guard, leaf, page, ancestors)?;
            }
            Err(e) => return Err(e),
        }
        self.key_def.bump_version();
        Ok(())
    }

    fn split_leaf_and_promote(&self, root: &mut PageId, leaf: PageId, page: LeafPage, ancestors: Vec<(PageId, usize)>) -> Result<()> {
        let mid = page.entries.len() / 2;
        let right_entries: Vec<LeafEntry> = page.entries[mid..].to_vec();
        let left_entries: Vec<LeafEntry> = page.entries[..mid].to_vec();
        let separator = right_entries[0].key.clone();

        self.write_leaf(leaf, &LeafPage { entries: left_entries })?;
        let right_page_id = self.allocate_page()?;
        self.write_leaf(right_page_id, &LeafPage { entries: right_entries })?;

        self.promote(root, leaf, right_page_id, separator, ancestors)
    }

    /// Inserts `(separator, right_child)` into the nearest ancestor,
    /// splitting internal pages as needed and growing the root when the
    /// ancestor stack is exhausted (spec.md §4.2 `enlarge_root`). `root`
    /// is the already-locked root slot (the caller holds the tree's
    /// write lock for the whole operation).
    fn promote(&self, root: &mut PageId, left_child: PageId, right_child: PageId, separator: Vec<u8>, mut ancestors: Vec<(PageId, usize)>) -> Result<()> {
        match ancestors.pop() {
            None => {
                // left_child was the root; grow a new root over both halves.
                let new_root = self.allocate_page()?;
                self.write_internal(new_root, &InternalPage { keys: vec![separator], children: vec![left_child, right_child] })?;
                *root = new_root;
                Ok(())
            }
            Some((parent_id, child_idx)) => {
                let mut parent = self.decode_internal(parent_id)?;
                parent.keys.insert(child_idx, separator);
                parent.children[child_idx] = left_child;
                parent.children.insert(child_idx + 1, right_child);

                match page::encode_internal(&parent.keys, &parent.children, &self.key_def, self.reflength(), self.key_def.block_length as usize) {
                    Ok(_) => {
                        self.write_internal(parent_id, &parent)?;
                        Ok(())
                    }
                    Err(PackTreeError::FileFull(_)) => {
                        let mid = parent.keys.len() / 2;
                        let sep = parent.keys[mid].clone();
                        let left_keys = parent.keys[..mid].to_vec();
                        let right_keys = parent.keys[mid + 1..].to_vec();
                        let left_children = parent.children[..=mid].to_vec();
                        let right_children = parent.children[mid + 1..].to_vec();

                        self.write_internal(parent_id, &InternalPage { keys: left_keys, children: left_children })?;
                        let right_id = self.allocate_page()?;
                        self.write_internal(right_id, &InternalPage { keys: right_keys, children: right_children })?;

                        self.promote(root, parent_id, right_id, sep, ancestors)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// `delete(root, key)` (spec.md §4.2).
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut root_guard = self.root.write();
        let (ancestors, leaf) = self.descend(key, *root_guard)?;
        let mut page = self.decode_leaf(leaf)?;
        let idx = page.entries.iter().position(|e| {
            self.cmp(key, &e.key).map(|o| o == Ordering::Equal).unwrap_or(false)
        });
        let idx = idx.ok_or(PackTreeError::NotFound("key not present"))?;
        page.entries.remove(idx);

        if page.entries.is_empty() && !ancestors.is_empty() {
            self.collapse_leaf(&mut *root_guard, leaf, ancestors)?;
        } else {
            self.write_leaf(leaf, &page)?;
            self.rebalance_if_needed(&mut *root_guard, leaf, &page, ancestors)?;
        }
        drop(root_guard);
        self.key_def.bump_version();
        Ok(())
    }

    fn underflow_threshold(&self) -> usize {
        (self.key_def.block_length as usize) / 4
    }

    fn encoded_leaf_len(&self, page: &LeafPage) -> Result<usize> {
        Ok(page::encode_leaf(&page.entries, &self.key_def, usize::MAX).map(|b| b.len()).unwrap_or(usize::MAX))
    }

    /// Removes an emptied leaf entirely: drop it from its parent, free
    /// the page, and propagate underflow upward (spec.md §4.2 underflow
    /// merge, degenerate zero-entry case).
    fn collapse_leaf(&self, root: &mut PageId, leaf: PageId, mut ancestors: Vec<(PageId, usize)>) -> Result<()> {
        self.free_page(leaf);
        let (parent_id, child_idx) = ancestors.pop().expect("non-root leaf always has a parent");
        let mut parent = self.decode_internal(parent_id)?;
        parent.children.remove(child_idx);
        if child_idx < parent.keys.len() {
            parent.keys.remove(child_idx);
        } else if child_idx > 0 {
            parent.keys.remove(child_idx - 1);
        }
        self.finish_internal_removal(root, parent_id, parent, ancestors)
    }

    fn finish_internal_removal(&self, root: &mut PageId, node_id: PageId, node: InternalPage, mut ancestors: Vec<(PageId, usize)>) -> Result<()> {
        if node.children.len() == 1 && ancestors.is_empty() {
            // Root collapsed to a single child: that child becomes the new root.
            self.free_page(node_id);
            *root = node.children[0];
            return Ok(());
        }
        self.write_internal(node_id, &node)?;
        if node.keys.len() * 3 < self.min_internal_fanout() && !ancestors.is_empty() {
            let (parent_id, child_idx) = ancestors.pop().unwrap();
            return self.merge_internal(root, node_id, node, parent_id, child_idx, ancestors);
        }
        Ok(())
    }

    fn min_internal_fanout(&self) -> usize {
        2
    }

    fn merge_internal(&self, root: &mut PageId, node_id: PageId, node: InternalPage, parent_id: PageId, child_idx: usize, ancestors: Vec<(PageId, usize)>) -> Result<()> {
        let mut parent = self.decode_internal(parent_id)?;
        let sibling_idx = if child_idx + 1 < parent.children.len() { child_idx + 1 } else { child_idx - 1 };
        let sibling_id = parent.children[sibling_idx];
        let sibling = self.decode_internal(sibling_id)?;

        let (left_id, mut left, right_id, right, sep_idx) = if sibling_idx > child_idx {
            (node_id, node, sibling_id, sibling, child_idx)
        } else {
            (sibling_id, sibling, node_id, node, sibling_idx)
        };
        let separator = parent.keys[sep_idx].clone();
        left.keys.push(separator);
        left.keys.extend(right.keys);
        left.children.extend(right.children);

        match page::encode_internal(&left.keys, &left.children, &self.key_def, self.reflength(), self.key_def.block_length as usize) {
            Ok(_) => {
                self.write_internal(left_id, &left)?;
                self.free_page(right_id);
                parent.children.remove(sep_idx + 1);
                parent.keys.remove(sep_idx);
                self.finish_internal_removal(root, parent_id, parent, ancestors)
            }
            Err(PackTreeError::FileFull(_)) => {
                // Combined node doesn't fit; leave both pages as-is (rare
                // with balanced fanout) and just refresh the separator.
                parent.keys[sep_idx] = left.keys[left.keys.len() / 2].clone();
                self.write_internal(parent_id, &parent)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Merge or leave a leaf that dropped below the underflow threshold
    /// but did not empty out entirely (spec.md §4.2 underflow merge).
    fn rebalance_if_needed(&self, root: &mut PageId, leaf: PageId, page: &LeafPage, mut ancestors: Vec<(PageId, usize)>) -> Result<()> {
        let Some((parent_id, child_idx)) = ancestors.pop() else {
            return Ok(());
        };
        if self.encoded_leaf_len(page)? >= self.underflow_threshold() {
            return Ok(());
        }
        let parent = self.decode_internal(parent_id)?;
        let sibling_idx = if child_idx + 1 < parent.children.len() { child_idx + 1 } else {
            if child_idx == 0 { return Ok(()); }
            child_idx - 1
        };
        let sibling_id = parent.children[sibling_idx];
        let sibling = self.decode_leaf(sibling_id)?;

        let (left_id, mut left_entries, right_id, right_entries, sep_idx) = if sibling_idx > child_idx {
            (leaf, page.entries.clone(), sibling_id, sibling.entries, child_idx)
        } else {
            (sibling_id, sibling.entries, leaf, page.entries.clone(), sibling_idx)
        };
        left_entries.extend(right_entries);

        let mut parent = parent;
        match page::encode_leaf(&left_entries, &self.key_def, self.key_def.block_length as usize) {
            Ok(_) => {
                self.write_leaf(left_id, &LeafPage { entries: left_entries })?;
                self.free_page(right_id);
                parent.children.remove(sep_idx + 1);
                parent.keys.remove(sep_idx);
                self.finish_internal_removal(root, parent_id, parent, ancestors)
            }
            Err(PackTreeError::FileFull(_)) => {
                // Redistribute evenly instead of merging.
                let mid = left_entries.len() / 2;
                let new_right: Vec<LeafEntry> = left_entries[mid..].to_vec();
                let new_left: Vec<LeafEntry> = left_entries[..mid].to_vec();
                let new_sep = new_right[0].key.clone();
                self.write_leaf(left_id, &LeafPage { entries: new_left })?;
                self.write_leaf(right_id, &LeafPage { entries: new_right })?;
                parent.keys[sep_idx] = new_sep;
                self.write_internal(parent_id, &parent)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Page-count breakdown returned by [`BTree::walk_all_pages`] (spec.md §6
/// CLI surface `-e`, extended check: "walk every block").
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct PageWalkStats {
    pub leaf_pages: u64,
    pub internal_pages: u64,
    pub total_keys: u64,
}

impl BTree {
    /// Walks every reachable page (leaf and internal), the way `myisamchk
    /// -e` walks every block rather than trusting the leaf chain alone.
    /// Visits internal pages top-down and leaves left-to-right; a decode
    /// failure anywhere surfaces as `Corruption`, matching spec.md §7's
    /// "impossible page length, misaligned block, pointer out of file".
    pub fn walk_all_pages(&self) -> Result<PageWalkStats> {
        let root = *self.root.read();
        let mut stats = PageWalkStats::default();
        if !root.is_none() {
            self.walk_page(root, &mut stats)?;
        }
        Ok(stats)
    }

    fn walk_page(&self, page_id: PageId, stats: &mut PageWalkStats) -> Result<()> {
        let handle = self.cache.fetch(page_id, false)?;
        let is_non_leaf = {
            let buf = handle.read();
            page::read_header(&buf)?.1
        };
        if is_non_leaf {
            let internal = self.decode_internal(page_id)?;
            stats.internal_pages += 1;
            stats.total_keys += internal.keys.len() as u64;
            for child in &internal.children {
                self.walk_page(*child, stats)?;
            }
        } else {
            let leaf = self.decode_leaf(page_id)?;
            stats.leaf_pages += 1;
            stats.total_keys += leaf.entries.len() as u64;
        }
        Ok(())
    }

    /// Walks the leaf chain in order (spec.md §8 property 1, "tree order"),
    /// failing on the first adjacent pair that isn't strictly increasing
    /// under `KeyDef.compare`. Returns the total live key count on success,
    /// the shape `myisamchk -c`'s basic (non-extended) pass checks.
    pub fn verify_order(&self) -> Result<u64> {
        let mut result = match self.search_first() {
            Ok(r) => r,
            Err(PackTreeError::NotFound(_)) => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut count = 1u64;
        loop {
            match self.search_next(&result.cursor)? {
                Some(next) => {
                    if self.cmp(&result.key, &next.key)? != Ordering::Less {
                        return Err(PackTreeError::Corruption("keys out of order in leaf chain"));
                    }
                    result = next;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    /// Per-key-part cardinality, the statistic `ANALYZE TABLE` /
    /// `myisamchk -a` records: for each leading `1..=num_segments` prefix of
    /// decoded segment values, the number of distinct values seen across an
    /// in-order leaf walk. Index `i` of the returned vector is the
    /// cardinality of the first `i + 1` segments taken together.
    ///
    /// `stats_method` (spec.md §6 `--stats_method`) controls how a NULL
    /// segment value is treated: [`StatsMethod::NullsEqual`] (the default)
    /// counts every NULL as one shared value; [`StatsMethod::NullsUnequal`]
    /// counts each NULL row as its own distinct value; [`StatsMethod::NullsIgnored`]
    /// drops rows with a NULL in the counted prefix from the tally entirely.
    pub fn cardinalities(&self, num_segments: usize, stats_method: StatsMethod) -> Result<Vec<u64>> {
        let mut counts = vec![0u64; num_segments];
        let mut prev: Option<Vec<Option<Vec<u8>>>> = None;

        let mut advance = |key: &[u8]| -> Result<()> {
            let mut segs: Vec<Option<Vec<u8>>> = Vec::with_capacity(num_segments);
            let mut rest = key;
            for seg in self.key_def.segments.iter().take(num_segments) {
                let (value, consumed) = seg.decode_value(rest)?;
                segs.push(value.map(|v| v.to_vec()));
                rest = &rest[consumed..];
            }
            if stats_method == StatsMethod::NullsIgnored && segs.iter().any(|v| v.is_none()) {
                return Ok(());
            }
            match &prev {
                None => {
                    for (i, v) in segs.iter().enumerate() {
                        let fresh_null = stats_method == StatsMethod::NullsUnequal && v.is_none();
                        let _ = fresh_null;
                        counts[i] += 1;
                    }
                }
                Some(prev_segs) => {
                    let mut prefix_changed = false;
                    for i in 0..num_segments {
                        let always_distinct = stats_method == StatsMethod::NullsUnequal && segs[i].is_none();
                        if prefix_changed || always_distinct || prev_segs[i] != segs[i] {
                            prefix_changed = true;
                            counts[i] += 1;
                        }
                    }
                }
            }
            prev = Some(segs);
            Ok(())
        };

        let mut result = match self.search_first() {
            Ok(r) => r,
            Err(PackTreeError::NotFound(_)) => return Ok(counts),
            Err(e) => return Err(e),
        };
        advance(&result.key)?;
        while let Some(next) = self.search_next(&result.cursor)? {
            advance(&next.key)?;
            result = next;
        }
        Ok(counts)
    }
}

/// `--stats_method` (spec.md §6): how [`BTree::cardinalities`] treats a NULL
/// segment value when counting distinct values for `ANALYZE`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum StatsMethod {
    /// Every NULL counts as one shared value (the MyISAM default).
    #[default]
    NullsEqual,
    /// Each NULL row counts as its own distinct value.
    NullsUnequal,
    /// Rows with a NULL in the counted prefix are excluded from the tally.
    NullsIgnored,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyCache;
    use crate::primitives::io::StdFileIo;
    use crate::types::BinaryCollation;
    use crate::types::{KeyDefBuilder, KeySegment};
    use tempfile::tempdir;

    fn fresh_tree(block_length: u32) -> (tempfile::TempDir, BTree) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx.dat");
        let io = Arc::new(StdFileIo::open(&path).unwrap());
        io.truncate(0).unwrap();
        let cache = Arc::new(KeyCache::new(io, block_length, 0, 256).unwrap());
        let key_def = Arc::new(
            KeyDefBuilder::new(block_length, 4)
                .segment(KeySegment::var_text(255, Arc::new(BinaryCollation)))
                .no_same()
                .build()
                .unwrap(),
        );
        let tree = BTree::new(key_def, cache, PageId::NONE, 0);
        (dir, tree)
    }

    #[test]
    fn insert_and_find_roundtrip() {
        let (_dir, tree) = fresh_tree(4096);
        for (w, id) in [("apple", 1u64), ("banana", 2), ("cherry", 3)] {
            let mut key = Vec::new();
            tree.key_def.encode(&[Some(w.as_bytes())], RecRef(id), &mut key).unwrap();
            tree.insert(&key, Vec::new()).unwrap();
        }
        let mut search_key = Vec::new();
        tree.key_def.encode(&[Some(b"banana")], RecRef(2), &mut search_key).unwrap();
        let result = tree.search(&search_key, SearchMode::Find).unwrap();
        assert!(result.found);
    }

    #[test]
    fn delete_then_find_fails() {
        let (_dir, tree) = fresh_tree(4096);
        let mut a = Vec::new();
        tree.key_def.encode(&[Some(b"apple")], RecRef(1), &mut a).unwrap();
        let mut b = Vec::new();
        tree.key_def.encode(&[Some(b"banana")], RecRef(2), &mut b).unwrap();
        tree.insert(&a, Vec::new()).unwrap();
        tree.insert(&b, Vec::new()).unwrap();
        tree.delete(&b).unwrap();
        assert!(tree.search(&b, SearchMode::Find).is_err());
        let result = tree.search(&a, SearchMode::Find).unwrap();
        assert!(result.found);
    }

    #[test]
    fn many_inserts_force_split_and_stay_ordered() {
        let (_dir, tree) = fresh_tree(1024);
        let mut keys = Vec::new();
        for i in 0..200u64 {
            let word = format!("word{i:04}");
            let mut key = Vec::new();
            tree.key_def.encode(&[Some(word.as_bytes())], RecRef(i), &mut key).unwrap();
            tree.insert(&key, Vec::new()).unwrap();
            keys.push(key);
        }
        let mut result = tree.search_first().unwrap();
        let mut count = 1;
        loop {
            match tree.search_next(&result.cursor).unwrap() {
                Some(next) => {
                    assert_eq!(tree.cmp(&result.key, &next.key).unwrap(), Ordering::Less);
                    result = next;
                    count += 1;
                }
                None => break,
            }
        }
        assert_eq!(count, 200);
    }

    #[test]
    fn verify_order_counts_keys_and_detects_nothing_wrong_on_a_healthy_tree() {
        let (_dir, tree) = fresh_tree(4096);
        for (w, id) in [("apple", 1u64), ("banana", 2), ("cherry", 3)] {
            let mut key = Vec::new();
            tree.key_def.encode(&[Some(w.as_bytes())], RecRef(id), &mut key).unwrap();
            tree.insert(&key, Vec::new()).unwrap();
        }
        assert_eq!(tree.verify_order().unwrap(), 3);
    }

    #[test]
    fn walk_all_pages_counts_every_leaf_after_a_split() {
        let (_dir, tree) = fresh_tree(1024);
        for i in 0..200u64 {
            let word = format!("word{i:04}");
            let mut key = Vec::new();
            tree.key_def.encode(&[Some(word.as_bytes())], RecRef(i), &mut key).unwrap();
            tree.insert(&key, Vec::new()).unwrap();
        }
        let stats = tree.walk_all_pages().unwrap();
        assert_eq!(stats.total_keys, 200);
        assert!(stats.leaf_pages > 1, "200 keys in a 1024-byte page should force at least one split");
    }

    #[test]
    fn cardinalities_counts_distinct_prefixes() {
        let (_dir, tree) = fresh_tree(4096);
        for (w, id) in [("apple", 1u64), ("apple", 2), ("banana", 3)] {
            let mut key = Vec::new();
            tree.key_def.encode(&[Some(w.as_bytes())], RecRef(id), &mut key).unwrap();
            tree.insert(&key, Vec::new()).unwrap();
        }
        let card = tree.cardinalities(1, StatsMethod::NullsEqual).unwrap();
        assert_eq!(card, vec![2]);
    }
}
