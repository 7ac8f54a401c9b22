//! The B-tree itself (spec §4.3): search, insert-with-split, and
//! remove-with-rebalance over fixed-size records stored in pages reached
//! through a [`PageCache`].
//!
//! The teacher's `btree/tree.rs` only ever grows (its own comment reads
//! "In v1, we don't rebalance after deletion"); this tree is grounded on
//! the teacher's recursive insert/split shape but adds the merge/borrow
//! rebalancing deletion needs, and generalizes the teacher's
//! variable-length keys to the fixed `key_size`/`value_size`/`pair_cap`
//! records this format requires.

use crate::backing_store::BackingStore;
use crate::btree::cursor::Cursor;
use crate::btree::metadata::{self, Metadata};
use crate::btree::node::{self, NodeLayout, NodeSearch};
use crate::cache::PageCache;
use crate::codec::Codec;
use crate::error::{Result, StorageError};
use crate::progress::{CancellationToken, NoopProgress};
use crate::types::PageIndex;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

/// Identifies a logical caller for the traversal-discipline check in
/// spec §5: mutating a tree while that same owner has an open traversal
/// is rejected. Obtained from [`BTree::new_owner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner(u64);

struct TreeState {
    scratch: Vec<u8>,
    open_owners: HashSet<u64>,
    next_owner: u64,
}

/// A persistent ordered map `K -> V` over a [`PageCache`].
pub struct BTree<K, V, S: BackingStore, KC, VC> {
    cache: Arc<PageCache<S>>,
    metadata_page: PageIndex,
    layout: NodeLayout,
    max_move_pair_count: u64,
    state: Mutex<TreeState>,
    _marker: PhantomData<fn() -> (K, V, KC, VC)>,
}

impl<K, V, S, KC, VC> BTree<K, V, S, KC, VC>
where
    K: Ord,
    S: BackingStore,
    KC: Codec<K>,
    VC: Codec<V>,
{
    fn scratch_capacity(layout: &NodeLayout, max_move_pair_count: u64) -> usize {
        (max_move_pair_count * (layout.key_size + layout.value_size + 8)) as usize
    }

    fn new_checked(
        cache: Arc<PageCache<S>>,
        metadata_page: PageIndex,
        key_size: u64,
        value_size: u64,
        pair_cap: u64,
        max_move_pair_count: u64,
    ) -> Result<Self> {
        if max_move_pair_count < 1 {
            return Err(StorageError::invalid_argument("max_move_pair_count must be >= 1"));
        }
        let layout = NodeLayout::new(key_size, value_size, pair_cap)?;
        let scratch_cap = Self::scratch_capacity(&layout, max_move_pair_count);
        Ok(Self {
            cache,
            metadata_page,
            layout,
            max_move_pair_count,
            state: Mutex::new(TreeState {
                scratch: vec![0u8; scratch_cap],
                open_owners: HashSet::new(),
                next_owner: 0,
            }),
            _marker: PhantomData,
        })
    }

    /// Allocate a fresh metadata page and initialize an empty tree.
    pub fn create(
        cache: Arc<PageCache<S>>,
        key_size: u64,
        value_size: u64,
        pair_cap: u64,
        max_move_pair_count: u64,
    ) -> Result<Self> {
        let page = cache
            .try_allocate_page()?
            .ok_or(StorageError::CapacityExhausted)?;
        let this = Self::new_checked(cache, page, key_size, value_size, pair_cap, max_move_pair_count)?;
        this.write_metadata(&Metadata { count: 0, root_page: None })?;
        log::debug!("btree created at metadata page {page}");
        Ok(this)
    }

    /// Attach to an existing tree identified by its metadata page.
    pub fn open(
        cache: Arc<PageCache<S>>,
        metadata_page: PageIndex,
        key_size: u64,
        value_size: u64,
        pair_cap: u64,
        max_move_pair_count: u64,
    ) -> Result<Self> {
        Self::new_checked(cache, metadata_page, key_size, value_size, pair_cap, max_move_pair_count)
    }

    pub fn metadata_page(&self) -> PageIndex {
        self.metadata_page
    }

    pub fn count(&self) -> Result<u64> {
        Ok(self.read_metadata()?.count)
    }

    pub fn root_page(&self) -> Result<Option<PageIndex>> {
        Ok(self.read_metadata()?.root_page)
    }

    /// Number of levels from the root to a leaf, inclusive. `0` for an
    /// empty tree.
    pub fn height(&self) -> Result<u64> {
        let Some(mut page) = self.read_metadata()?.root_page else {
            return Ok(0);
        };
        let mut height = 1;
        loop {
            if node::read_is_leaf(&self.cache, page)? {
                return Ok(height);
            }
            page = node::read_subtree(&self.cache, page, &self.layout, 0)?;
            height += 1;
        }
    }

    /// Number of pairs currently stored in the root node, for tests and
    /// diagnostics. `None` for an empty tree.
    pub fn root_pair_count(&self) -> Result<Option<u64>> {
        match self.read_metadata()?.root_page {
            Some(root) => Ok(Some(node::read_pair_count(&self.cache, root)?)),
            None => Ok(None),
        }
    }

    pub fn aux_size(&self) -> u64 {
        metadata::aux_size(self.cache.page_size())
    }

    pub fn read_aux(&self, src_off: u64, buf: &mut [u8], dst_off: u64, len: u64) -> Result<()> {
        metadata::read_aux(&self.cache, self.metadata_page, self.cache.page_size(), src_off, buf, dst_off, len)
    }

    pub fn write_aux(&self, dst_off: u64, buf: &[u8], src_off: u64, len: u64) -> Result<()> {
        metadata::write_aux(&self.cache, self.metadata_page, self.cache.page_size(), dst_off, buf, src_off, len)
    }

    pub fn new_owner(&self) -> Owner {
        let mut st = self.state.lock();
        st.next_owner += 1;
        Owner(st.next_owner)
    }

    pub(crate) fn cache(&self) -> &Arc<PageCache<S>> {
        &self.cache
    }

    pub(crate) fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    pub(crate) fn release(&self, owner: Owner) {
        self.state.lock().open_owners.remove(&owner.0);
    }

    fn read_metadata(&self) -> Result<Metadata> {
        Metadata::read(&self.cache, self.metadata_page)
    }

    fn write_metadata(&self, meta: &Metadata) -> Result<()> {
        meta.write(&self.cache, self.metadata_page)
    }

    fn check_no_open_traversal(&self, st: &TreeState, owner: Owner) -> Result<()> {
        if st.open_owners.contains(&owner.0) {
            return Err(StorageError::invalid_operation(
                "mutation rejected: owner has an open traversal on this tree",
            ));
        }
        Ok(())
    }

    fn alloc_page(&self) -> Result<Option<PageIndex>> {
        if let Some(page) = self.cache.try_allocate_page()? {
            return Ok(Some(page));
        }
        if self.cache.is_capacity_fixed() {
            return Ok(None);
        }
        let created = self.cache.try_inflate(1, &NoopProgress, &CancellationToken::never())?;
        if created == 0 {
            return Ok(None);
        }
        self.cache.try_allocate_page()
    }

    fn create_node(&self, is_leaf: bool) -> Result<Option<PageIndex>> {
        let Some(page) = self.alloc_page()? else {
            return Ok(None);
        };
        node::write_is_leaf(&self.cache, page, is_leaf)?;
        node::write_pair_count(&self.cache, page, 0)?;
        Ok(Some(page))
    }

    fn find_in_node(&self, page: PageIndex, key: &K) -> Result<NodeSearch> {
        let is_leaf = node::read_is_leaf(&self.cache, page)?;
        let count = node::read_pair_count(&self.cache, page)?;
        let mut lo = 0u64;
        let mut hi = count;
        let mut key_buf = vec![0u8; self.layout.key_size as usize];
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            node::read_key_into(&self.cache, page, &self.layout, mid, &mut key_buf)?;
            let mid_key = KC::deserialize(&key_buf)?;
            match mid_key.cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(NodeSearch::FoundHere(mid)),
            }
        }
        if is_leaf {
            Ok(NodeSearch::NotFound(lo))
        } else {
            Ok(NodeSearch::InSubtree(lo))
        }
    }

    fn locate(&self, key: &K) -> Result<Option<(PageIndex, u64)>> {
        let Some(root) = self.read_metadata()?.root_page else {
            return Ok(None);
        };
        let mut page = root;
        loop {
            match self.find_in_node(page, key)? {
                NodeSearch::FoundHere(i) => return Ok(Some((page, i))),
                NodeSearch::InSubtree(i) => page = node::read_subtree(&self.cache, page, &self.layout, i)?,
                NodeSearch::NotFound(_) => return Ok(None),
            }
        }
    }

    pub fn try_get_value(&self, key: &K) -> Result<Option<V>> {
        match self.locate(key)? {
            Some((page, i)) => {
                let mut buf = vec![0u8; self.layout.value_size as usize];
                node::read_value_into(&self.cache, page, &self.layout, i, &mut buf)?;
                Ok(Some(VC::deserialize(&buf)?))
            }
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.locate(key)?.is_some())
    }

    // ---- chunked move primitives (spec §4.3 "Move operations") ----

    fn chunk_plan(n: u64, chunk_cap: u64, same_node: bool, src_off: u64, dst_off: u64) -> Vec<(u64, u64)> {
        let mut chunks = Vec::new();
        let mut remaining = n;
        let mut offset = 0u64;
        while remaining > 0 {
            let len = remaining.min(chunk_cap);
            chunks.push((offset, len));
            offset += len;
            remaining -= len;
        }
        if same_node && dst_off > src_off {
            chunks.reverse();
        }
        chunks
    }

    /// Copies `n` key/value pairs. Both nodes must be leaves (or, if
    /// `src_page == dst_page`, a same-node shift); handles overlap by
    /// choosing chunk order so no pair is clobbered before it is read.
    fn leaf_move(
        &self,
        st: &mut TreeState,
        src_page: PageIndex,
        src_off: u64,
        dst_page: PageIndex,
        dst_off: u64,
        n: u64,
    ) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let same = src_page == dst_page;
        for (chunk_off, chunk_len) in Self::chunk_plan(n, self.max_move_pair_count, same, src_off, dst_off) {
            let s = src_off + chunk_off;
            let d = dst_off + chunk_off;
            let key_bytes = (chunk_len * self.layout.key_size) as usize;
            let val_bytes = (chunk_len * self.layout.value_size) as usize;
            let need = key_bytes + val_bytes;
            if st.scratch.len() < need {
                st.scratch.resize(need, 0);
            }
            {
                let (kbuf, vbuf) = st.scratch[..need].split_at_mut(key_bytes);
                self.cache
                    .read(src_page, self.layout.keys_offset() + s * self.layout.key_size, kbuf, 0, key_bytes as u64)?;
                self.cache.read(
                    src_page,
                    self.layout.values_offset() + s * self.layout.value_size,
                    vbuf,
                    0,
                    val_bytes as u64,
                )?;
            }
            let (kbuf, vbuf) = st.scratch[..need].split_at(key_bytes);
            self.cache
                .write(dst_page, self.layout.keys_offset() + d * self.layout.key_size, kbuf, 0, key_bytes as u64)?;
            self.cache.write(
                dst_page,
                self.layout.values_offset() + d * self.layout.value_size,
                vbuf,
                0,
                val_bytes as u64,
            )?;
        }
        Ok(())
    }

    /// Copies `n` key/value pairs and the `n - 1` interior subtree
    /// indices between them, then overrides the destination's outer
    /// subtrees with `left_child`/`right_child` (spec §4.3).
    fn non_leaf_move(
        &self,
        st: &mut TreeState,
        src_page: PageIndex,
        src_off: u64,
        dst_page: PageIndex,
        dst_off: u64,
        n: u64,
        left_child: PageIndex,
        right_child: PageIndex,
    ) -> Result<()> {
        self.leaf_move(st, src_page, src_off, dst_page, dst_off, n)?;
        if n > 1 {
            self.copy_subtree_range(st, src_page, src_off + 1, dst_page, dst_off + 1, n - 1)?;
        }
        node::write_subtree(&self.cache, dst_page, &self.layout, dst_off, left_child)?;
        node::write_subtree(&self.cache, dst_page, &self.layout, dst_off + n, right_child)?;
        Ok(())
    }

    fn copy_subtree_range(
        &self,
        st: &mut TreeState,
        src_page: PageIndex,
        src_off: u64,
        dst_page: PageIndex,
        dst_off: u64,
        n: u64,
    ) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let same = src_page == dst_page;
        for (chunk_off, chunk_len) in Self::chunk_plan(n, self.max_move_pair_count, same, src_off, dst_off) {
            let s = src_off + chunk_off;
            let d = dst_off + chunk_off;
            let need = (chunk_len * 8) as usize;
            if st.scratch.len() < need {
                st.scratch.resize(need, 0);
            }
            self.cache
                .read(src_page, self.layout.subtree_offset() + s * 8, &mut st.scratch[..need], 0, need as u64)?;
            self.cache
                .write(dst_page, self.layout.subtree_offset() + d * 8, &st.scratch[..need], 0, need as u64)?;
        }
        Ok(())
    }

    fn shift_subtree_range(&self, st: &mut TreeState, page: PageIndex, from: u64, count: u64, delta: i64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let dst_from = (from as i64 + delta) as u64;
        self.copy_subtree_range(st, page, from, page, dst_from, count)
    }

    // ---- insert/remove at a node (spec §4.3 "Insert/Remove at a node") ----

    fn insert_at_leaf(&self, st: &mut TreeState, page: PageIndex, pos: u64, key_buf: &[u8], value_buf: &[u8]) -> Result<()> {
        let count = node::read_pair_count(&self.cache, page)?;
        if pos < count {
            self.leaf_move(st, page, pos, page, pos + 1, count - pos)?;
        }
        node::write_key_from(&self.cache, page, &self.layout, pos, key_buf)?;
        node::write_value_from(&self.cache, page, &self.layout, pos, value_buf)?;
        node::write_pair_count(&self.cache, page, count + 1)
    }

    fn insert_at_non_leaf(
        &self,
        st: &mut TreeState,
        page: PageIndex,
        pos: u64,
        key_buf: &[u8],
        value_buf: &[u8],
        new_child: PageIndex,
        on_left: bool,
    ) -> Result<()> {
        let count = node::read_pair_count(&self.cache, page)?;
        if pos < count {
            self.leaf_move(st, page, pos, page, pos + 1, count - pos)?;
        }
        node::write_key_from(&self.cache, page, &self.layout, pos, key_buf)?;
        node::write_value_from(&self.cache, page, &self.layout, pos, value_buf)?;
        let insert_index = if on_left { pos } else { pos + 1 };
        if insert_index <= count {
            self.shift_subtree_range(st, page, insert_index, count + 1 - insert_index, 1)?;
        }
        node::write_subtree(&self.cache, page, &self.layout, insert_index, new_child)?;
        node::write_pair_count(&self.cache, page, count + 1)
    }

    fn remove_at_leaf(&self, st: &mut TreeState, page: PageIndex, pos: u64) -> Result<()> {
        let count = node::read_pair_count(&self.cache, page)?;
        if pos + 1 < count {
            self.leaf_move(st, page, pos + 1, page, pos, count - pos - 1)?;
        }
        node::write_pair_count(&self.cache, page, count - 1)
    }

    fn remove_at_non_leaf(&self, st: &mut TreeState, page: PageIndex, pos: u64, remove_left_subtree: bool) -> Result<()> {
        let count = node::read_pair_count(&self.cache, page)?;
        if pos + 1 < count {
            self.leaf_move(st, page, pos + 1, page, pos, count - pos - 1)?;
        }
        let remove_index = if remove_left_subtree { pos } else { pos + 1 };
        if remove_index + 1 <= count {
            self.shift_subtree_range(st, page, remove_index + 1, count + 1 - (remove_index + 1), -1)?;
        }
        node::write_pair_count(&self.cache, page, count - 1)
    }

    /// Splits the full child at subtree index `i` of `this`, using
    /// `new_node` (freshly allocated, same leaf-ness as the child) to
    /// hold its upper half (spec §4.3 `split_subtree_at`).
    fn split_subtree_at(&self, st: &mut TreeState, this: PageIndex, i: u64, new_node: PageIndex) -> Result<()> {
        let child = node::read_subtree(&self.cache, this, &self.layout, i)?;
        let cap = self.layout.cap;
        let m = cap / 2;
        let child_is_leaf = node::read_is_leaf(&self.cache, child)?;
        node::write_is_leaf(&self.cache, new_node, child_is_leaf)?;

        let mut mid_key = vec![0u8; self.layout.key_size as usize];
        node::read_key_into(&self.cache, child, &self.layout, m, &mut mid_key)?;
        let mut mid_value = vec![0u8; self.layout.value_size as usize];
        node::read_value_into(&self.cache, child, &self.layout, m, &mut mid_value)?;

        let move_n = cap - m - 1;
        if child_is_leaf {
            self.leaf_move(st, child, m + 1, new_node, 0, move_n)?;
        } else {
            let left_child = node::read_subtree(&self.cache, child, &self.layout, m + 1)?;
            let right_child = node::read_subtree(&self.cache, child, &self.layout, cap)?;
            self.non_leaf_move(st, child, m + 1, new_node, 0, move_n, left_child, right_child)?;
        }
        node::write_pair_count(&self.cache, child, m)?;
        node::write_pair_count(&self.cache, new_node, move_n)?;

        self.insert_at_non_leaf(st, this, i, &mid_key, &mid_value, new_node, false)
    }

    // ---- top-level insert ----

    pub fn insert(&self, owner: Owner, key: &K, value: &V, update_if_exists: bool) -> Result<(bool, bool)> {
        let mut st = self.state.lock();
        self.check_no_open_traversal(&st, owner)?;

        let mut key_buf = vec![0u8; self.layout.key_size as usize];
        KC::serialize(key, &mut key_buf);
        let mut value_buf = vec![0u8; self.layout.value_size as usize];
        VC::serialize(value, &mut value_buf);

        // Pre-inflate by one page: the spec's all-or-nothing capacity-
        // exhaustion contract requires failing before any partial write.
        // A fixed-capacity store can't inflate at all; fall through and
        // let the insert fail naturally if it runs out of free pages.
        if !self.cache.is_capacity_fixed() {
            let _ = self.cache.try_inflate(1, &NoopProgress, &CancellationToken::never())?;
        }

        let meta = self.read_metadata()?;
        let mut root = match meta.root_page {
            None => {
                let Some(leaf) = self.create_node(true)? else {
                    return Ok((false, false));
                };
                node::write_key_from(&self.cache, leaf, &self.layout, 0, &key_buf)?;
                node::write_value_from(&self.cache, leaf, &self.layout, 0, &value_buf)?;
                node::write_pair_count(&self.cache, leaf, 1)?;
                self.write_metadata(&Metadata { count: 1, root_page: Some(leaf) })?;
                return Ok((true, false));
            }
            Some(r) => r,
        };

        if node::read_pair_count(&self.cache, root)? == self.layout.cap {
            let Some(new_root) = self.create_node(false)? else {
                return Ok((false, false));
            };
            node::write_subtree(&self.cache, new_root, &self.layout, 0, root)?;
            node::write_pair_count(&self.cache, new_root, 0)?;
            let old_root_is_leaf = node::read_is_leaf(&self.cache, root)?;
            let Some(sibling) = self.create_node(old_root_is_leaf)? else {
                return Ok((false, false));
            };
            self.split_subtree_at(&mut st, new_root, 0, sibling)?;
            root = new_root;
            self.write_metadata(&Metadata { count: meta.count, root_page: Some(root) })?;
        }

        let mut page = root;
        loop {
            match self.find_in_node(page, key)? {
                NodeSearch::FoundHere(i) => {
                    if update_if_exists {
                        node::write_value_from(&self.cache, page, &self.layout, i, &value_buf)?;
                        return Ok((true, true));
                    }
                    return Ok((false, true));
                }
                NodeSearch::NotFound(pos) => {
                    self.insert_at_leaf(&mut st, page, pos, &key_buf, &value_buf)?;
                    let meta = self.read_metadata()?;
                    self.write_metadata(&Metadata { count: meta.count + 1, root_page: meta.root_page })?;
                    return Ok((true, false));
                }
                NodeSearch::InSubtree(i) => {
                    let child = node::read_subtree(&self.cache, page, &self.layout, i)?;
                    if node::read_pair_count(&self.cache, child)? == self.layout.cap {
                        let child_is_leaf = node::read_is_leaf(&self.cache, child)?;
                        let Some(sibling) = self.create_node(child_is_leaf)? else {
                            return Ok((false, false));
                        };
                        self.split_subtree_at(&mut st, page, i, sibling)?;
                        continue;
                    }
                    page = child;
                }
            }
        }
    }

    // ---- top-level remove ----

    pub fn remove(&self, owner: Owner, key: &K) -> Result<Option<V>> {
        let mut st = self.state.lock();
        self.check_no_open_traversal(&st, owner)?;

        let meta = self.read_metadata()?;
        let Some(root) = meta.root_page else {
            return Ok(None);
        };

        let Some((_removed_key, removed_value)) = self.remove_by_key(&mut st, root, key)? else {
            return Ok(None);
        };

        let root_count = node::read_pair_count(&self.cache, root)?;
        let root_is_leaf = node::read_is_leaf(&self.cache, root)?;
        let final_root = if root_count == 0 {
            if root_is_leaf {
                None
            } else {
                let sole = node::read_subtree(&self.cache, root, &self.layout, 0)?;
                self.cache.free_page(root)?;
                Some(sole)
            }
        } else {
            Some(root)
        };

        self.write_metadata(&Metadata { count: meta.count - 1, root_page: final_root })?;
        Ok(Some(VC::deserialize(&removed_value)?))
    }

    fn remove_by_key(&self, st: &mut TreeState, page: PageIndex, key: &K) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.find_in_node(page, key)? {
            NodeSearch::NotFound(_) => Ok(None),
            NodeSearch::FoundHere(i) => {
                if node::read_is_leaf(&self.cache, page)? {
                    let mut kbuf = vec![0u8; self.layout.key_size as usize];
                    node::read_key_into(&self.cache, page, &self.layout, i, &mut kbuf)?;
                    let mut vbuf = vec![0u8; self.layout.value_size as usize];
                    node::read_value_into(&self.cache, page, &self.layout, i, &mut vbuf)?;
                    self.remove_at_leaf(st, page, i)?;
                    Ok(Some((kbuf, vbuf)))
                } else {
                    let mut kbuf = vec![0u8; self.layout.key_size as usize];
                    node::read_key_into(&self.cache, page, &self.layout, i, &mut kbuf)?;
                    let mut vbuf = vec![0u8; self.layout.value_size as usize];
                    node::read_value_into(&self.cache, page, &self.layout, i, &mut vbuf)?;

                    let (pred_key, pred_value) = self.remove_extreme(st, page, i, true)?;
                    node::write_key_from(&self.cache, page, &self.layout, i, &pred_key)?;
                    node::write_value_from(&self.cache, page, &self.layout, i, &pred_value)?;
                    self.rebalance_child_if_needed(st, page, i)?;
                    Ok(Some((kbuf, vbuf)))
                }
            }
            NodeSearch::InSubtree(i) => {
                let child = node::read_subtree(&self.cache, page, &self.layout, i)?;
                let result = self.remove_by_key(st, child, key)?;
                if result.is_some() {
                    self.rebalance_child_if_needed(st, page, i)?;
                }
                Ok(result)
            }
        }
    }

    /// Removes and returns the rightmost (`want_max`) or leftmost pair
    /// reachable from `parent`'s subtree at `child_index`, rebalancing
    /// back up through every node visited.
    fn remove_extreme(&self, st: &mut TreeState, parent: PageIndex, child_index: u64, want_max: bool) -> Result<(Vec<u8>, Vec<u8>)> {
        let child = node::read_subtree(&self.cache, parent, &self.layout, child_index)?;
        let is_leaf = node::read_is_leaf(&self.cache, child)?;
        let result = if is_leaf {
            let count = node::read_pair_count(&self.cache, child)?;
            let pos = if want_max { count - 1 } else { 0 };
            let mut kbuf = vec![0u8; self.layout.key_size as usize];
            node::read_key_into(&self.cache, child, &self.layout, pos, &mut kbuf)?;
            let mut vbuf = vec![0u8; self.layout.value_size as usize];
            node::read_value_into(&self.cache, child, &self.layout, pos, &mut vbuf)?;
            self.remove_at_leaf(st, child, pos)?;
            (kbuf, vbuf)
        } else {
            let count = node::read_pair_count(&self.cache, child)?;
            let next_index = if want_max { count } else { 0 };
            self.remove_extreme(st, child, next_index, want_max)?
        };
        self.rebalance_child_if_needed(st, parent, child_index)?;
        Ok(result)
    }

    fn rebalance_child_if_needed(&self, st: &mut TreeState, parent: PageIndex, child_index: u64) -> Result<()> {
        let child = node::read_subtree(&self.cache, parent, &self.layout, child_index)?;
        let cap = self.layout.cap;
        // floor(cap/2): matches the pair count split_subtree_at produces
        // for each half, so a merge of two min-fill-adjacent nodes plus
        // the pulled-down separator is exactly `cap` pairs, never more.
        let min_fill = cap / 2;
        let count = node::read_pair_count(&self.cache, child)?;
        if count >= min_fill {
            return Ok(());
        }
        let parent_count = node::read_pair_count(&self.cache, parent)?;
        let is_leaf = node::read_is_leaf(&self.cache, child)?;

        if child_index < parent_count {
            let right = node::read_subtree(&self.cache, parent, &self.layout, child_index + 1)?;
            if node::read_pair_count(&self.cache, right)? > min_fill {
                return self.borrow_from_right(st, parent, child_index, child, right, is_leaf);
            }
        }
        if child_index > 0 {
            let left = node::read_subtree(&self.cache, parent, &self.layout, child_index - 1)?;
            if node::read_pair_count(&self.cache, left)? > min_fill {
                return self.borrow_from_left(st, parent, child_index, left, child, is_leaf);
            }
        }
        if child_index < parent_count {
            let right = node::read_subtree(&self.cache, parent, &self.layout, child_index + 1)?;
            self.merge_children(st, parent, child_index, child, right, is_leaf)
        } else {
            let left = node::read_subtree(&self.cache, parent, &self.layout, child_index - 1)?;
            self.merge_children(st, parent, child_index - 1, left, child, is_leaf)
        }
    }

    fn borrow_from_right(
        &self,
        st: &mut TreeState,
        parent: PageIndex,
        left_index: u64,
        left: PageIndex,
        right: PageIndex,
        is_leaf: bool,
    ) -> Result<()> {
        let mut sep_key = vec![0u8; self.layout.key_size as usize];
        node::read_key_into(&self.cache, parent, &self.layout, left_index, &mut sep_key)?;
        let mut sep_val = vec![0u8; self.layout.value_size as usize];
        node::read_value_into(&self.cache, parent, &self.layout, left_index, &mut sep_val)?;

        let left_count = node::read_pair_count(&self.cache, left)?;
        node::write_key_from(&self.cache, left, &self.layout, left_count, &sep_key)?;
        node::write_value_from(&self.cache, left, &self.layout, left_count, &sep_val)?;
        if !is_leaf {
            let right_first_child = node::read_subtree(&self.cache, right, &self.layout, 0)?;
            node::write_subtree(&self.cache, left, &self.layout, left_count + 1, right_first_child)?;
        }
        node::write_pair_count(&self.cache, left, left_count + 1)?;

        let mut rfk = vec![0u8; self.layout.key_size as usize];
        node::read_key_into(&self.cache, right, &self.layout, 0, &mut rfk)?;
        let mut rfv = vec![0u8; self.layout.value_size as usize];
        node::read_value_into(&self.cache, right, &self.layout, 0, &mut rfv)?;
        node::write_key_from(&self.cache, parent, &self.layout, left_index, &rfk)?;
        node::write_value_from(&self.cache, parent, &self.layout, left_index, &rfv)?;

        let right_count = node::read_pair_count(&self.cache, right)?;
        if right_count > 1 {
            self.leaf_move(st, right, 1, right, 0, right_count - 1)?;
        }
        if !is_leaf {
            self.shift_subtree_range(st, right, 1, right_count, -1)?;
        }
        node::write_pair_count(&self.cache, right, right_count - 1)
    }

    fn borrow_from_left(
        &self,
        st: &mut TreeState,
        parent: PageIndex,
        right_index: u64,
        left: PageIndex,
        right: PageIndex,
        is_leaf: bool,
    ) -> Result<()> {
        let left_count = node::read_pair_count(&self.cache, left)?;
        let right_count = node::read_pair_count(&self.cache, right)?;

        if right_count > 0 {
            self.leaf_move(st, right, 0, right, 1, right_count)?;
        }
        if !is_leaf {
            self.shift_subtree_range(st, right, 0, right_count + 1, 1)?;
        }

        let mut sep_key = vec![0u8; self.layout.key_size as usize];
        node::read_key_into(&self.cache, parent, &self.layout, right_index - 1, &mut sep_key)?;
        let mut sep_val = vec![0u8; self.layout.value_size as usize];
        node::read_value_into(&self.cache, parent, &self.layout, right_index - 1, &mut sep_val)?;
        node::write_key_from(&self.cache, right, &self.layout, 0, &sep_key)?;
        node::write_value_from(&self.cache, right, &self.layout, 0, &sep_val)?;
        if !is_leaf {
            let left_last_child = node::read_subtree(&self.cache, left, &self.layout, left_count)?;
            node::write_subtree(&self.cache, right, &self.layout, 0, left_last_child)?;
        }
        node::write_pair_count(&self.cache, right, right_count + 1)?;

        let mut llk = vec![0u8; self.layout.key_size as usize];
        node::read_key_into(&self.cache, left, &self.layout, left_count - 1, &mut llk)?;
        let mut llv = vec![0u8; self.layout.value_size as usize];
        node::read_value_into(&self.cache, left, &self.layout, left_count - 1, &mut llv)?;
        node::write_key_from(&self.cache, parent, &self.layout, right_index - 1, &llk)?;
        node::write_value_from(&self.cache, parent, &self.layout, right_index - 1, &llv)?;
        node::write_pair_count(&self.cache, left, left_count - 1)
    }

    fn merge_children(
        &self,
        st: &mut TreeState,
        parent: PageIndex,
        left_index: u64,
        left: PageIndex,
        right: PageIndex,
        is_leaf: bool,
    ) -> Result<()> {
        let left_count = node::read_pair_count(&self.cache, left)?;
        let right_count = node::read_pair_count(&self.cache, right)?;

        let mut sep_key = vec![0u8; self.layout.key_size as usize];
        node::read_key_into(&self.cache, parent, &self.layout, left_index, &mut sep_key)?;
        let mut sep_val = vec![0u8; self.layout.value_size as usize];
        node::read_value_into(&self.cache, parent, &self.layout, left_index, &mut sep_val)?;
        node::write_key_from(&self.cache, left, &self.layout, left_count, &sep_key)?;
        node::write_value_from(&self.cache, left, &self.layout, left_count, &sep_val)?;

        if right_count > 0 {
            self.leaf_move(st, right, 0, left, left_count + 1, right_count)?;
        }
        if !is_leaf {
            self.copy_subtree_range(st, right, 0, left, left_count + 1, right_count + 1)?;
        }
        node::write_pair_count(&self.cache, left, left_count + 1 + right_count)?;

        self.cache.free_page(right)?;
        self.remove_at_non_leaf(st, parent, left_index, false)
    }

    /// An in-order (or reverse, for `ascending = false`) lazy walk.
    /// Rejects further mutation from `owner` until the cursor is
    /// dropped or explicitly released.
    pub fn traverse(&self, owner: Owner, ascending: bool) -> Result<Cursor<'_, K, V, S, KC, VC>> {
        {
            let mut st = self.state.lock();
            st.open_owners.insert(owner.0);
        }
        Cursor::new(self, owner, ascending)
    }

    /// Flushes the underlying cache. Whether the cache's own Paged
    /// Storage is itself closed afterward is the caller's decision — see
    /// [`PageCache::dispose`].
    pub fn dispose(&self) -> Result<()> {
        self.cache.dispose()
    }
}
