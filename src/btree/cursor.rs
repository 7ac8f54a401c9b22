//! In-order traversal over a [`BTree`] (spec §4.3 "Traversal").
//!
//! A single stack-based walk serves both directions: `idx` on each
//! [`Frame`] means "next pair to emit here" when ascending and "pairs
//! remaining above the cursor" when descending, which keeps the descent
//! and advance logic symmetric instead of forking into two algorithms.

use crate::backing_store::BackingStore;
use crate::btree::node::{self, NodeLayout};
use crate::btree::tree::{BTree, Owner};
use crate::cache::PageCache;
use crate::codec::Codec;
use crate::error::Result;
use crate::types::PageIndex;
use std::marker::PhantomData;

struct Frame {
    page: PageIndex,
    idx: u64,
}

/// A lazy, in-order (or reverse in-order) iterator over `(K, V)` pairs.
/// Holds the tree's traversal-discipline slot for `owner` open until
/// dropped; see spec §5.
pub struct Cursor<'a, K, V, S: BackingStore, KC, VC> {
    tree: &'a BTree<K, V, S, KC, VC>,
    owner: Owner,
    ascending: bool,
    stack: Vec<Frame>,
    done: bool,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K, V, S, KC, VC> Cursor<'a, K, V, S, KC, VC>
where
    K: Ord,
    S: BackingStore,
    KC: Codec<K>,
    VC: Codec<V>,
{
    pub(crate) fn new(tree: &'a BTree<K, V, S, KC, VC>, owner: Owner, ascending: bool) -> Result<Self> {
        let mut cursor = Self {
            tree,
            owner,
            ascending,
            stack: Vec::new(),
            done: false,
            _marker: PhantomData,
        };
        match tree.root_page()? {
            Some(root) => cursor.push_descend(root)?,
            None => cursor.done = true,
        }
        Ok(cursor)
    }

    fn cache(&self) -> &PageCache<S> {
        self.tree.cache()
    }

    fn layout(&self) -> &NodeLayout {
        self.tree.layout()
    }

    /// Pushes `page` and every node on the leftmost (ascending) or
    /// rightmost (descending) path beneath it, leaving the top of stack
    /// positioned at the first pair to emit.
    fn push_descend(&mut self, page: PageIndex) -> Result<()> {
        let mut current = page;
        loop {
            let is_leaf = node::read_is_leaf(self.cache(), current)?;
            let count = node::read_pair_count(self.cache(), current)?;
            let idx = if self.ascending { 0 } else { count };
            self.stack.push(Frame { page: current, idx });
            if is_leaf {
                break;
            }
            let child_index = if self.ascending { 0 } else { count };
            current = node::read_subtree(self.cache(), current, self.layout(), child_index)?;
        }
        Ok(())
    }

    fn emit(&self, page: PageIndex, pair_idx: u64) -> Result<(K, V)> {
        let mut kbuf = vec![0u8; self.layout().key_size as usize];
        node::read_key_into(self.cache(), page, self.layout(), pair_idx, &mut kbuf)?;
        let mut vbuf = vec![0u8; self.layout().value_size as usize];
        node::read_value_into(self.cache(), page, self.layout(), pair_idx, &mut vbuf)?;
        Ok((KC::deserialize(&kbuf)?, VC::deserialize(&vbuf)?))
    }

    fn advance(&mut self) -> Result<Option<(K, V)>> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let page = frame.page;
            let count = node::read_pair_count(self.cache(), page)?;
            let is_leaf = node::read_is_leaf(self.cache(), page)?;

            if self.ascending {
                if frame.idx >= count {
                    self.stack.pop();
                    continue;
                }
                let pair_idx = frame.idx;
                frame.idx += 1;
                let item = self.emit(page, pair_idx)?;
                if !is_leaf {
                    let child = node::read_subtree(self.cache(), page, self.layout(), pair_idx + 1)?;
                    self.push_descend(child)?;
                }
                return Ok(Some(item));
            } else {
                if frame.idx == 0 {
                    self.stack.pop();
                    continue;
                }
                frame.idx -= 1;
                let pair_idx = frame.idx;
                let item = self.emit(page, pair_idx)?;
                if !is_leaf {
                    let child = node::read_subtree(self.cache(), page, self.layout(), pair_idx)?;
                    self.push_descend(child)?;
                }
                return Ok(Some(item));
            }
        }
    }
}

impl<'a, K, V, S, KC, VC> Iterator for Cursor<'a, K, V, S, KC, VC>
where
    K: Ord,
    S: BackingStore,
    KC: Codec<K>,
    VC: Codec<V>,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<'a, K, V, S: BackingStore, KC, VC> Drop for Cursor<'a, K, V, S, KC, VC> {
    fn drop(&mut self) {
        self.tree.release(self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing_store::MemBackingStore;
    use crate::cache::CacheMode;
    use crate::codec::FixedU64Codec;
    use crate::paged::PagedStorage;
    use crate::progress::{CancellationToken, NoopProgress};
    use std::sync::Arc;

    fn new_tree(pair_cap: u64) -> BTree<u64, u64, MemBackingStore, FixedU64Codec, FixedU64Codec> {
        let layout = NodeLayout::new(8, 8, pair_cap).unwrap();
        let store = Arc::new(MemBackingStore::new());
        let storage = Arc::new(
            PagedStorage::create(
                store,
                layout.required_page_size(),
                4,
                &NoopProgress,
                &CancellationToken::never(),
                1 << 20,
            )
            .unwrap(),
        );
        let cache = Arc::new(PageCache::new(storage, CacheMode::WriteBack, 8));
        BTree::create(cache, 8, 8, pair_cap, 4).unwrap()
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let tree = new_tree(3);
        let owner = tree.new_owner();
        let mut cursor = tree.traverse(owner, true).unwrap();
        assert!(cursor.next().is_none());
    }

    #[test]
    fn traversal_releases_owner_on_drop() {
        let tree = new_tree(3);
        let owner = tree.new_owner();
        tree.insert(owner, &1, &1, true).unwrap();
        {
            let _cursor = tree.traverse(owner, true).unwrap();
        }
        // Dropped, so a mutation under the same owner is now permitted.
        assert!(tree.insert(owner, &2, &2, true).is_ok());
    }

    #[test]
    fn ascending_then_descending_are_reverses_of_each_other() {
        let tree = new_tree(5);
        let owner = tree.new_owner();
        for k in 1..=20u64 {
            tree.insert(owner, &k, &(k * 2), true).unwrap();
        }
        let up: Vec<u64> = tree.traverse(owner, true).unwrap().map(|r| r.unwrap().0).collect();
        let mut down: Vec<u64> = tree.traverse(owner, false).unwrap().map(|r| r.unwrap().0).collect();
        down.reverse();
        assert_eq!(up, down);
        assert_eq!(up, (1..=20u64).collect::<Vec<_>>());
    }
}
