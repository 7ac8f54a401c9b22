//! # pagestore
//!
//! An embeddable, file-backed ordered key-value storage engine, composed of
//! three independently usable layers:
//!
//! - **Paged Storage** (`paged`): a fixed-size-page allocator over any
//!   [`BackingStore`], with a persisted free list and incremental
//!   inflate/deflate.
//! - **Page Cache** (`cache`): a bounded, write-back (or write-through, or
//!   read-only) LRU cache of whole pages sitting above Paged Storage.
//! - **B-Tree** (`btree`): an ordered map of fixed-size key/value records
//!   over the cache, with owner-gated traversal discipline.
//!
//! Each layer is usable on its own; [`Engine`] bundles all three behind a
//! single handle for the common case of "one B-tree per file".
//!
//! ```rust,ignore
//! use pagestore::{Engine, EngineConfig};
//! use pagestore::codec::FixedU64Codec;
//! use pagestore::backing_store::FileBackingStore;
//!
//! let store = FileBackingStore::open(&path)?;
//! let engine: Engine<_, u64, u64, FixedU64Codec, FixedU64Codec> =
//!     Engine::create(store, EngineConfig::default())?;
//!
//! engine.put(&1, &100)?;
//! assert_eq!(engine.get(&1)?, Some(100));
//! engine.flush()?;
//! ```

pub mod backing_store;
pub mod btree;
pub mod cache;
pub mod codec;
pub mod error;
pub mod paged;
pub mod progress;
pub mod types;

pub use error::{Result, StorageError};

use backing_store::BackingStore;
use btree::{BTree, Cursor, Owner};
use cache::{CacheMode, PageCache};
use codec::Codec;
use paged::PagedStorage;
use progress::{CancellationToken, NoopProgress};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

/// Bundles the knobs the three layers need to be constructed together.
///
/// This is ambient scaffolding for applications embedding the engine; each
/// layer remains independently constructible through its own
/// `create`/`load`/`open` functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Page size in bytes. Must be at least large enough to hold a B-tree
    /// node for the chosen `pair_cap`; `Engine::create` checks this.
    pub page_size: u64,
    /// Number of pages to allocate up front.
    pub initial_capacity: u64,
    /// Cap on how many pages a single `try_inflate`/`try_deflate` call
    /// resizes by in one step.
    pub max_resize_increment: u64,
    /// Number of whole pages the `PageCache` holds at once.
    pub cache_capacity: usize,
    /// Write semantics of the `PageCache`.
    pub cache_mode: CacheMode,
    /// Pair capacity of every B-tree node; must be odd and
    /// `>= MIN_PAIR_CAP_PER_NODE`.
    pub pair_cap: u64,
    /// Upper bound on pairs moved per chunk during a node shift.
    pub max_move_pair_count: u64,
}

impl EngineConfig {
    pub fn new(page_size: u64, pair_cap: u64) -> Self {
        Self {
            page_size,
            initial_capacity: 1,
            max_resize_increment: 1024,
            cache_capacity: 256,
            cache_mode: CacheMode::WriteBack,
            pair_cap,
            max_move_pair_count: 32,
        }
    }

    pub fn initial_capacity(mut self, value: u64) -> Self {
        self.initial_capacity = value;
        self
    }

    pub fn max_resize_increment(mut self, value: u64) -> Self {
        self.max_resize_increment = value;
        self
    }

    pub fn cache_capacity(mut self, value: usize) -> Self {
        self.cache_capacity = value;
        self
    }

    pub fn cache_mode(mut self, value: CacheMode) -> Self {
        self.cache_mode = value;
        self
    }

    pub fn max_move_pair_count(mut self, value: u64) -> Self {
        self.max_move_pair_count = value;
        self
    }
}

impl Default for EngineConfig {
    /// 4 KiB pages with a pair capacity of 63 fit an 8-byte key, 8-byte
    /// value B-tree comfortably; adjust for wider records.
    fn default() -> Self {
        Self::new(4096, 63)
    }
}

/// Statistics about an [`Engine`] instance, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub page_count: u64,
    pub allocated_page_count: u64,
    pub cache_capacity: usize,
    pub tree_height: u64,
    pub entry_count: u64,
}

/// A single handle bundling Paged Storage, a Page Cache above it, and one
/// B-tree over the cache — the common case of "one ordered map per file".
pub struct Engine<S: BackingStore, K, V, KC, VC> {
    cache: Arc<PageCache<S>>,
    cache_capacity: usize,
    tree: BTree<K, V, S, KC, VC>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V, KC, VC> Engine<S, K, V, KC, VC>
where
    S: BackingStore,
    K: Ord,
    KC: Codec<K>,
    VC: Codec<V>,
{
    /// Initializes a fresh, empty store in `store`.
    pub fn create(store: S, config: EngineConfig) -> Result<Self> {
        let storage = Arc::new(PagedStorage::create(
            Arc::new(store),
            config.page_size,
            config.initial_capacity,
            &NoopProgress,
            &CancellationToken::never(),
            config.max_resize_increment,
        )?);
        let cache = Arc::new(PageCache::new(storage, config.cache_mode, config.cache_capacity));
        let tree = BTree::create(
            cache.clone(),
            KC::DATA_SIZE as u64,
            VC::DATA_SIZE as u64,
            config.pair_cap,
            config.max_move_pair_count,
        )?;
        cache.set_entry_page(Some(tree.metadata_page()))?;
        Ok(Self {
            cache,
            cache_capacity: config.cache_capacity,
            tree,
            _marker: PhantomData,
        })
    }

    /// Attaches to a store previously initialized by `create`, reading the
    /// tree's metadata page from the storage's entry page.
    pub fn open(store: S, config: EngineConfig, read_only: bool) -> Result<Self> {
        let storage = Arc::new(PagedStorage::load(Arc::new(store), read_only, read_only)?);
        let metadata_page = storage
            .entry_page()
            .ok_or_else(|| StorageError::corrupt_data("engine: storage has no entry page"))?;
        let mode = if read_only { CacheMode::ReadOnly } else { config.cache_mode };
        let cache = Arc::new(PageCache::new(storage, mode, config.cache_capacity));
        let tree = BTree::open(
            cache.clone(),
            metadata_page,
            KC::DATA_SIZE as u64,
            VC::DATA_SIZE as u64,
            config.pair_cap,
            config.max_move_pair_count,
        )?;
        Ok(Self {
            cache,
            cache_capacity: config.cache_capacity,
            tree,
            _marker: PhantomData,
        })
    }

    fn new_owner(&self) -> Owner {
        self.tree.new_owner()
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.tree.try_get_value(key)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.tree.contains_key(key)
    }

    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        let owner = self.new_owner();
        self.tree.insert(owner, key, value, true)?;
        Ok(())
    }

    /// Like [`Engine::put`] but reports whether `key` already existed.
    pub fn insert(&self, key: &K, value: &V, update_if_exists: bool) -> Result<(bool, bool)> {
        let owner = self.new_owner();
        self.tree.insert(owner, key, value, update_if_exists)
    }

    pub fn delete(&self, key: &K) -> Result<Option<V>> {
        let owner = self.new_owner();
        self.tree.remove(owner, key)
    }

    /// An in-order cursor over every pair currently in the tree.
    pub fn iter(&self) -> Result<Cursor<'_, K, V, S, KC, VC>> {
        let owner = self.new_owner();
        self.tree.traverse(owner, true)
    }

    pub fn flush(&self) -> Result<()> {
        self.cache.flush()
    }

    /// Flushes this engine's cache. The underlying storage and backing
    /// store stay open as long as something still holds an `Arc` to them.
    pub fn dispose(&self) -> Result<()> {
        self.tree.dispose()
    }

    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            page_count: self.cache.capacity(),
            allocated_page_count: self.cache.allocated_count(),
            cache_capacity: self.cache_capacity,
            tree_height: self.tree.height()?,
            entry_count: self.tree.count()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backing_store::MemBackingStore;
    use codec::FixedU64Codec;

    fn config() -> EngineConfig {
        EngineConfig::new(512, 7).initial_capacity(2).cache_capacity(4)
    }

    #[test]
    fn create_put_get_delete_roundtrip() {
        let engine: Engine<MemBackingStore, u64, u64, FixedU64Codec, FixedU64Codec> =
            Engine::create(MemBackingStore::new(), config()).unwrap();
        engine.put(&1, &100).unwrap();
        assert_eq!(engine.get(&1).unwrap(), Some(100));
        assert_eq!(engine.delete(&1).unwrap(), Some(100));
        assert_eq!(engine.get(&1).unwrap(), None);
    }

    #[test]
    fn iter_yields_sorted_pairs() {
        let engine: Engine<MemBackingStore, u64, u64, FixedU64Codec, FixedU64Codec> =
            Engine::create(MemBackingStore::new(), config()).unwrap();
        for k in [5u64, 1, 3, 2, 4] {
            engine.put(&k, &(k * 10)).unwrap();
        }
        let collected: Vec<(u64, u64)> = engine.iter().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(collected, vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]);
    }

    #[test]
    fn stats_report_entry_count_and_height() {
        let engine: Engine<MemBackingStore, u64, u64, FixedU64Codec, FixedU64Codec> =
            Engine::create(MemBackingStore::new(), config()).unwrap();
        for k in 1..=20u64 {
            engine.put(&k, &k).unwrap();
        }
        let stats = engine.stats().unwrap();
        assert_eq!(stats.entry_count, 20);
        assert!(stats.tree_height >= 1);
    }
}
