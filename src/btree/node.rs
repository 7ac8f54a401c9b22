//! B-tree node page layout and the low-level field accessors (spec §3
//! "B-tree node page", §4.3 "Node operations (building blocks)").
//!
//! Node pages are addressed through the [`PageCache`] exactly like any
//! other page — the region-set machinery in `crate::cache` already gives
//! narrow field reads/writes the locality the teacher's
//! `page/slotted.rs` got from its cell pointer array, so there is no
//! separate in-memory node representation here: every accessor below
//! round-trips through the cache on each call.

use crate::cache::PageCache;
use crate::backing_store::BackingStore;
use crate::error::{Result, StorageError};
use crate::types::{PageIndex, MIN_PAIR_CAP_PER_NODE};

const IS_LEAF_OFFSET: u64 = 0;
const PAIR_COUNT_OFFSET: u64 = 1;
const PAIR_COUNT_SIZE: u64 = 8;
const FIELDS_OFFSET: u64 = PAIR_COUNT_OFFSET + PAIR_COUNT_SIZE;

const FLAG_LEAF: u8 = 0xFF;
const FLAG_INTERNAL: u8 = 0x00;

/// The fixed geometry of every node page in one tree: `key_size`,
/// `value_size`, and `cap` (pair capacity) are constant for the tree's
/// lifetime.
#[derive(Debug, Clone, Copy)]
pub struct NodeLayout {
    pub key_size: u64,
    pub value_size: u64,
    pub cap: u64,
}

impl NodeLayout {
    pub fn new(key_size: u64, value_size: u64, cap: u64) -> Result<Self> {
        if cap % 2 == 0 {
            return Err(StorageError::invalid_argument("pair_cap must be odd"));
        }
        if cap < MIN_PAIR_CAP_PER_NODE as u64 {
            return Err(StorageError::invalid_argument(format!(
                "pair_cap must be >= {MIN_PAIR_CAP_PER_NODE}"
            )));
        }
        Ok(Self {
            key_size,
            value_size,
            cap,
        })
    }

    pub fn keys_offset(&self) -> u64 {
        FIELDS_OFFSET
    }

    pub fn values_offset(&self) -> u64 {
        self.keys_offset() + self.cap * self.key_size
    }

    pub fn subtree_offset(&self) -> u64 {
        self.values_offset() + self.cap * self.value_size
    }

    /// Required page payload size so the page can serve as either a leaf
    /// or an internal node (spec §3).
    pub fn required_page_size(&self) -> u64 {
        self.subtree_offset() + 8 * (self.cap + 1)
    }

    fn key_at(&self, i: u64) -> u64 {
        self.keys_offset() + i * self.key_size
    }

    fn value_at(&self, i: u64) -> u64 {
        self.values_offset() + i * self.value_size
    }

    fn subtree_at(&self, i: u64) -> u64 {
        self.subtree_offset() + i * 8
    }
}

pub fn read_is_leaf<S: BackingStore>(cache: &PageCache<S>, page: PageIndex) -> Result<bool> {
    let mut buf = [0u8; 1];
    cache.read(page, IS_LEAF_OFFSET, &mut buf, 0, 1)?;
    match buf[0] {
        FLAG_LEAF => Ok(true),
        FLAG_INTERNAL => Ok(false),
        other => Err(StorageError::corrupt_data(format!(
            "node page {page}: invalid is_leaf flag byte 0x{other:02X}"
        ))),
    }
}

pub fn write_is_leaf<S: BackingStore>(cache: &PageCache<S>, page: PageIndex, is_leaf: bool) -> Result<()> {
    let flag = if is_leaf { FLAG_LEAF } else { FLAG_INTERNAL };
    cache.write(page, IS_LEAF_OFFSET, &[flag], 0, 1)
}

pub fn read_pair_count<S: BackingStore>(cache: &PageCache<S>, page: PageIndex) -> Result<u64> {
    let mut buf = [0u8; 8];
    cache.read(page, PAIR_COUNT_OFFSET, &mut buf, 0, 8)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_pair_count<S: BackingStore>(cache: &PageCache<S>, page: PageIndex, count: u64) -> Result<()> {
    cache.write(page, PAIR_COUNT_OFFSET, &count.to_le_bytes(), 0, 8)
}

fn check_pair_index(layout: &NodeLayout, i: u64) -> Result<()> {
    if i >= layout.cap {
        return Err(StorageError::invalid_argument(format!(
            "pair index {i} out of range for cap {}",
            layout.cap
        )));
    }
    Ok(())
}

fn check_subtree_index(layout: &NodeLayout, i: u64) -> Result<()> {
    if i > layout.cap {
        return Err(StorageError::invalid_argument(format!(
            "subtree index {i} out of range for cap {}",
            layout.cap
        )));
    }
    Ok(())
}

pub fn read_key_into<S: BackingStore>(
    cache: &PageCache<S>,
    page: PageIndex,
    layout: &NodeLayout,
    i: u64,
    buf: &mut [u8],
) -> Result<()> {
    check_pair_index(layout, i)?;
    cache.read(page, layout.key_at(i), buf, 0, layout.key_size)
}

pub fn write_key_from<S: BackingStore>(
    cache: &PageCache<S>,
    page: PageIndex,
    layout: &NodeLayout,
    i: u64,
    buf: &[u8],
) -> Result<()> {
    check_pair_index(layout, i)?;
    cache.write(page, layout.key_at(i), buf, 0, layout.key_size)
}

pub fn read_value_into<S: BackingStore>(
    cache: &PageCache<S>,
    page: PageIndex,
    layout: &NodeLayout,
    i: u64,
    buf: &mut [u8],
) -> Result<()> {
    check_pair_index(layout, i)?;
    cache.read(page, layout.value_at(i), buf, 0, layout.value_size)
}

pub fn write_value_from<S: BackingStore>(
    cache: &PageCache<S>,
    page: PageIndex,
    layout: &NodeLayout,
    i: u64,
    buf: &[u8],
) -> Result<()> {
    check_pair_index(layout, i)?;
    cache.write(page, layout.value_at(i), buf, 0, layout.value_size)
}

pub fn read_subtree<S: BackingStore>(
    cache: &PageCache<S>,
    page: PageIndex,
    layout: &NodeLayout,
    i: u64,
) -> Result<PageIndex> {
    check_subtree_index(layout, i)?;
    let mut buf = [0u8; 8];
    cache.read(page, layout.subtree_at(i), &mut buf, 0, 8)?;
    Ok(PageIndex::new(u64::from_le_bytes(buf)))
}

pub fn write_subtree<S: BackingStore>(
    cache: &PageCache<S>,
    page: PageIndex,
    layout: &NodeLayout,
    i: u64,
    child: PageIndex,
) -> Result<()> {
    check_subtree_index(layout, i)?;
    cache.write(page, layout.subtree_at(i), &child.value().to_le_bytes(), 0, 8)
}

/// `(found_here, index_here, in_subtree, subtree_index)` per spec §4.3
/// `find_in_node`. `NotFound` carries the partition point, the position
/// at which the key would be inserted were this a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSearch {
    FoundHere(u64),
    InSubtree(u64),
    NotFound(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing_store::MemBackingStore;
    use crate::cache::CacheMode;
    use crate::paged::PagedStorage;
    use crate::progress::NoopProgress;
    use crate::progress::CancellationToken;
    use std::sync::Arc;

    fn new_cache() -> (NodeLayout, Arc<PageCache<MemBackingStore>>, PageIndex) {
        let layout = NodeLayout::new(8, 8, 3).unwrap();
        let store = Arc::new(MemBackingStore::new());
        let storage = Arc::new(
            PagedStorage::create(
                store,
                layout.required_page_size(),
                2,
                &NoopProgress,
                &CancellationToken::never(),
                1 << 20,
            )
            .unwrap(),
        );
        let cache = Arc::new(PageCache::new(storage, CacheMode::WriteBack, 4));
        let page = cache.try_allocate_page().unwrap().unwrap();
        (layout, cache, page)
    }

    #[test]
    fn is_leaf_and_pair_count_roundtrip() {
        let (_layout, cache, page) = new_cache();
        write_is_leaf(&cache, page, true).unwrap();
        write_pair_count(&cache, page, 2).unwrap();
        assert!(read_is_leaf(&cache, page).unwrap());
        assert_eq!(read_pair_count(&cache, page).unwrap(), 2);
    }

    #[test]
    fn key_value_subtree_roundtrip() {
        let (layout, cache, page) = new_cache();
        write_key_from(&cache, page, &layout, 0, &42u64.to_be_bytes()).unwrap();
        let mut kbuf = [0u8; 8];
        read_key_into(&cache, page, &layout, 0, &mut kbuf).unwrap();
        assert_eq!(u64::from_be_bytes(kbuf), 42);

        write_value_from(&cache, page, &layout, 1, &7u64.to_be_bytes()).unwrap();
        let mut vbuf = [0u8; 8];
        read_value_into(&cache, page, &layout, 1, &mut vbuf).unwrap();
        assert_eq!(u64::from_be_bytes(vbuf), 7);

        write_subtree(&cache, page, &layout, 3, PageIndex::new(9)).unwrap();
        assert_eq!(read_subtree(&cache, page, &layout, 3).unwrap(), PageIndex::new(9));
    }

    #[test]
    fn out_of_range_pair_index_rejected() {
        let (layout, cache, page) = new_cache();
        let err = read_key_into(&cache, page, &layout, 3, &mut [0u8; 8]).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn even_pair_cap_rejected() {
        assert!(NodeLayout::new(8, 8, 4).is_err());
    }

    #[test]
    fn pair_cap_below_minimum_rejected() {
        assert!(NodeLayout::new(8, 8, 1).is_err());
    }
}
