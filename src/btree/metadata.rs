//! The B-tree metadata page (spec §3): `count`, `root_page`, and an
//! application-defined auxiliary region filling out the rest of the page.

use crate::cache::PageCache;
use crate::backing_store::BackingStore;
use crate::error::{Result, StorageError};
use crate::types::{PageIndex, METADATA_PREFIX_SIZE};

const COUNT_OFFSET: u64 = 0;
const ROOT_PAGE_OFFSET: u64 = 8;

#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub count: u64,
    pub root_page: Option<PageIndex>,
}

impl Metadata {
    pub fn read<S: BackingStore>(cache: &PageCache<S>, page: PageIndex) -> Result<Self> {
        let mut buf = [0u8; METADATA_PREFIX_SIZE as usize];
        cache.read(page, 0, &mut buf, 0, METADATA_PREFIX_SIZE)?;
        let count = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let root_raw = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        Ok(Self {
            count,
            root_page: PageIndex::from_raw(root_raw),
        })
    }

    pub fn write<S: BackingStore>(&self, cache: &PageCache<S>, page: PageIndex) -> Result<()> {
        cache.write(page, COUNT_OFFSET, &self.count.to_le_bytes(), 0, 8)?;
        cache.write(
            page,
            ROOT_PAGE_OFFSET,
            &PageIndex::to_raw(self.root_page).to_le_bytes(),
            0,
            8,
        )
    }
}

pub fn aux_size(page_size: u64) -> u64 {
    page_size - METADATA_PREFIX_SIZE
}

pub fn read_aux<S: BackingStore>(
    cache: &PageCache<S>,
    page: PageIndex,
    page_size: u64,
    src_off: u64,
    buf: &mut [u8],
    dst_off: u64,
    len: u64,
) -> Result<()> {
    check_aux_bounds(page_size, src_off, len)?;
    cache.read(page, METADATA_PREFIX_SIZE + src_off, buf, dst_off, len)
}

pub fn write_aux<S: BackingStore>(
    cache: &PageCache<S>,
    page: PageIndex,
    page_size: u64,
    dst_off: u64,
    buf: &[u8],
    src_off: u64,
    len: u64,
) -> Result<()> {
    check_aux_bounds(page_size, dst_off, len)?;
    cache.write(page, METADATA_PREFIX_SIZE + dst_off, buf, src_off, len)
}

fn check_aux_bounds(page_size: u64, off: u64, len: u64) -> Result<()> {
    let size = aux_size(page_size);
    match off.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(StorageError::invalid_argument(
            "auxiliary region offset+length out of range",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing_store::MemBackingStore;
    use crate::cache::CacheMode;
    use crate::paged::PagedStorage;
    use crate::progress::{CancellationToken, NoopProgress};
    use std::sync::Arc;

    fn new_cache(page_size: u64) -> (Arc<PageCache<MemBackingStore>>, PageIndex) {
        let store = Arc::new(MemBackingStore::new());
        let storage = Arc::new(
            PagedStorage::create(store, page_size, 1, &NoopProgress, &CancellationToken::never(), 1 << 20)
                .unwrap(),
        );
        let cache = Arc::new(PageCache::new(storage, CacheMode::WriteBack, 2));
        let page = cache.try_allocate_page().unwrap().unwrap();
        (cache, page)
    }

    #[test]
    fn metadata_roundtrip() {
        let (cache, page) = new_cache(64);
        let meta = Metadata {
            count: 5,
            root_page: Some(PageIndex::new(1)),
        };
        meta.write(&cache, page).unwrap();
        let restored = Metadata::read(&cache, page).unwrap();
        assert_eq!(restored.count, 5);
        assert_eq!(restored.root_page, Some(PageIndex::new(1)));
    }

    #[test]
    fn empty_tree_has_null_root() {
        let (cache, page) = new_cache(64);
        let meta = Metadata { count: 0, root_page: None };
        meta.write(&cache, page).unwrap();
        assert_eq!(Metadata::read(&cache, page).unwrap().root_page, None);
    }

    #[test]
    fn aux_region_roundtrip() {
        let (cache, page) = new_cache(64);
        write_aux(&cache, page, 64, 0, b"hello", 0, 5).unwrap();
        let mut buf = [0u8; 5];
        read_aux(&cache, page, 64, 0, &mut buf, 0, 5).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn aux_region_rejects_out_of_bounds() {
        let (cache, page) = new_cache(64);
        let err = write_aux(&cache, page, 64, 40, b"0123456789ab", 0, 12).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }
}
