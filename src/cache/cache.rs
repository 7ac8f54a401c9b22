//! The write-back page cache (spec §4.2): a bounded LRU of whole-page
//! buffers sitting above a [`PagedStorage`], tracking which bytes of each
//! buffer are populated and (in write-back mode) dirty.
//!
//! Grounded on the teacher's `BufferPool`/`PageGuard` split in
//! `buffer/pool.rs` for the trait-shaped read/write/flush surface, and on
//! `buffer/lru.rs`'s recency-counter eviction for victim selection — here
//! simplified to a single exclusive lock per spec §5 rather than the
//! teacher's per-frame pin counts, since page pinning isn't part of this
//! contract.

use crate::cache::region_set::ByteRegionSet;
use crate::error::{Result, StorageError};
use crate::paged::PagedStorage;
use crate::backing_store::BackingStore;
use crate::progress::{CancellationToken, ProgressSink};
use crate::types::PageIndex;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// The three ways a [`PageCache`] may treat writes (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Writes update the cache buffer only; persisted on flush/eviction.
    WriteBack,
    /// Writes update the cache buffer and are also written straight
    /// through to the underlying Paged Storage.
    WriteThrough,
    /// No writes permitted.
    ReadOnly,
}

struct CachedPage {
    buffer: Vec<u8>,
    populated: ByteRegionSet,
    dirty: ByteRegionSet,
    recency: u64,
}

struct State {
    pages: HashMap<PageIndex, CachedPage>,
    recency_counter: u64,
}

/// A bounded cache of whole-page buffers above a [`PagedStorage`].
pub struct PageCache<S: BackingStore> {
    storage: Arc<PagedStorage<S>>,
    state: Mutex<State>,
    mode: CacheMode,
    capacity: usize,
}

impl<S: BackingStore> PageCache<S> {
    pub fn new(storage: Arc<PagedStorage<S>>, mode: CacheMode, capacity: usize) -> Self {
        Self {
            storage,
            state: Mutex::new(State {
                pages: HashMap::new(),
                recency_counter: 0,
            }),
            mode,
            capacity,
        }
    }

    pub fn storage(&self) -> &Arc<PagedStorage<S>> {
        &self.storage
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn page_size(&self) -> u64 {
        self.storage.page_size()
    }

    pub fn capacity(&self) -> u64 {
        self.storage.capacity()
    }

    pub fn allocated_count(&self) -> u64 {
        self.storage.allocated_count()
    }

    pub fn entry_page(&self) -> Option<PageIndex> {
        self.storage.entry_page()
    }

    pub fn set_entry_page(&self, page: Option<PageIndex>) -> Result<()> {
        self.storage.set_entry_page(page)
    }

    pub fn try_allocate_page(&self) -> Result<Option<PageIndex>> {
        self.storage.try_allocate_page()
    }

    /// Evicts (and thus flushes) the page first, per spec §4.2, so that
    /// any application-overwritten bytes are guaranteed to reach the
    /// backing store before the slot is reused.
    pub fn free_page(&self, page: PageIndex) -> Result<bool> {
        self.evict_page(page)?;
        self.storage.free_page(page)
    }

    pub fn is_capacity_fixed(&self) -> bool {
        self.storage.is_capacity_fixed()
    }

    pub fn try_inflate(
        &self,
        additional: u64,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.storage.try_inflate(additional, progress, cancel)
    }

    pub fn try_deflate(
        &self,
        remove: u64,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.storage.try_deflate(remove, progress, cancel)
    }

    fn next_recency(state: &mut State) -> u64 {
        state.recency_counter += 1;
        state.recency_counter
    }

    /// Admit `page` into the cache if it isn't already cached, evicting
    /// the least-recently-used entry if at capacity. Returns `None` if
    /// `cache_capacity == 0` (bypass the cache entirely).
    fn admit(&self, state: &mut State, page: PageIndex) -> Result<Option<()>> {
        if self.capacity == 0 {
            return Ok(None);
        }
        if state.pages.contains_key(&page) {
            return Ok(Some(()));
        }
        if state.pages.len() >= self.capacity {
            let victim = state
                .pages
                .iter()
                .min_by_key(|(_, p)| p.recency)
                .map(|(&idx, _)| idx)
                .expect("capacity > 0 implies at least one entry when full");
            self.flush_and_drop_locked(state, victim)?;
        }
        let page_size = self.storage.page_size() as usize;
        state.pages.insert(
            page,
            CachedPage {
                buffer: vec![0u8; page_size],
                populated: ByteRegionSet::new(),
                dirty: ByteRegionSet::new(),
                recency: 0,
            },
        );
        Ok(Some(()))
    }

    fn flush_and_drop_locked(&self, state: &mut State, page: PageIndex) -> Result<()> {
        if let Some(entry) = state.pages.get(&page) {
            for (first, last) in entry.dirty.iter().collect::<Vec<_>>() {
                let len = last - first + 1;
                self.storage
                    .write_to(page, first, &entry.buffer, first, len)?;
            }
        }
        state.pages.remove(&page);
        Ok(())
    }

    pub fn read(&self, page: PageIndex, src_off: u64, buf: &mut [u8], dst_off: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        if self.admit(&mut state, page)?.is_none() {
            drop(state);
            return self.storage.read_from(page, src_off, buf, dst_off, len);
        }

        let last = src_off + len - 1;
        let missing = {
            let entry = state.pages.get(&page).unwrap();
            entry.populated.missing_within(src_off, last)
        };
        for (first, l) in missing {
            let chunk_len = l - first + 1;
            let mut tmp = vec![0u8; chunk_len as usize];
            self.storage.read_from(page, first, &mut tmp, 0, chunk_len)?;
            let entry = state.pages.get_mut(&page).unwrap();
            entry.buffer[first as usize..=l as usize].copy_from_slice(&tmp);
            entry.populated.add(first, l);
        }

        let recency = Self::next_recency(&mut state);
        let entry = state.pages.get_mut(&page).unwrap();
        entry.recency = recency;
        let src = src_off as usize;
        let dst = dst_off as usize;
        buf[dst..dst + len as usize].copy_from_slice(&entry.buffer[src..src + len as usize]);
        Ok(())
    }

    pub fn write(&self, page: PageIndex, dst_off: u64, buf: &[u8], src_off: u64, len: u64) -> Result<()> {
        if self.mode == CacheMode::ReadOnly {
            return Err(StorageError::invalid_operation("write on a ReadOnly Page Cache"));
        }
        if len == 0 {
            return Ok(());
        }

        if self.mode == CacheMode::WriteThrough {
            self.storage.write_to(page, dst_off, buf, src_off, len)?;
        }

        let mut state = self.state.lock();
        if self.admit(&mut state, page)?.is_none() {
            if self.mode == CacheMode::WriteBack {
                drop(state);
                return self.storage.write_to(page, dst_off, buf, src_off, len);
            }
            return Ok(());
        }

        let last = dst_off + len - 1;
        let recency = Self::next_recency(&mut state);
        let entry = state.pages.get_mut(&page).unwrap();
        let dst = dst_off as usize;
        let src = src_off as usize;
        entry.buffer[dst..dst + len as usize].copy_from_slice(&buf[src..src + len as usize]);
        entry.populated.add(dst_off, last);
        if self.mode == CacheMode::WriteBack {
            entry.dirty.add(dst_off, last);
        }
        entry.recency = recency;
        Ok(())
    }

    pub fn is_page_cached(&self, page: PageIndex) -> bool {
        self.state.lock().pages.contains_key(&page)
    }

    /// Writes back any dirty regions of `page` and discards its cache
    /// entry. A no-op if the page isn't cached.
    pub fn evict_page(&self, page: PageIndex) -> Result<()> {
        let mut state = self.state.lock();
        if state.pages.contains_key(&page) {
            self.flush_and_drop_locked(&mut state, page)?;
        }
        Ok(())
    }

    /// Writes back every dirty region of every cached page, then
    /// discards all cache entries. A strict barrier (spec §5): every
    /// write issued before this call is durable in the backing store
    /// once it returns.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        let pages: Vec<PageIndex> = state.pages.keys().copied().collect();
        for page in pages {
            self.flush_and_drop_locked(&mut state, page)?;
        }
        log::debug!("page cache: flushed");
        Ok(())
    }

    /// Flushes and releases this cache's resources. Whether the
    /// underlying Paged Storage is itself closed is the caller's
    /// decision: hold your own `Arc` clone of the storage to keep it
    /// open past this call, or drop the last reference to close it.
    pub fn dispose(&self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing_store::MemBackingStore;
    use crate::progress::NoopProgress;

    fn new_cache(mode: CacheMode, capacity: usize) -> (Arc<PagedStorage<MemBackingStore>>, PageCache<MemBackingStore>) {
        let store = Arc::new(MemBackingStore::new());
        let storage = Arc::new(
            PagedStorage::create(store, 32, 4, &NoopProgress, &CancellationToken::never(), 1 << 20).unwrap(),
        );
        let cache = PageCache::new(storage.clone(), mode, capacity);
        (storage, cache)
    }

    #[test]
    fn write_back_read_reflects_uncommitted_write() {
        let (_storage, cache) = new_cache(CacheMode::WriteBack, 2);
        let page = cache.try_allocate_page().unwrap().unwrap();
        cache.write(page, 0, b"hello", 0, 5).unwrap();
        let mut buf = [0u8; 5];
        cache.read(page, 0, &mut buf, 0, 5).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_back_not_durable_until_flush() {
        let (storage, cache) = new_cache(CacheMode::WriteBack, 2);
        let page = cache.try_allocate_page().unwrap().unwrap();
        cache.write(page, 0, b"hello", 0, 5).unwrap();
        let mut raw = [0u8; 5];
        storage.read_from(page, 0, &mut raw, 0, 5).unwrap();
        assert_ne!(&raw, b"hello");
        cache.flush().unwrap();
        storage.read_from(page, 0, &mut raw, 0, 5).unwrap();
        assert_eq!(&raw, b"hello");
    }

    #[test]
    fn write_through_is_immediately_durable() {
        let (storage, cache) = new_cache(CacheMode::WriteThrough, 2);
        let page = cache.try_allocate_page().unwrap().unwrap();
        cache.write(page, 0, b"hello", 0, 5).unwrap();
        let mut raw = [0u8; 5];
        storage.read_from(page, 0, &mut raw, 0, 5).unwrap();
        assert_eq!(&raw, b"hello");
    }

    #[test]
    fn read_only_rejects_writes() {
        let (_storage, cache) = new_cache(CacheMode::ReadOnly, 2);
        let page = cache.try_allocate_page().unwrap().unwrap();
        let err = cache.write(page, 0, b"x", 0, 1).unwrap_err();
        assert!(matches!(err, StorageError::InvalidOperation(_)));
    }

    #[test]
    fn eviction_flushes_dirty_regions() {
        let (storage, cache) = new_cache(CacheMode::WriteBack, 1);
        let a = cache.try_allocate_page().unwrap().unwrap();
        let b = cache.try_allocate_page().unwrap().unwrap();
        cache.write(a, 0, b"first", 0, 5).unwrap();
        // Touching b with only one cache slot evicts (and flushes) a.
        cache.write(b, 0, b"secnd", 0, 5).unwrap();
        let mut raw = [0u8; 5];
        storage.read_from(a, 0, &mut raw, 0, 5).unwrap();
        assert_eq!(&raw, b"first");
        assert!(!cache.is_page_cached(a));
        assert!(cache.is_page_cached(b));
    }

    #[test]
    fn zero_capacity_bypasses_cache() {
        let (storage, cache) = new_cache(CacheMode::WriteBack, 0);
        let page = cache.try_allocate_page().unwrap().unwrap();
        cache.write(page, 0, b"direct", 0, 6).unwrap();
        assert!(!cache.is_page_cached(page));
        let mut raw = [0u8; 6];
        storage.read_from(page, 0, &mut raw, 0, 6).unwrap();
        assert_eq!(&raw, b"direct");
    }

    #[test]
    fn free_page_flushes_before_freeing() {
        let (storage, cache) = new_cache(CacheMode::WriteBack, 2);
        let page = cache.try_allocate_page().unwrap().unwrap();
        cache.write(page, 0, b"doomed", 0, 6).unwrap();
        cache.free_page(page).unwrap();
        assert!(!storage.is_page_allocated(page).unwrap());
    }

    #[test]
    fn partial_reads_only_fault_missing_bytes() {
        let (_storage, cache) = new_cache(CacheMode::WriteBack, 2);
        let page = cache.try_allocate_page().unwrap().unwrap();
        cache.write(page, 10, b"ab", 0, 2).unwrap();
        let mut buf = [0u8; 2];
        cache.read(page, 10, &mut buf, 0, 2).unwrap();
        assert_eq!(&buf, b"ab");
        // Reading a disjoint region faults it in separately without
        // disturbing what's already populated.
        let mut wide = [0u8; 20];
        cache.read(page, 0, &mut wide, 0, 20).unwrap();
        assert_eq!(&wide[10..12], b"ab");
    }
}
