//! The paged storage allocator (spec §4.1): partitions a backing store
//! into fixed-size pages with an internal doubly-linked free list.
//!
//! Grounded on the teacher's `DiskManagerImpl` (open/read_page/write_page/
//! allocate_page/deallocate_page), generalized from a whole-page-at-a-time
//! API tied to one fixed page size to a parameterized one, and with the
//! free list moved from the teacher's in-memory `VecDeque` (see the
//! removed `storage/freelist.rs`) onto the disk itself, threaded through
//! the payloads of free slots, per spec §3.

use crate::backing_store::BackingStore;
use crate::error::{Result, StorageError};
use crate::paged::header::StorageHeader;
use crate::progress::{CancellationToken, ProgressSink};
use crate::types::{PageIndex, FLAG_ALLOC, FLAG_FREE, HEADER_SIZE, MIN_PAGE_SIZE};
use parking_lot::Mutex;
use std::sync::Arc;

struct State {
    header: StorageHeader,
    capacity: u64,
}

/// Partitions a [`BackingStore`] into a fixed header plus `capacity`
/// equal-sized slots, each `1 + page_size` bytes (spec §3).
pub struct PagedStorage<S: BackingStore> {
    store: Arc<S>,
    state: Mutex<State>,
    read_only: bool,
    capacity_fixed: bool,
}

fn slot_size(page_size: u64) -> u64 {
    1 + page_size
}

fn required_length(page_size: u64, capacity: u64) -> u64 {
    HEADER_SIZE + slot_size(page_size) * capacity
}

fn capacity_for_length(page_size: u64, len: u64) -> u64 {
    len.saturating_sub(HEADER_SIZE) / slot_size(page_size)
}

fn slot_offset(page_size: u64, page: PageIndex) -> u64 {
    HEADER_SIZE + slot_size(page_size) * page.value()
}

impl<S: BackingStore> PagedStorage<S> {
    fn check_args_for_create(page_size: u64, max_resize_increment: u64) -> Result<()> {
        if page_size < MIN_PAGE_SIZE {
            return Err(StorageError::invalid_argument(format!(
                "page_size must be >= {MIN_PAGE_SIZE}, got {page_size}"
            )));
        }
        if max_resize_increment < 1 {
            return Err(StorageError::invalid_argument(
                "max_resize_increment must be >= 1",
            ));
        }
        Ok(())
    }

    /// Write a fresh header and free list of `initial_capacity` slots,
    /// resizing the store to the required length in increments of at most
    /// `max_resize_increment` bytes. Cancellation during `create` leaves
    /// the container's content undefined (spec §5).
    pub fn create(
        store: Arc<S>,
        page_size: u64,
        initial_capacity: u64,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
        max_resize_increment: u64,
    ) -> Result<Self> {
        Self::check_args_for_create(page_size, max_resize_increment)?;

        let target_len = required_length(page_size, initial_capacity);
        let mut cur_len = store.len()?;
        if cur_len != target_len {
            // Growing (or shrinking, if reusing a larger store) to exactly
            // the required length, in bounded increments.
            loop {
                if cur_len == target_len {
                    break;
                }
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let step = max_resize_increment.min(target_len.abs_diff(cur_len));
                cur_len = if cur_len < target_len {
                    cur_len + step
                } else {
                    cur_len - step
                };
                store.set_len(cur_len)?;
                progress.report(cur_len, Some(target_len));
            }
        }

        let header = StorageHeader {
            page_size,
            entry_page: None,
            allocated_count: 0,
            first_free: if initial_capacity > 0 {
                Some(PageIndex::new(0))
            } else {
                None
            },
            last_free: if initial_capacity > 0 {
                Some(PageIndex::new(initial_capacity - 1))
            } else {
                None
            },
        };

        let this = Self {
            store,
            state: Mutex::new(State {
                header,
                capacity: initial_capacity,
            }),
            read_only: false,
            capacity_fixed: false,
        };

        for i in 0..initial_capacity {
            this.write_free_slot(PageIndex::new(i), prev_of(i), next_of(i, initial_capacity))?;
        }
        this.flush_header()?;
        log::debug!(
            "paged storage created: page_size={page_size} initial_capacity={initial_capacity}"
        );
        Ok(this)
    }

    /// Like [`Self::create`], but derives capacity from the backing
    /// store's current length and never resizes it.
    pub fn create_fixed(
        store: Arc<S>,
        page_size: u64,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        Self::check_args_for_create(page_size, 1)?;
        let len = store.len()?;
        let initial_capacity = capacity_for_length(page_size, len);

        let header = StorageHeader {
            page_size,
            entry_page: None,
            allocated_count: 0,
            first_free: if initial_capacity > 0 {
                Some(PageIndex::new(0))
            } else {
                None
            },
            last_free: if initial_capacity > 0 {
                Some(PageIndex::new(initial_capacity - 1))
            } else {
                None
            },
        };

        let this = Self {
            store,
            state: Mutex::new(State {
                header,
                capacity: initial_capacity,
            }),
            read_only: false,
            capacity_fixed: true,
        };

        for i in 0..initial_capacity {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            this.write_free_slot(PageIndex::new(i), prev_of(i), next_of(i, initial_capacity))?;
            progress.report(i + 1, Some(initial_capacity));
        }
        this.flush_header()?;
        Ok(this)
    }

    /// Read and validate an existing header from `store`.
    pub fn load(store: Arc<S>, read_only: bool, capacity_fixed: bool) -> Result<Self> {
        if read_only && !capacity_fixed {
            return Err(StorageError::invalid_argument(
                "a read-only Paged Storage must have a fixed capacity",
            ));
        }
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        store.read_at(0, &mut buf)?;
        let header = StorageHeader::read(&buf)?;
        if header.page_size < MIN_PAGE_SIZE {
            return Err(StorageError::corrupt_data(format!(
                "stored page_size {} below minimum {}",
                header.page_size, MIN_PAGE_SIZE
            )));
        }
        let len = store.len()?;
        let capacity = capacity_for_length(header.page_size, len);

        Ok(Self {
            store,
            state: Mutex::new(State { header, capacity }),
            read_only,
            capacity_fixed,
        })
    }

    fn flush_header(&self) -> Result<()> {
        let state = self.state.lock();
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        state.header.write(&mut buf);
        self.store.write_at(0, &buf)
    }

    fn require_mutable(&self) -> Result<()> {
        if self.read_only {
            return Err(StorageError::invalid_operation(
                "write on a read-only Paged Storage",
            ));
        }
        Ok(())
    }

    pub fn page_size(&self) -> u64 {
        self.state.lock().header.page_size
    }

    pub fn capacity(&self) -> u64 {
        self.state.lock().capacity
    }

    pub fn allocated_count(&self) -> u64 {
        self.state.lock().header.allocated_count
    }

    pub fn entry_page(&self) -> Option<PageIndex> {
        self.state.lock().header.entry_page
    }

    pub fn set_entry_page(&self, page: Option<PageIndex>) -> Result<()> {
        self.require_mutable()?;
        self.state.lock().header.entry_page = page;
        self.flush_header()
    }

    /// Whether this instance's capacity is fixed — `try_inflate`/
    /// `try_deflate` always reject on a fixed-capacity instance.
    pub fn is_capacity_fixed(&self) -> bool {
        self.capacity_fixed
    }

    pub fn is_page_on_storage(&self, page: PageIndex) -> bool {
        page.value() < self.state.lock().capacity
    }

    pub fn is_page_allocated(&self, page: PageIndex) -> Result<bool> {
        if !self.is_page_on_storage(page) {
            return Err(StorageError::invalid_argument(format!(
                "page {page} is not on storage"
            )));
        }
        self.read_flag(page)
    }

    fn read_flag(&self, page: PageIndex) -> Result<bool> {
        let page_size = self.page_size();
        let mut flag = [0u8; 1];
        self.store.read_at(slot_offset(page_size, page), &mut flag)?;
        match flag[0] {
            FLAG_ALLOC => Ok(true),
            FLAG_FREE => Ok(false),
            other => Err(StorageError::corrupt_data(format!(
                "page {page}: invalid allocation flag byte 0x{other:02X}"
            ))),
        }
    }

    fn write_flag(&self, page: PageIndex, allocated: bool) -> Result<()> {
        let page_size = self.page_size();
        let flag = if allocated { FLAG_ALLOC } else { FLAG_FREE };
        self.store.write_at(slot_offset(page_size, page), &[flag])
    }

    fn read_free_links(&self, page: PageIndex) -> Result<(Option<PageIndex>, Option<PageIndex>)> {
        let page_size = self.page_size();
        let mut buf = [0u8; 16];
        self.store
            .read_at(slot_offset(page_size, page) + 1, &mut buf)?;
        let prev = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let next = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        Ok((PageIndex::from_raw(prev), PageIndex::from_raw(next)))
    }

    fn write_free_links(
        &self,
        page: PageIndex,
        prev: Option<PageIndex>,
        next: Option<PageIndex>,
    ) -> Result<()> {
        let page_size = self.page_size();
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&PageIndex::to_raw(prev).to_le_bytes());
        buf[8..16].copy_from_slice(&PageIndex::to_raw(next).to_le_bytes());
        self.store
            .write_at(slot_offset(page_size, page) + 1, &buf)
    }

    fn write_free_slot(
        &self,
        page: PageIndex,
        prev: Option<PageIndex>,
        next: Option<PageIndex>,
    ) -> Result<()> {
        self.write_flag(page, false)?;
        self.write_free_links(page, prev, next)
    }

    /// Pop the head of the free list, mark it allocated, and return its
    /// index. The payload's initial content is left as-is (spec §9 open
    /// question: "unchanged" mode).
    pub fn try_allocate_page(&self) -> Result<Option<PageIndex>> {
        self.require_mutable()?;
        let head = {
            let state = self.state.lock();
            state.header.first_free
        };
        let Some(head) = head else {
            return Ok(None);
        };
        let (_, next) = self.read_free_links(head)?;
        if let Some(next) = next {
            let (_, next_next) = self.read_free_links(next)?;
            self.write_free_links(next, None, next_next)?;
        }
        self.write_flag(head, true)?;

        {
            let mut state = self.state.lock();
            state.header.first_free = next;
            if next.is_none() {
                state.header.last_free = None;
            }
            state.header.allocated_count += 1;
        }
        self.flush_header()?;
        log::debug!("paged storage: allocated page {head}");
        Ok(Some(head))
    }

    /// Append `page` to the tail of the free list. Returns `false` (no
    /// error) if the page was already free.
    pub fn free_page(&self, page: PageIndex) -> Result<bool> {
        self.require_mutable()?;
        if !self.is_page_allocated(page)? {
            return Ok(false);
        }
        let old_tail = { self.state.lock().header.last_free };
        self.write_free_slot(page, old_tail, None)?;
        if let Some(tail) = old_tail {
            let (prev, _) = self.read_free_links(tail)?;
            self.write_free_links(tail, prev, Some(page))?;
        }
        {
            let mut state = self.state.lock();
            if state.header.first_free.is_none() {
                state.header.first_free = Some(page);
            }
            state.header.last_free = Some(page);
            state.header.allocated_count -= 1;
        }
        self.flush_header()?;
        log::debug!("paged storage: freed page {page}");
        Ok(true)
    }

    /// Grow capacity by up to `additional` slots. Stops early (without
    /// error) on a clean safe-resize refusal; reports partial progress on
    /// cancellation.
    pub fn try_inflate(
        &self,
        additional: u64,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.require_mutable()?;
        if self.capacity_fixed {
            return Err(StorageError::invalid_operation(
                "cannot inflate a fixed-capacity Paged Storage",
            ));
        }
        let page_size = self.page_size();
        let mut created = 0u64;
        for _ in 0..additional {
            if cancel.is_cancelled() {
                break;
            }
            let capacity = self.state.lock().capacity;
            let new_len = required_length(page_size, capacity + 1);
            if self.store.supports_safe_resize() {
                if !self.store.try_set_size(new_len)? {
                    break;
                }
            } else {
                self.store.set_len(new_len)?;
            }

            let new_index = PageIndex::new(capacity);
            let old_tail = { self.state.lock().header.last_free };
            self.write_free_slot(new_index, old_tail, None)?;
            if let Some(tail) = old_tail {
                let (prev, _) = self.read_free_links(tail)?;
                self.write_free_links(tail, prev, Some(new_index))?;
            }
            {
                let mut state = self.state.lock();
                if state.header.first_free.is_none() {
                    state.header.first_free = Some(new_index);
                }
                state.header.last_free = Some(new_index);
                state.capacity += 1;
            }
            self.flush_header()?;
            created += 1;
            progress.report(created, Some(additional));
        }
        log::debug!("paged storage: inflated by {created} pages");
        Ok(created)
    }

    /// Shrink capacity by up to `remove` slots, always from the end.
    /// Stops cleanly as soon as the last slot is allocated, or as soon as
    /// a safe-resize refuses.
    pub fn try_deflate(
        &self,
        remove: u64,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.require_mutable()?;
        if self.capacity_fixed {
            return Err(StorageError::invalid_operation(
                "cannot deflate a fixed-capacity Paged Storage",
            ));
        }
        let page_size = self.page_size();
        let mut removed = 0u64;
        for _ in 0..remove {
            if cancel.is_cancelled() {
                break;
            }
            let capacity = self.state.lock().capacity;
            if capacity == 0 {
                break;
            }
            let last = PageIndex::new(capacity - 1);
            if self.is_page_allocated(last)? {
                break;
            }

            let (prev, next) = self.read_free_links(last)?;
            self.unlink_free(last, prev, next)?;

            let new_len = required_length(page_size, capacity - 1);
            let shrunk = if self.store.supports_safe_resize() {
                self.store.try_set_size(new_len)?
            } else {
                self.store.set_len(new_len)?;
                true
            };

            if !shrunk {
                // Put it back and stop.
                self.relink_free_tail(last, prev, next)?;
                break;
            }

            self.state.lock().capacity -= 1;
            self.flush_header()?;
            removed += 1;
            progress.report(removed, Some(remove));
        }
        log::debug!("paged storage: deflated by {removed} pages");
        Ok(removed)
    }

    fn unlink_free(
        &self,
        page: PageIndex,
        prev: Option<PageIndex>,
        next: Option<PageIndex>,
    ) -> Result<()> {
        match prev {
            Some(p) => {
                let (pp, _) = self.read_free_links(p)?;
                self.write_free_links(p, pp, next)?;
            }
            None => self.state.lock().header.first_free = next,
        }
        match next {
            Some(n) => {
                let (_, nn) = self.read_free_links(n)?;
                self.write_free_links(n, prev, nn)?;
            }
            None => self.state.lock().header.last_free = prev,
        }
        let _ = page;
        Ok(())
    }

    fn relink_free_tail(
        &self,
        page: PageIndex,
        prev: Option<PageIndex>,
        next: Option<PageIndex>,
    ) -> Result<()> {
        match prev {
            Some(p) => {
                let (pp, _) = self.read_free_links(p)?;
                self.write_free_links(p, pp, Some(page))?;
            }
            None => self.state.lock().header.first_free = Some(page),
        }
        match next {
            Some(n) => {
                let (_, nn) = self.read_free_links(n)?;
                self.write_free_links(n, Some(page), nn)?;
            }
            None => self.state.lock().header.last_free = Some(page),
        }
        Ok(())
    }

    fn check_bounds(&self, page: PageIndex, off: u64, len: u64, buf_len: u64) -> Result<()> {
        let page_size = self.page_size();
        off.checked_add(len)
            .filter(|&end| end <= page_size)
            .ok_or_else(|| StorageError::invalid_argument("offset+length exceeds page_size"))?;
        if len > buf_len {
            return Err(StorageError::invalid_argument(
                "length exceeds destination buffer",
            ));
        }
        if !self.is_page_allocated(page)? {
            return Err(StorageError::invalid_operation(format!(
                "page {page} is not allocated"
            )));
        }
        Ok(())
    }

    pub fn read_from(
        &self,
        page: PageIndex,
        src_off: u64,
        buf: &mut [u8],
        dst_off: u64,
        len: u64,
    ) -> Result<()> {
        self.check_bounds(page, src_off, len, (buf.len() as u64).saturating_sub(dst_off))?;
        let page_size = self.page_size();
        let offset = slot_offset(page_size, page) + 1 + src_off;
        let dst = dst_off as usize;
        self.store
            .read_at(offset, &mut buf[dst..dst + len as usize])
    }

    pub fn write_to(
        &self,
        page: PageIndex,
        dst_off: u64,
        buf: &[u8],
        src_off: u64,
        len: u64,
    ) -> Result<()> {
        self.require_mutable()?;
        self.check_bounds(page, dst_off, len, (buf.len() as u64).saturating_sub(src_off))?;
        let page_size = self.page_size();
        let offset = slot_offset(page_size, page) + 1 + dst_off;
        let src = src_off as usize;
        self.store.write_at(offset, &buf[src..src + len as usize])
    }

    /// Re-read the header from the backing store and walk the free list,
    /// checking every invariant from spec §8. Cancellation returns `Ok
    /// (false)` with no error; any structural violation raises
    /// `CorruptData`.
    pub fn validate(&self, progress: &dyn ProgressSink, cancel: &CancellationToken) -> Result<bool> {
        let mut header_buf = vec![0u8; HEADER_SIZE as usize];
        self.store.read_at(0, &mut header_buf)?;
        let header = StorageHeader::read(&header_buf)?;
        let capacity = capacity_for_length(header.page_size, self.store.len()?);

        let mut count = 0u64;
        let mut prev: Option<PageIndex> = None;
        let mut node = header.first_free;

        while let Some(current) = node {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            if current.value() >= capacity {
                return Err(StorageError::corrupt_data(format!(
                    "free list references out-of-range page {current}"
                )));
            }
            if self.read_flag(current)? {
                return Err(StorageError::corrupt_data(format!(
                    "free list references allocated page {current}"
                )));
            }
            let (back, next) = self.read_free_links(current)?;
            if back != prev {
                return Err(StorageError::corrupt_data(format!(
                    "free list back-link mismatch at page {current}"
                )));
            }
            progress.report(count, None);
            count += 1;
            prev = Some(current);
            node = next;
        }

        if header.last_free != prev {
            return Err(StorageError::corrupt_data(
                "header last_free does not match the free list's actual tail",
            ));
        }
        if header.allocated_count > capacity {
            return Err(StorageError::corrupt_data(format!(
                "header allocated_count ({}) exceeds capacity ({capacity})",
                header.allocated_count
            )));
        }
        if count != capacity - header.allocated_count {
            return Err(StorageError::corrupt_data(format!(
                "free list length {count} does not match capacity - allocated_count ({})",
                capacity - header.allocated_count
            )));
        }
        Ok(true)
    }
}

fn prev_of(i: u64) -> Option<PageIndex> {
    if i == 0 {
        None
    } else {
        Some(PageIndex::new(i - 1))
    }
}

fn next_of(i: u64, capacity: u64) -> Option<PageIndex> {
    if i + 1 < capacity {
        Some(PageIndex::new(i + 1))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing_store::MemBackingStore;
    use crate::progress::NoopProgress;

    fn new_storage(page_size: u64, capacity: u64) -> PagedStorage<MemBackingStore> {
        let store = Arc::new(MemBackingStore::new());
        PagedStorage::create(
            store,
            page_size,
            capacity,
            &NoopProgress,
            &CancellationToken::never(),
            1 << 20,
        )
        .unwrap()
    }

    #[test]
    fn create_zero_capacity() {
        let storage = new_storage(16, 0);
        assert_eq!(storage.capacity(), 0);
        assert_eq!(storage.try_allocate_page().unwrap(), None);
    }

    #[test]
    fn allocate_free_allocate_may_reuse() {
        let storage = new_storage(16, 2);
        let a = storage.try_allocate_page().unwrap().unwrap();
        let b = storage.try_allocate_page().unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(storage.try_allocate_page().unwrap(), None);

        assert!(storage.free_page(a).unwrap());
        let c = storage.try_allocate_page().unwrap().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn free_list_fifo_order_avoids_immediate_reuse() {
        let storage = new_storage(16, 3);
        let a = storage.try_allocate_page().unwrap().unwrap();
        let b = storage.try_allocate_page().unwrap().unwrap();
        storage.free_page(a).unwrap();
        storage.free_page(b).unwrap();
        // a was freed first, so it is reused first (pop from head).
        let reused = storage.try_allocate_page().unwrap().unwrap();
        assert_eq!(reused, a);
    }

    #[test]
    fn read_write_roundtrip() {
        let storage = new_storage(32, 1);
        let page = storage.try_allocate_page().unwrap().unwrap();
        storage.write_to(page, 0, b"hello world", 0, 11).unwrap();
        let mut buf = [0u8; 11];
        storage.read_from(page, 0, &mut buf, 0, 11).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn inflate_then_allocate() {
        let storage = new_storage(16, 0);
        let created = storage
            .try_inflate(1, &NoopProgress, &CancellationToken::never())
            .unwrap();
        assert_eq!(created, 1);
        assert_eq!(storage.capacity(), 1);
        assert!(storage.try_allocate_page().unwrap().is_some());
    }

    #[test]
    fn deflate_stops_when_last_slot_allocated() {
        let storage = new_storage(16, 2);
        let _a = storage.try_allocate_page().unwrap().unwrap();
        // capacity-1 (index 1) is still free, should deflate once, then
        // stop because index 0 is allocated.
        let removed = storage
            .try_deflate(5, &NoopProgress, &CancellationToken::never())
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.capacity(), 1);
    }

    #[test]
    fn inflate_cancellation_returns_partial_count() {
        let storage = new_storage(16, 0);
        let cancel = CancellationToken::new();
        let mut count = 0u64;
        let progress = move |current: u64, _target: Option<u64>| {
            if current == 5 {
                // handled externally below
            }
        };
        let _ = progress;
        // Drive manually since our progress sink is stateless in this test.
        for _ in 0..5 {
            storage
                .try_inflate(1, &NoopProgress, &CancellationToken::never())
                .unwrap();
            count += 1;
        }
        cancel.cancel();
        let created = storage.try_inflate(95, &NoopProgress, &cancel).unwrap();
        assert_eq!(created, 0);
        assert_eq!(storage.capacity(), count);
    }

    #[test]
    fn validate_detects_bad_flag_byte() {
        let storage = new_storage(16, 2);
        let page = storage.try_allocate_page().unwrap().unwrap();
        storage.free_page(page).unwrap();
        // Corrupt the flag byte directly.
        storage.store.write_at(slot_offset(16, page), &[0x01]).unwrap();
        let err = storage
            .validate(&NoopProgress, &CancellationToken::never())
            .unwrap_err();
        assert!(matches!(err, StorageError::CorruptData(_)));
    }

    #[test]
    fn validate_detects_bad_first_free_pointer() {
        let storage = new_storage(16, 2);
        let allocated = storage.try_allocate_page().unwrap().unwrap();
        storage.state.lock().header.first_free = Some(allocated);
        storage.flush_header().unwrap();
        let err = storage
            .validate(&NoopProgress, &CancellationToken::never())
            .unwrap_err();
        assert!(matches!(err, StorageError::CorruptData(_)));
    }

    #[test]
    fn validate_passes_on_healthy_storage() {
        let storage = new_storage(16, 4);
        let a = storage.try_allocate_page().unwrap().unwrap();
        storage.try_allocate_page().unwrap().unwrap();
        storage.free_page(a).unwrap();
        assert!(storage
            .validate(&NoopProgress, &CancellationToken::never())
            .unwrap());
    }

    #[test]
    fn entry_page_roundtrip() {
        let storage = new_storage(16, 1);
        assert_eq!(storage.entry_page(), None);
        let page = storage.try_allocate_page().unwrap().unwrap();
        storage.set_entry_page(Some(page)).unwrap();
        assert_eq!(storage.entry_page(), Some(page));
    }

    #[test]
    fn load_round_trips_through_a_fresh_instance() {
        let store = Arc::new(MemBackingStore::new());
        {
            let storage = PagedStorage::create(
                store.clone(),
                32,
                4,
                &NoopProgress,
                &CancellationToken::never(),
                1 << 20,
            )
            .unwrap();
            let page = storage.try_allocate_page().unwrap().unwrap();
            storage.write_to(page, 0, b"persisted", 0, 9).unwrap();
            storage.set_entry_page(Some(page)).unwrap();
        }
        let reloaded = PagedStorage::load(store, false, false).unwrap();
        assert_eq!(reloaded.capacity(), 4);
        assert_eq!(reloaded.allocated_count(), 1);
        let entry = reloaded.entry_page().unwrap();
        let mut buf = [0u8; 9];
        reloaded.read_from(entry, 0, &mut buf, 0, 9).unwrap();
        assert_eq!(&buf, b"persisted");
    }
}
