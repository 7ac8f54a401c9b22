//! The backing store contract (spec §6) — the random-access byte
//! container that [`crate::paged::PagedStorage`] partitions into pages.
//!
//! This is an external collaborator per spec §1: the core only depends on
//! the trait below. `FileBackingStore` and `MemBackingStore` are the two
//! concrete implementations this crate ships, grounded on the teacher's
//! `DiskManagerImpl` (`src/storage/disk_manager.rs`), generalized from
//! page-oriented I/O to raw offset/length I/O since Paged Storage, not the
//! backing store, now owns the notion of a page.

use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A random-access byte container.
///
/// Implementations must be `Send + Sync`: Paged Storage, the Page Cache,
/// and the B-tree each serialize their *own* state behind a single
/// exclusive lock (spec §5), but the backing store underneath is shared
/// across layers and must handle concurrent calls itself.
pub trait BackingStore: Send + Sync {
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;

    /// Unconditionally set the length. May fail; on failure the content
    /// and length are not guaranteed to be unchanged (a potentially
    /// corrupting operation per spec §4.1/§7).
    fn set_len(&self, new_len: u64) -> Result<()>;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes must be flushed (durable in the backing store) before
    /// returning, per spec §4.1's header-write contract.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Whether `try_set_size` is a real safe-resize rather than a
    /// not-implemented stub. When `false`, callers must treat any resize
    /// failure through `set_len` as potentially corrupting.
    fn supports_safe_resize(&self) -> bool {
        false
    }

    /// Atomically succeed (length and data beyond `new_len` truncated; new
    /// tail bytes undefined when growing) or leave state unchanged and
    /// return `Ok(false)`. Only meaningful when `supports_safe_resize` is
    /// `true`; the default implementation falls back to `set_len` and is
    /// therefore *not* safe — it exists only so implementors that don't
    /// support safe resize don't have to provide a body.
    fn try_set_size(&self, new_len: u64) -> Result<bool> {
        self.set_len(new_len)?;
        Ok(true)
    }

    /// An optional upper bound on how large this store can grow.
    fn max_size(&self) -> Option<u64> {
        None
    }
}

/// A file-backed store. Plain `set_len` (via `File::set_len`) is the only
/// resize primitive it exposes — on most filesystems a failed truncate or
/// extend can leave the file length in an unspecified state, so this
/// implementation does *not* claim safe-resize support (spec §8 boundary:
/// "a non-safe-resizable backing store reports any resize failure as
/// `Io`").
pub struct FileBackingStore {
    file: Mutex<File>,
}

impl FileBackingStore {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl BackingStore for FileBackingStore {
    fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn set_len(&self, new_len: u64) -> Result<()> {
        let file = self.file.lock();
        file.set_len(new_len)?;
        file.sync_all()?;
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        file.sync_data()?;
        Ok(())
    }
}

/// An in-memory store backed by a `Vec<u8>`, used in tests and for
/// embedding scenarios that don't need durability across process restarts.
///
/// Unlike `FileBackingStore`, it implements genuine safe-resize: growing
/// or shrinking a `Vec` either succeeds outright or (when `max_size` would
/// be exceeded) is rejected before anything is mutated, which is exactly
/// the "cleanly refuses" contract spec §4.1 asks backing stores to offer
/// when they can.
pub struct MemBackingStore {
    data: RwLock<Vec<u8>>,
    max_size: Option<u64>,
}

impl MemBackingStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            max_size: None,
        }
    }

    /// Create a store that cleanly refuses to grow past `max_size` bytes.
    pub fn with_max_size(max_size: u64) -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            max_size: Some(max_size),
        }
    }
}

impl Default for MemBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for MemBackingStore {
    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_len(&self, new_len: u64) -> Result<()> {
        self.data.write().resize(new_len as usize, 0);
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(crate::error::StorageError::invalid_argument(
                "read past end of backing store",
            ));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(crate::error::StorageError::invalid_argument(
                "write past end of backing store",
            ));
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn supports_safe_resize(&self) -> bool {
        true
    }

    fn try_set_size(&self, new_len: u64) -> Result<bool> {
        if let Some(max) = self.max_size {
            if new_len > max {
                return Ok(false);
            }
        }
        self.data.write().resize(new_len as usize, 0);
        Ok(true)
    }

    fn max_size(&self) -> Option<u64> {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_read_write_roundtrip() {
        let store = MemBackingStore::new();
        store.set_len(16).unwrap();
        store.write_at(4, b"test").unwrap();
        let mut buf = [0u8; 4];
        store.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"test");
    }

    #[test]
    fn mem_store_safe_resize_refuses_cleanly() {
        let store = MemBackingStore::with_max_size(10);
        assert!(store.try_set_size(10).unwrap());
        assert_eq!(store.len().unwrap(), 10);
        assert!(!store.try_set_size(11).unwrap());
        // State unchanged after a clean refusal.
        assert_eq!(store.len().unwrap(), 10);
    }

    #[test]
    fn file_store_has_no_safe_resize() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackingStore::open(&dir.path().join("f.db")).unwrap();
        assert!(!store.supports_safe_resize());
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackingStore::open(&dir.path().join("f.db")).unwrap();
        store.set_len(8).unwrap();
        store.write_at(0, b"abcdefgh").unwrap();
        let mut buf = [0u8; 8];
        store.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
    }
}
