//! The 40-byte Paged Storage header (spec §3): five little-endian u64
//! fields living at the front of the backing store, followed immediately
//! by the slot array.

use crate::error::{Result, StorageError};
use crate::types::{PageIndex, HEADER_SIZE};

#[derive(Debug, Clone, Copy)]
pub struct StorageHeader {
    pub page_size: u64,
    pub entry_page: Option<PageIndex>,
    pub allocated_count: u64,
    pub first_free: Option<PageIndex>,
    pub last_free: Option<PageIndex>,
}

impl StorageHeader {
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if (bytes.len() as u64) < HEADER_SIZE {
            return Err(StorageError::corrupt_data("header shorter than 40 bytes"));
        }
        let page_size = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let entry_page_raw = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let allocated_count = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let first_free_raw = i64::from_le_bytes(bytes[24..32].try_into().unwrap());
        let last_free_raw = i64::from_le_bytes(bytes[32..40].try_into().unwrap());

        Ok(Self {
            page_size,
            entry_page: PageIndex::from_raw(entry_page_raw),
            allocated_count,
            first_free: PageIndex::from_raw(first_free_raw),
            last_free: PageIndex::from_raw(last_free_raw),
        })
    }

    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0..8].copy_from_slice(&self.page_size.to_le_bytes());
        bytes[8..16].copy_from_slice(&PageIndex::to_raw(self.entry_page).to_le_bytes());
        bytes[16..24].copy_from_slice(&self.allocated_count.to_le_bytes());
        bytes[24..32].copy_from_slice(&PageIndex::to_raw(self.first_free).to_le_bytes());
        bytes[32..40].copy_from_slice(&PageIndex::to_raw(self.last_free).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = StorageHeader {
            page_size: 256,
            entry_page: Some(PageIndex::new(3)),
            allocated_count: 7,
            first_free: Some(PageIndex::new(0)),
            last_free: None,
        };
        let mut bytes = [0u8; HEADER_SIZE as usize];
        header.write(&mut bytes);
        let restored = StorageHeader::read(&bytes).unwrap();
        assert_eq!(restored.page_size, 256);
        assert_eq!(restored.entry_page, Some(PageIndex::new(3)));
        assert_eq!(restored.allocated_count, 7);
        assert_eq!(restored.first_free, Some(PageIndex::new(0)));
        assert_eq!(restored.last_free, None);
    }

    #[test]
    fn nulls_roundtrip_as_minus_one() {
        let header = StorageHeader {
            page_size: 16,
            entry_page: None,
            allocated_count: 0,
            first_free: None,
            last_free: None,
        };
        let mut bytes = [0u8; HEADER_SIZE as usize];
        header.write(&mut bytes);
        assert_eq!(i64::from_le_bytes(bytes[8..16].try_into().unwrap()), -1);
        let restored = StorageHeader::read(&bytes).unwrap();
        assert!(restored.entry_page.is_none());
        assert!(restored.first_free.is_none());
        assert!(restored.last_free.is_none());
    }
}
