//! Key/value codec contract (spec §6).
//!
//! Concrete fixed-size record codecs are, per spec §1, an external
//! collaborator of the core: the B-tree treats keys and values as opaque
//! byte runs of a fixed, codec-declared size. `FixedU64Codec` and
//! `FixedBytesCodec` below are small reference implementations — enough
//! to exercise the engine in tests and doctests — not part of the core
//! contract itself.

use crate::error::{Result, StorageError};

/// Serializes a value type to and from a fixed-size byte record.
///
/// `DATA_SIZE` is constant for the whole lifetime of the codec: every
/// B-tree built over a given `Codec` implementation uses exactly that
/// many bytes per key (or per value).
pub trait Codec<T> {
    const DATA_SIZE: usize;

    fn serialize(value: &T, buf: &mut [u8]);
    fn deserialize(buf: &[u8]) -> Result<T>;
}

/// Big-endian `u64` codec. Big-endian is load-bearing here: it makes the
/// byte-wise order of the 8-byte record match numeric order, which is a
/// handy property to have but is not required by the B-tree itself (the
/// tree compares deserialized `K: Ord` values, never raw bytes).
pub struct FixedU64Codec;

impl Codec<u64> for FixedU64Codec {
    const DATA_SIZE: usize = 8;

    fn serialize(value: &u64, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&value.to_be_bytes());
    }

    fn deserialize(buf: &[u8]) -> Result<u64> {
        let arr: [u8; 8] = buf[..8]
            .try_into()
            .map_err(|_| StorageError::corrupt_data("u64 codec: short buffer"))?;
        Ok(u64::from_be_bytes(arr))
    }
}

/// Fixed-width byte array codec for `[u8; N]`, zero-padded on write and
/// returned verbatim on read. Useful for short string keys stored
/// null-padded.
pub struct FixedBytesCodec<const N: usize>;

impl<const N: usize> Codec<[u8; N]> for FixedBytesCodec<N> {
    const DATA_SIZE: usize = N;

    fn serialize(value: &[u8; N], buf: &mut [u8]) {
        buf[..N].copy_from_slice(value);
    }

    fn deserialize(buf: &[u8]) -> Result<[u8; N]> {
        buf[..N]
            .try_into()
            .map_err(|_| StorageError::corrupt_data("fixed-bytes codec: short buffer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_roundtrip() {
        let mut buf = [0u8; 8];
        FixedU64Codec::serialize(&42, &mut buf);
        assert_eq!(FixedU64Codec::deserialize(&buf).unwrap(), 42);

        // Byte order matches numeric order.
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        FixedU64Codec::serialize(&1, &mut a);
        FixedU64Codec::serialize(&2, &mut b);
        assert!(a < b);
    }

    #[test]
    fn fixed_bytes_roundtrip() {
        let mut buf = [0u8; 4];
        let value = [1u8, 2, 3, 4];
        FixedBytesCodec::<4>::serialize(&value, &mut buf);
        assert_eq!(FixedBytesCodec::<4>::deserialize(&buf).unwrap(), value);
    }
}
