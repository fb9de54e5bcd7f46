//! The generic key/value codec (C3's "traits layer", spec.md §6): a
//! capability interface the B+ tree is generic over, plus the built-in
//! implementations spec.md names (integers, length-prefixed strings,
//! `DataLocator`, `SizedLocator`).
//!
//! This is the idiomatic-Rust rendering of the original's template-based
//! `seriously::Traits<T>` specializations (SPEC_FULL.md §6): one trait
//! object instead of one partial-specialization per type.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::locator::{DataLocator, SizedLocator};

/// Serialize/deserialize/compare capability for a B+ tree key or value
/// type. `encode`/`decode` return `None` on overflow/underflow (not enough
/// room in `dst`, or not enough bytes in `src`) rather than panicking;
/// callers convert that into `Error::Corrupt` at the node-codec boundary.
pub trait Codec: Sized + Clone {
    fn encode(&self, dst: &mut [u8]) -> Option<usize>;
    fn decode(src: &[u8]) -> Option<(Self, usize)>;
    fn size(&self) -> usize;
    fn max_size(&self) -> usize;
    fn is_valid(&self) -> bool {
        true
    }
    fn compare(a: &Self, b: &Self) -> Ordering;
}

macro_rules! impl_int_codec {
    ($ty:ty, $width:expr, $read:path, $write:path) => {
        impl Codec for $ty {
            fn encode(&self, dst: &mut [u8]) -> Option<usize> {
                if dst.len() < $width {
                    return None;
                }
                $write(&mut dst[..$width], *self);
                Some($width)
            }

            fn decode(src: &[u8]) -> Option<(Self, usize)> {
                if src.len() < $width {
                    return None;
                }
                Some(($read(&src[..$width]), $width))
            }

            fn size(&self) -> usize {
                $width
            }

            fn max_size(&self) -> usize {
                $width
            }

            fn compare(a: &Self, b: &Self) -> Ordering {
                a.cmp(b)
            }
        }
    };
}

impl_int_codec!(u32, 4, LittleEndian::read_u32, LittleEndian::write_u32);
impl_int_codec!(u64, 8, LittleEndian::read_u64, LittleEndian::write_u64);
impl_int_codec!(i32, 4, LittleEndian::read_i32, LittleEndian::write_i32);
impl_int_codec!(i64, 8, LittleEndian::read_i64, LittleEndian::write_i64);

/// Length-prefixed UTF-8 string: 4-byte LE length followed by the bytes.
impl Codec for String {
    fn encode(&self, dst: &mut [u8]) -> Option<usize> {
        let bytes = self.as_bytes();
        let total = 4 + bytes.len();
        if dst.len() < total {
            return None;
        }
        LittleEndian::write_u32(&mut dst[0..4], bytes.len() as u32);
        dst[4..total].copy_from_slice(bytes);
        Some(total)
    }

    fn decode(src: &[u8]) -> Option<(Self, usize)> {
        if src.len() < 4 {
            return None;
        }
        let len = LittleEndian::read_u32(&src[0..4]) as usize;
        let total = 4 + len;
        if src.len() < total {
            return None;
        }
        let s = std::str::from_utf8(&src[4..total]).ok()?.to_owned();
        Some((s, total))
    }

    fn size(&self) -> usize {
        4 + self.as_bytes().len()
    }

    /// Advisory worst case for node-capacity planning; strings are not
    /// used as the store's own tree key/value type (that's `Fingerprint`/
    /// `DataLocator`) so this only matters for a tree instantiated
    /// directly over `String` keys or values.
    fn max_size(&self) -> usize {
        4 + 256
    }

    fn compare(a: &Self, b: &Self) -> Ordering {
        a.cmp(b)
    }
}

/// 2-byte offset followed by 4-byte block id (6 bytes total), per spec.md §6.
impl Codec for DataLocator {
    fn encode(&self, dst: &mut [u8]) -> Option<usize> {
        if dst.len() < 6 {
            return None;
        }
        LittleEndian::write_i16(&mut dst[0..2], self.offset());
        LittleEndian::write_u32(&mut dst[2..6], self.block_id());
        Some(6)
    }

    fn decode(src: &[u8]) -> Option<(Self, usize)> {
        if src.len() < 6 {
            return None;
        }
        let offset = LittleEndian::read_i16(&src[0..2]);
        let block_id = LittleEndian::read_u32(&src[2..6]);
        Some((DataLocator::new(block_id, offset), 6))
    }

    fn size(&self) -> usize {
        6
    }

    fn max_size(&self) -> usize {
        6
    }

    fn is_valid(&self) -> bool {
        crate::block::block_id_valid(self.block_id())
    }

    fn compare(a: &Self, b: &Self) -> Ordering {
        a.cmp(b)
    }
}

/// `DataLocator` plus a 4-byte LE size (10 bytes total), per spec.md §6.
impl Codec for SizedLocator {
    fn encode(&self, dst: &mut [u8]) -> Option<usize> {
        if dst.len() < 10 {
            return None;
        }
        self.data_locator().encode(&mut dst[0..6])?;
        LittleEndian::write_u32(&mut dst[6..10], self.envelope_size());
        Some(10)
    }

    fn decode(src: &[u8]) -> Option<(Self, usize)> {
        if src.len() < 10 {
            return None;
        }
        let (dl, _) = DataLocator::decode(&src[0..6])?;
        let size = LittleEndian::read_u32(&src[6..10]);
        Some((SizedLocator::new(dl, size), 10))
    }

    fn size(&self) -> usize {
        10
    }

    fn max_size(&self) -> usize {
        10
    }

    fn is_valid(&self) -> bool {
        crate::block::block_id_valid(self.block_id())
    }

    fn compare(a: &Self, b: &Self) -> Ordering {
        (a.block_id(), a.offset(), a.envelope_size()).cmp(&(
            b.block_id(),
            b.offset(),
            b.envelope_size(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Codec + PartialEq + std::fmt::Debug>(v: T) {
        let mut buf = vec![0u8; v.max_size()];
        let n = v.encode(&mut buf).expect("encode");
        assert_eq!(n, v.size());
        let (decoded, m) = T::decode(&buf).expect("decode");
        assert_eq!(m, n);
        assert_eq!(decoded, v);
    }

    #[test]
    fn integers_roundtrip() {
        roundtrip(42u32);
        roundtrip(u64::MAX);
        roundtrip(-7i32);
        roundtrip(i64::MIN);
    }

    #[test]
    fn string_roundtrips() {
        roundtrip("hello, world".to_string());
        roundtrip(String::new());
    }

    #[test]
    fn data_locator_roundtrips() {
        roundtrip(DataLocator::new(5, 100));
    }

    #[test]
    fn sized_locator_roundtrips() {
        roundtrip(SizedLocator::new(DataLocator::new(5, 100), 42));
    }

    #[test]
    fn encode_reports_overflow_as_none() {
        let mut tiny = [0u8; 2];
        assert!(42u32.encode(&mut tiny).is_none());
    }

    #[test]
    fn decode_reports_underflow_as_none() {
        let tiny = [0u8; 2];
        assert!(u32::decode(&tiny).is_none());
    }
}
