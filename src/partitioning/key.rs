//! Keys and their canonical serialized form.
//!
//! # Format
//! Every serialized key starts with a single tag byte:
//!
//!  | tag  | payload                                                        |
//!  |------|----------------------------------------------------------------|
//!  | 0x01 | raw key bytes (until the end of the buffer)                    |
//!  | 0x02 | partition id as a big-endian u32                               |
//!  | 0x03 | u32 key length, key bytes, serialized associated key           |
//!
//! The serialized form is what backing stores are keyed by, what partitioning hashes and what
//! transactions sort on before locking.
use std::fmt::Display;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::PartitionId;
use crate::error::{Error, InvalidRequest, Result};

const SIMPLE_KEY_TAG: u8 = 0x01;
const PARTITION_KEY_TAG: u8 = 0x02;
const ASSOCIATED_KEY_TAG: u8 = 0x03;

/// A cache key
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    /// An opaque key
    Simple(Bytes),
    /// A key that must live in the same partition as `associated`
    Associated { key: Bytes, associated: Box<Key> },
    /// A synthetic key that resolves to the given partition.
    /// See [`super::PartitioningScheme::partition_key`]
    Partition(PartitionId),
}

impl Key {
    pub fn simple<T: Into<Bytes>>(key: T) -> Self {
        Key::Simple(key.into())
    }

    pub fn associated<T: Into<Bytes>>(key: T, associated: Key) -> Self {
        Key::Associated {
            key: key.into(),
            associated: Box::new(associated),
        }
    }

    /// The key this key declares an association with, if any
    pub fn associated_key(&self) -> Option<&Key> {
        match self {
            Key::Associated { associated, .. } => Some(associated),
            Key::Simple(_) | Key::Partition(_) => None,
        }
    }

    /// Serializes [`Key`] into its canonical binary form
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_size());
        self.serialize_into(&mut buf);
        buf.freeze()
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        match self {
            Key::Simple(key) => {
                buf.put_u8(SIMPLE_KEY_TAG);
                buf.put_slice(key);
            }
            Key::Partition(partition) => {
                buf.put_u8(PARTITION_KEY_TAG);
                buf.put_u32(*partition);
            }
            Key::Associated { key, associated } => {
                buf.put_u8(ASSOCIATED_KEY_TAG);
                buf.put_u32(key.len() as u32);
                buf.put_slice(key);
                associated.serialize_into(buf);
            }
        }
    }

    fn serialized_size(&self) -> usize {
        match self {
            Key::Simple(key) => 1 + key.len(),
            Key::Partition(_) => 1 + std::mem::size_of::<u32>(),
            Key::Associated { key, associated } => {
                1 + std::mem::size_of::<u32>() + key.len() + associated.serialized_size()
            }
        }
    }

    /// Reconstructs a [`Key`] from the output of [`Key::serialize`]
    pub fn deserialize(mut serialized: Bytes) -> Result<Key> {
        let key = Self::deserialize_from(&mut serialized)?;
        if serialized.has_remaining() {
            return Err(malformed("trailing bytes after partition key"));
        }

        Ok(key)
    }

    fn deserialize_from(buf: &mut Bytes) -> Result<Key> {
        if !buf.has_remaining() {
            return Err(malformed("empty buffer"));
        }

        match buf.get_u8() {
            SIMPLE_KEY_TAG => {
                let remaining = buf.remaining();
                Ok(Key::Simple(buf.split_to(remaining)))
            }
            PARTITION_KEY_TAG => {
                if buf.remaining() < std::mem::size_of::<u32>() {
                    return Err(malformed("partition key too small"));
                }
                Ok(Key::Partition(buf.get_u32()))
            }
            ASSOCIATED_KEY_TAG => {
                if buf.remaining() < std::mem::size_of::<u32>() {
                    return Err(malformed("associated key too small"));
                }
                let key_length = buf.get_u32() as usize;
                if buf.remaining() < key_length {
                    return Err(malformed("associated key too small"));
                }
                let key = buf.split_to(key_length);
                let associated = Self::deserialize_from(buf)?;
                Ok(Key::Associated {
                    key,
                    associated: Box::new(associated),
                })
            }
            tag => Err(malformed(&format!("unknown key tag {:#04x}", tag))),
        }
    }
}

fn malformed(reason: &str) -> Error {
    Error::InvalidRequest(InvalidRequest::MalformedKey {
        reason: reason.to_string(),
    })
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Simple(key) => write!(f, "{}", String::from_utf8_lossy(key)),
            Key::Partition(partition) => write!(f, "partition#{}", partition),
            Key::Associated { key, associated } => {
                write!(f, "{}->{}", String::from_utf8_lossy(key), associated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::Key;

    #[test]
    fn test_serialized_layout() {
        assert_eq!(&Key::simple("ab").serialize()[..], &[0x01, b'a', b'b']);
        assert_eq!(&Key::Partition(258).serialize()[..], &[0x02, 0, 0, 1, 2]);
        assert_eq!(
            &Key::associated("c", Key::simple("p")).serialize()[..],
            &[0x03, 0, 0, 0, 1, b'c', 0x01, b'p']
        );
    }

    #[test]
    fn test_deserialize_nested_association() {
        let key = Key::associated(
            "line-1",
            Key::associated("order-1", Key::simple("customer-1")),
        );
        assert_eq!(Key::deserialize(key.serialize()).unwrap(), key);
    }

    #[test]
    fn test_deserialize_malformed() {
        assert!(Key::deserialize(Bytes::new()).is_err());
        assert!(Key::deserialize(Bytes::from_static(&[0x02, 0x00])).is_err());
        assert!(Key::deserialize(Bytes::from_static(&[0x02, 0, 0, 0, 1, 0])).is_err());
        assert!(Key::deserialize(Bytes::from_static(&[0x03, 0, 0, 0, 9, b'a'])).is_err());
        assert!(Key::deserialize(Bytes::from_static(&[0x7f])).is_err());
    }

    #[test]
    fn test_serialized_order_follows_raw_bytes_for_simple_keys() {
        let mut keys = vec![Key::simple("key-c"), Key::simple("key-a"), Key::simple("key-b")];
        keys.sort_by_key(|k| k.serialize());
        assert_eq!(
            keys,
            vec![Key::simple("key-a"), Key::simple("key-b"), Key::simple("key-c")]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Key::simple("a").to_string(), "a");
        assert_eq!(Key::Partition(3).to_string(), "partition#3");
        assert_eq!(
            Key::associated("a", Key::simple("b")).to_string(),
            "a->b".to_string()
        );
    }
}
