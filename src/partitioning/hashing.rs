//! Hash partitioning is the default [`PartitioningScheme`] for partgrid
use crate::error::{Error, Result};
use murmur3::murmur3_x86_128;
use std::io::Cursor;

use super::{PartitionId, PartitioningScheme};

/// Let's force the usage of Hash functions that return u128 for now..
type HashFunctionReturnType = u128;

/// HashPartitioning maps a key to `hash(serialized key) mod partition_count`.
///
/// Unlike a hash ring, the number of partitions never changes once the scheme is built. Moving data
/// around when members join or leave is done by moving whole partitions between members, which is
/// the job of the distribution coordinator and not of this type.
///
/// The hash is computed over the canonical serialized key (see [`super::Key::serialize`]), so the
/// same logical key lands on the same partition in every process.
#[derive(Clone, Debug)]
pub struct HashPartitioning {
    partition_count: u32,
    hash_fn: fn(&[u8]) -> Result<HashFunctionReturnType>,
}

impl HashPartitioning {
    pub fn new(partition_count: u32) -> Result<Self> {
        Self::new_with_hash_fn(partition_count, murmur3_hash)
    }

    pub fn new_with_hash_fn(
        partition_count: u32,
        hash_fn: fn(&[u8]) -> Result<HashFunctionReturnType>,
    ) -> Result<Self> {
        if partition_count == 0 {
            return Err(Error::InvalidConfig {
                reason: "partition_count must be greater than 0".to_string(),
            });
        }

        Ok(Self {
            partition_count,
            hash_fn,
        })
    }
}

impl PartitioningScheme for HashPartitioning {
    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    fn hash_partition(&self, serialized_key: &[u8]) -> Result<PartitionId> {
        let hash = (self.hash_fn)(serialized_key)?;
        Ok((hash % self.partition_count as HashFunctionReturnType) as PartitionId)
    }
}

/// murmur3 x86 128 bits with a 0 seed
pub fn murmur3_hash(key: &[u8]) -> Result<HashFunctionReturnType> {
    Ok(murmur3_x86_128(&mut Cursor::new(key), 0)?)
}

#[cfg(test)]
mod tests {
    use super::HashPartitioning;
    use crate::{
        error::{Error, InvalidRequest, Result},
        partitioning::{Key, PartitioningScheme, DEFAULT_PARTITION_COUNT},
        utils::generate_random_ascii_string,
    };
    use bytes::Bytes;
    use quickcheck::Arbitrary;
    use std::collections::{HashMap, HashSet};

    #[derive(Debug, Clone)]
    struct KeysTestInput {
        keys: Vec<String>,
    }

    impl Arbitrary for KeysTestInput {
        fn arbitrary(_: &mut quickcheck::Gen) -> Self {
            Self {
                keys: (0..100).map(|_| generate_random_ascii_string(12)).collect(),
            }
        }
    }

    /// Partition assignment has to be a pure function of the key bytes.
    /// Two independently built schemes must agree on every key, and so do repeated calls.
    #[quickcheck]
    fn test_partition_of_is_deterministic(input: KeysTestInput) {
        let first = HashPartitioning::new(DEFAULT_PARTITION_COUNT).unwrap();
        let second = HashPartitioning::new(DEFAULT_PARTITION_COUNT).unwrap();

        for key in input.keys {
            let key = Key::simple(key);
            let partition = first.partition_of(&key).unwrap();
            assert!(partition < DEFAULT_PARTITION_COUNT);
            assert_eq!(partition, first.partition_of(&key).unwrap());
            assert_eq!(partition, second.partition_of(&key).unwrap());
        }
    }

    /// Whatever the associated key is, the association always wins
    #[quickcheck]
    fn test_associated_keys_follow_their_parent(input: KeysTestInput) {
        let scheme = HashPartitioning::new(DEFAULT_PARTITION_COUNT).unwrap();
        let parent = Key::simple("parent");
        let parent_partition = scheme.partition_of(&parent).unwrap();

        for key in input.keys {
            let child = Key::associated(key, parent.clone());
            assert_eq!(scheme.partition_of(&child).unwrap(), parent_partition);
        }
    }

    #[test]
    fn test_multi_level_association_is_rejected() {
        let scheme = HashPartitioning::new(DEFAULT_PARTITION_COUNT).unwrap();
        let grand_child = Key::associated(
            "line-1",
            Key::associated("order-1", Key::simple("customer-1")),
        );

        let err = scheme.partition_of(&grand_child).err().unwrap();
        match err {
            Error::InvalidAssociation { key, associated } => {
                assert_eq!(key, grand_child.serialize());
                assert_eq!(
                    associated,
                    Key::associated("order-1", Key::simple("customer-1")).serialize()
                );
            }
            _ => panic!("Unexpected error {}", err),
        }
    }

    #[test]
    fn test_association_with_partition_key() {
        let scheme = HashPartitioning::new(DEFAULT_PARTITION_COUNT).unwrap();
        let key = Key::associated("flag", scheme.partition_key(42).unwrap());
        assert_eq!(scheme.partition_of(&key).unwrap(), 42);
    }

    #[test]
    fn test_partition_key_coverage() {
        let scheme = HashPartitioning::new(DEFAULT_PARTITION_COUNT).unwrap();
        let mut seen = HashSet::new();
        for partition in 0..DEFAULT_PARTITION_COUNT {
            let key = scheme.partition_key(partition).unwrap();
            let resolved = scheme.partition_of(&key).unwrap();
            assert_eq!(resolved, partition);
            assert!(seen.insert(resolved));
        }
        assert_eq!(seen.len(), DEFAULT_PARTITION_COUNT as usize);
    }

    #[test]
    fn test_partition_key_out_of_range() {
        let scheme = HashPartitioning::new(13).unwrap();
        let err = scheme.partition_key(13).err().unwrap();
        assert!(matches!(
            err,
            Error::InvalidRequest(InvalidRequest::PartitionOutOfRange {
                partition: 13,
                partition_count: 13
            })
        ));

        // keys built by hand (or deserialized from elsewhere) are validated as well
        assert!(scheme.partition_of(&Key::Partition(100)).is_err());
    }

    #[test]
    fn test_zero_partitions() {
        assert!(matches!(
            HashPartitioning::new(0).err().unwrap(),
            Error::InvalidConfig { .. }
        ));
    }

    fn test_hash_fn(key: &[u8]) -> Result<u128> {
        // this table precisely maps known serialized keys to known hashes.
        let table: HashMap<Bytes, u128> = vec![
            (Key::simple("key 1").serialize(), 1u128),
            (Key::simple("key 2").serialize(), 12u128),
            (Key::simple("key 3").serialize(), 13u128),
            (Key::simple("key 4").serialize(), u128::MAX),
        ]
        .into_iter()
        .collect();

        table
            .get(&Bytes::copy_from_slice(key))
            .copied()
            .ok_or(Error::Logic {
                reason: "unknown key".to_string(),
            })
    }

    #[test]
    fn test_partition_of_table() {
        let scheme = HashPartitioning::new_with_hash_fn(13, test_hash_fn).unwrap();
        let test_cases = vec![
            ("key 1", 1),
            ("key 2", 12),
            ("key 3", 0), // wraps around
            ("key 4", (u128::MAX % 13) as u32),
        ];

        for (key, partition) in test_cases {
            assert_eq!(scheme.partition_of(&Key::simple(key)).unwrap(), partition);
        }

        // errors from the hash function are propagated, not defaulted
        assert!(scheme.partition_of(&Key::simple("unknown")).is_err());
    }

    /// With enough random keys every partition should receive some of them
    #[test]
    fn test_keys_spread_over_all_partitions() {
        let scheme = HashPartitioning::new(DEFAULT_PARTITION_COUNT).unwrap();
        let mut hits = vec![0usize; DEFAULT_PARTITION_COUNT as usize];
        for _ in 0..20_000 {
            let key = Key::simple(generate_random_ascii_string(16));
            hits[scheme.partition_of(&key).unwrap() as usize] += 1;
        }

        assert!(hits.iter().all(|count| *count > 0));
    }
}
