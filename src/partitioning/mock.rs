//! The mock module contains a mock [`PartitioningScheme`] used for tests
use bytes::Bytes;
use std::collections::HashMap;

use super::{Key, PartitionId, PartitioningScheme};
use crate::error::Result;

/// Routes simple keys according to a fixed table. Keys missing from the table go to partition 0.
///
/// Tests use it to place keys in known partitions without searching for hash collisions.
#[derive(Debug)]
pub struct MockPartitioningScheme {
    partition_count: u32,
    table: HashMap<Bytes, PartitionId>,
}

impl MockPartitioningScheme {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count,
            table: HashMap::new(),
        }
    }

    pub fn with_key<T: Into<Bytes>>(mut self, key: T, partition: PartitionId) -> Self {
        self.table.insert(key.into(), partition);
        self
    }
}

impl PartitioningScheme for MockPartitioningScheme {
    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    fn hash_partition(&self, serialized_key: &[u8]) -> Result<PartitionId> {
        match Key::deserialize(Bytes::copy_from_slice(serialized_key))? {
            Key::Simple(raw) => Ok(self.table.get(&raw).copied().unwrap_or(0)),
            _ => Ok(0),
        }
    }
}
