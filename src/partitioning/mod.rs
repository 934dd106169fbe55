//! Partition assignment.
//!
//! Every [`Key`] maps to exactly one partition in `[0, partition_count)`. Partitions are the unit of
//! ownership, backup placement and transactional atomicity, so this mapping has to be stable across
//! processes: it is always computed from the canonical serialized form of the key
//! (see [`Key::serialize`]), never from in-memory identity.
use std::fmt::Debug;

use crate::error::{Error, InvalidRequest, Result};

pub mod hashing;
pub mod key;
pub mod mock;

pub use key::Key;

/// Identifier of a partition
pub type PartitionId = u32;

/// Partition count used when none is configured. A prime keeps the modulo distribution even.
pub const DEFAULT_PARTITION_COUNT: u32 = 257;

/// This trait defines a PartitioningScheme (ie: how keys are split amongst partitions).
///
/// Implementations only have to decide where a *simple* key goes. Key association and synthetic
/// partition keys are resolved by the provided methods and are the same for every scheme.
pub trait PartitioningScheme: Debug + Send + Sync {
    /// Number of partitions. Fixed for the lifetime of the scheme.
    fn partition_count(&self) -> u32;

    /// Maps the canonical serialized form of a simple key to its partition
    fn hash_partition(&self, serialized_key: &[u8]) -> Result<PartitionId>;

    /// Returns the partition that owns the given key.
    ///
    /// An associated key follows the partition of the key it is associated with. Association is followed
    /// a single level: if the associated key declares an association itself, [`Error::InvalidAssociation`]
    /// is returned.
    fn partition_of(&self, key: &Key) -> Result<PartitionId> {
        match key {
            Key::Simple(_) => self.hash_partition(&key.serialize()),
            Key::Partition(partition) => self.check_partition(*partition),
            Key::Associated { associated, .. } => {
                if associated.associated_key().is_some() {
                    return Err(Error::InvalidAssociation {
                        key: key.serialize(),
                        associated: associated.serialize(),
                    });
                }

                self.partition_of(associated)
            }
        }
    }

    /// Returns a synthetic key guaranteed to resolve to the given partition.
    ///
    /// The key is not expected to point to any specific entry. Its purpose is addressing partitions
    /// directly, eg: running something once on every partition.
    fn partition_key(&self, partition: PartitionId) -> Result<Key> {
        self.check_partition(partition).map(Key::Partition)
    }

    /// Verifies that the given partition is in range for this scheme
    fn check_partition(&self, partition: PartitionId) -> Result<PartitionId> {
        if partition < self.partition_count() {
            Ok(partition)
        } else {
            Err(Error::InvalidRequest(InvalidRequest::PartitionOutOfRange {
                partition,
                partition_count: self.partition_count(),
            }))
        }
    }
}
