use serde::{Deserialize, Serialize};

use crate::{partitioning::DEFAULT_PARTITION_COUNT, storage_engine::StorageEngineKind};

fn default_partition_count() -> u32 {
    DEFAULT_PARTITION_COUNT
}

fn default_backup_count() -> u32 {
    1
}

fn default_lock_timeout_ms() -> Option<u64> {
    Some(5000)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub service_name: String,
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,
    /// Number of backup copies the distribution is expected to keep, see
    /// [`super::PartitionedService::ownership_snapshot`]
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
    /// Maximum time a unit of work waits on a single key lock. `null` waits forever.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: Option<u64>,
    #[serde(default)]
    pub storage_engine: StorageEngineKind,
    #[serde(default)]
    pub partitioning_scheme: PartitioningScheme,
}

impl Config {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            partition_count: default_partition_count(),
            backup_count: default_backup_count(),
            lock_timeout_ms: default_lock_timeout_ms(),
            storage_engine: Default::default(),
            partitioning_scheme: Default::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitioningScheme {
    #[default]
    Murmur3Hash,
}
