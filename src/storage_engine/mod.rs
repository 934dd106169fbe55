//! These traits represent the interface for a backing store (Key/Value)
//! Keys and values are opaque bytes and are not interpreted in any way by the implementations.
//!
//! There is one backing store per map per partition. The store is owned by its partition, which
//! serializes mutations (see [`crate::service::partition::Partition`]), so implementations don't
//! have to synchronize anything themselves.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

pub mod in_memory;

/// Read-only view over a backing store.
///
/// This is all the query engine ever gets to see: it can look at entries but has no way of
/// mutating them.
pub trait StorageView: Debug + Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;
    fn keys(&self) -> Result<Vec<Bytes>>;
    fn entries(&self) -> Result<Vec<(Bytes, Bytes)>>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A mutable backing store. Both mutations return the previous value, if any.
pub trait StorageEngine: StorageView {
    fn put(&mut self, key: Bytes, value: Bytes) -> Result<Option<Bytes>>;
    fn delete(&mut self, key: &[u8]) -> Result<Option<Bytes>>;

    fn as_view(&self) -> &dyn StorageView;
}

/// Available [`StorageEngine`] implementations
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageEngineKind {
    #[default]
    InMemory,
}

impl StorageEngineKind {
    /// Builds a new, empty, [`StorageEngine`] of this kind
    pub fn build(&self) -> Box<dyn StorageEngine> {
        match self {
            StorageEngineKind::InMemory => Box::<in_memory::InMemory>::default(),
        }
    }
}

#[derive(Debug, Serialize)]
pub enum Error {
    Internal,
    Logic { reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}
