//! An in-memory [`StorageEngine`] implementation
//!
//! This implementation uses a [`HashMap`] and does nothing fancy around performance.
//! Synchronization is the owner's problem (the partition holding it), so there's no lock in here.
use bytes::Bytes;
use std::collections::HashMap;
use tracing::instrument;

use super::{Result, StorageEngine, StorageView};

/// Type alias for the underlying datastructure used to store the key/value pairs
type Store = HashMap<Bytes, Bytes>;

/// The InMemory [`StorageEngine`] definition
#[derive(Clone, Debug, Default)]
pub struct InMemory {
    inner: Store,
}

impl StorageView for InMemory {
    #[instrument(name = "storage_engine::in_memory::get", level = "trace", skip(self))]
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.inner.get(key).cloned())
    }

    fn keys(&self) -> Result<Vec<Bytes>> {
        Ok(self.inner.keys().map(Clone::clone).collect())
    }

    #[instrument(name = "storage_engine::in_memory::entries", level = "trace", skip(self))]
    fn entries(&self) -> Result<Vec<(Bytes, Bytes)>> {
        Ok(self
            .inner
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl StorageEngine for InMemory {
    #[instrument(name = "storage_engine::in_memory::put", level = "trace", skip(self))]
    fn put(&mut self, key: Bytes, value: Bytes) -> Result<Option<Bytes>> {
        Ok(self.inner.insert(key, value))
    }

    #[instrument(name = "storage_engine::in_memory::delete", level = "trace", skip(self))]
    fn delete(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.inner.remove(key))
    }

    fn as_view(&self) -> &dyn StorageView {
        self
    }
}
