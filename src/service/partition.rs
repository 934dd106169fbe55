//! A single partition: the backing stores and indexes of every map it owns plus its key lock table.
use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytes::Bytes;
use tracing::{event, instrument, Level};

use crate::{
    error::{Error, Result},
    partitioning::PartitionId,
    query::{self, Extractor, Filter, IndexRegistry},
    storage_engine::{StorageEngine, StorageEngineKind},
    transaction::lock::LockTable,
};

/// Backing store and indexes of one map in one partition
#[derive(Debug)]
pub struct MapStore {
    engine: Box<dyn StorageEngine>,
    indexes: IndexRegistry,
}

impl MapStore {
    fn new(map: &str, kind: StorageEngineKind) -> Self {
        Self {
            engine: kind.build(),
            indexes: IndexRegistry::new(map),
        }
    }

    pub fn engine(&self) -> &dyn StorageEngine {
        self.engine.as_ref()
    }

    pub fn indexes(&self) -> &IndexRegistry {
        &self.indexes
    }

    fn put(&mut self, key: Bytes, value: Bytes) -> Result<Option<Bytes>> {
        let previous = self.engine.put(key.clone(), value.clone())?;
        self.indexes.on_put(&key, &value);
        Ok(previous)
    }

    fn delete(&mut self, key: &Bytes) -> Result<Option<Bytes>> {
        let previous = self.engine.delete(key)?;
        self.indexes.on_delete(key);
        Ok(previous)
    }
}

/// A buffered mutation, applied on commit
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Write {
    Put { map: String, key: Bytes, value: Bytes },
    Delete { map: String, key: Bytes },
}

/// Everything a partition stores. Always accessed through [`Partition::read`] / [`Partition::write`].
#[derive(Debug)]
pub struct PartitionStore {
    kind: StorageEngineKind,
    maps: HashMap<String, MapStore>,
}

impl PartitionStore {
    fn new(kind: StorageEngineKind) -> Self {
        Self {
            kind,
            maps: Default::default(),
        }
    }

    pub fn map(&self, name: &str) -> Option<&MapStore> {
        self.maps.get(name)
    }

    fn map_mut(&mut self, name: &str) -> &mut MapStore {
        let kind = self.kind;
        self.maps
            .entry(name.to_string())
            .or_insert_with(|| MapStore::new(name, kind))
    }

    pub fn get(&self, map: &str, key: &[u8]) -> Result<Option<Bytes>> {
        match self.maps.get(map) {
            Some(store) => Ok(store.engine.get(key)?),
            None => Ok(None),
        }
    }

    /// Number of entries stored for `map`
    pub fn len(&self, map: &str) -> usize {
        self.maps.get(map).map_or(0, |store| store.engine.len())
    }

    pub fn is_empty(&self, map: &str) -> bool {
        self.len(map) == 0
    }

    /// Runs a query over `map`. An unknown map simply has no entries.
    pub fn query(&self, map: &str, filter: &Filter) -> Result<Vec<(Bytes, Bytes)>> {
        match self.maps.get(map) {
            Some(store) => query::query(store.engine.as_view(), &store.indexes, filter),
            None => Ok(Vec::new()),
        }
    }

    pub fn add_index(&mut self, map: &str, extractor: Extractor, ordered: bool) -> Result<()> {
        let store = self.map_mut(map);
        store
            .indexes
            .add(extractor, ordered, store.engine.as_view())
    }

    pub fn remove_index(&mut self, map: &str, name: &str) -> bool {
        self.maps
            .get_mut(map)
            .is_some_and(|store| store.indexes.remove(name))
    }

    /// Applies every write (and the matching index maintenance) or none of them.
    ///
    /// If the backing store fails halfway through, the writes already applied are reverted before the
    /// error is returned.
    pub(crate) fn apply(&mut self, writes: &[Write]) -> Result<()> {
        let mut undo: Vec<(String, Bytes, Option<Bytes>)> = Vec::with_capacity(writes.len());
        for write in writes {
            let applied = match write {
                Write::Put { map, key, value } => self
                    .map_mut(map)
                    .put(key.clone(), value.clone())
                    .map(|previous| (map, key, previous)),
                Write::Delete { map, key } => self
                    .map_mut(map)
                    .delete(key)
                    .map(|previous| (map, key, previous)),
            };

            match applied {
                Ok((map, key, previous)) => undo.push((map.clone(), key.clone(), previous)),
                Err(err) => {
                    event!(
                        Level::ERROR,
                        "unable to apply write, reverting {} writes: {}",
                        undo.len(),
                        err
                    );
                    self.revert(undo);
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    fn revert(&mut self, undo: Vec<(String, Bytes, Option<Bytes>)>) {
        for (map, key, previous) in undo.into_iter().rev() {
            let store = self.map_mut(&map);
            let reverted = match previous {
                Some(previous) => store.put(key.clone(), previous).map(|_| ()),
                None => store.delete(&key).map(|_| ()),
            };
            if let Err(err) = reverted {
                event!(
                    Level::ERROR,
                    "unable to revert write to {} key {}: {}",
                    map,
                    hex::encode(&key),
                    err
                );
            }
        }
    }
}

/// A partition owns its data and the locks protecting it.
///
/// Readers take the store read guard and so never observe a partially applied commit. Writers only
/// ever hold the write guard for the duration of [`PartitionStore::apply`], which never awaits.
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    store: RwLock<PartitionStore>,
    locks: LockTable,
}

impl Partition {
    pub fn new(id: PartitionId, kind: StorageEngineKind) -> Self {
        Self {
            id,
            store: RwLock::new(PartitionStore::new(kind)),
            locks: Default::default(),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn read(&self) -> Result<RwLockReadGuard<PartitionStore>> {
        match self.store.read() {
            Ok(guard) => Ok(guard),
            Err(_) => Err(Error::Logic {
                reason: format!("Unable to read partition {} - poisoned...", self.id),
            }),
        }
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<PartitionStore>> {
        match self.store.write() {
            Ok(guard) => Ok(guard),
            Err(_) => Err(Error::Logic {
                reason: format!("Unable to write partition {} - poisoned...", self.id),
            }),
        }
    }

    #[instrument(level = "debug", skip(self, extractor), fields(partition = self.id))]
    pub fn add_index(&self, map: &str, extractor: Extractor, ordered: bool) -> Result<()> {
        self.write()?.add_index(map, extractor, ordered)
    }

    pub fn remove_index(&self, map: &str, name: &str) -> Result<bool> {
        Ok(self.write()?.remove_index(map, name))
    }
}
