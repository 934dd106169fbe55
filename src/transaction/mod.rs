//! Partition local units of work.
//!
//! An [`EntryProcessor`] runs against a [`Transaction`] anchored at one key. The transaction can enlist
//! more entries as long as they live in the anchor's partition. Every enlisted entry is locked for the
//! duration of the unit of work and mutations are buffered until commit, where they are applied as a
//! single atomic step (see [`crate::service::partition::PartitionStore::apply`]).
//!
//! # Lock ordering
//! Locks are always waited on in ascending `(map, serialized key)` order. [`Transaction::enlist_all`]
//! sorts the keys it is given before locking anything. A key ordering *below* a lock the transaction
//! already holds can't be waited on without risking a cycle, so it is only tried once. If it is busy
//! the enlistment fails with [`Error::LockContention`] and the transaction can no longer commit. The
//! service then releases everything and runs the processor again, this time with every key it saw
//! (the busy one included) locked upfront in order. A processor may therefore run more than once.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{event, instrument, Level};

use crate::{
    error::{Error, InvalidRequest, Result},
    events::{EntryEvent, EntryInterceptor},
    partitioning::{Key, PartitionId, PartitioningScheme},
    query::Filter,
    service::partition::{Partition, Write},
};

pub mod lock;
pub mod processors;

use lock::{LockId, TransactionId};

/// Handle to an entry enlisted in a [`Transaction`]. Only valid for the transaction that returned it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryHandle(usize);

/// The application logic executed as a unit of work.
///
/// Returning an error discards every buffered mutation. The caller then gets
/// [`Error::TransactionAborted`] wrapping that error, except for the lock, association and cross
/// partition errors raised by the transaction itself, which are returned as they are.
#[async_trait]
pub trait EntryProcessor: Send + Sync {
    type Output: Send;

    async fn process(&self, tx: &mut Transaction) -> Result<Self::Output>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Pending {
    Unchanged,
    Set(Bytes),
    Remove,
}

#[derive(Debug)]
struct Entry {
    map: String,
    key: Key,
    binary: Bytes,
    original: Option<Bytes>,
    pending: Pending,
}

impl Entry {
    fn value(&self) -> Option<&Bytes> {
        match &self.pending {
            Pending::Unchanged => self.original.as_ref(),
            Pending::Set(value) => Some(value),
            Pending::Remove => None,
        }
    }

    fn event(&self) -> Option<EntryEvent> {
        let map = self.map.clone();
        let key = self.key.clone();
        match (&self.pending, &self.original) {
            (Pending::Unchanged, _) | (Pending::Remove, None) => None,
            (Pending::Set(value), None) => Some(EntryEvent::Inserted {
                map,
                key,
                value: value.clone(),
            }),
            (Pending::Set(new), Some(old)) => Some(EntryEvent::Updated {
                map,
                key,
                old: old.clone(),
                new: new.clone(),
            }),
            (Pending::Remove, Some(old)) => Some(EntryEvent::Removed {
                map,
                key,
                old: old.clone(),
            }),
        }
    }

    fn write(&self) -> Option<Write> {
        match (&self.pending, &self.original) {
            (Pending::Unchanged, _) | (Pending::Remove, None) => None,
            (Pending::Set(value), _) => Some(Write::Put {
                map: self.map.clone(),
                key: self.binary.clone(),
                value: value.clone(),
            }),
            (Pending::Remove, Some(_)) => Some(Write::Delete {
                map: self.map.clone(),
                key: self.binary.clone(),
            }),
        }
    }
}

/// A unit of work running inside a single partition.
///
/// Dropping a transaction without committing it (including dropping the future running it) discards
/// its buffered mutations and releases its locks.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    partition: Arc<Partition>,
    scheme: Arc<dyn PartitioningScheme>,
    lock_timeout: Option<Duration>,
    entries: Vec<Entry>,
    anchor: EntryHandle,
    /// in acquisition order
    locks: Vec<LockId>,
    /// enlistment errors that doom the transaction even if the processor chose to ignore them
    fatal: Option<Error>,
    /// busy key that ordered below a held lock
    contended: Option<(String, Key)>,
}

impl Transaction {
    /// Starts a unit of work anchored at `anchor` by locking it, together with `prelock`.
    ///
    /// `partition` must be the partition owning `anchor`. Nothing is held yet, so every lock here is
    /// taken in order with a bounded wait.
    #[instrument(level = "debug", skip(partition, scheme, lock_timeout, prelock))]
    pub(crate) async fn begin(
        id: TransactionId,
        partition: Arc<Partition>,
        scheme: Arc<dyn PartitioningScheme>,
        lock_timeout: Option<Duration>,
        map: &str,
        anchor: Key,
        prelock: Vec<(String, Key)>,
    ) -> Result<Self> {
        let mut tx = Self {
            id,
            partition,
            scheme,
            lock_timeout,
            entries: Vec::new(),
            anchor: EntryHandle(0),
            locks: Vec::new(),
            fatal: None,
            contended: None,
        };
        let mut keys = Vec::with_capacity(prelock.len() + 1);
        keys.push((map.to_string(), anchor));
        keys.extend(prelock);

        let handles = tx.enlist_all(keys).await?;
        if let Some(anchor) = handles.first() {
            tx.anchor = *anchor;
        }

        Ok(tx)
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Partition this unit of work runs in
    pub fn partition(&self) -> PartitionId {
        self.partition.id()
    }

    /// Handle to the entry the unit of work was invoked on
    pub fn anchor(&self) -> EntryHandle {
        self.anchor
    }

    fn entry(&self, handle: EntryHandle) -> Result<&Entry> {
        self.entries
            .get(handle.0)
            .ok_or(Error::InvalidRequest(InvalidRequest::UnknownEntryHandle {
                handle: handle.0,
            }))
    }

    fn entry_mut(&mut self, handle: EntryHandle) -> Result<&mut Entry> {
        self.entries
            .get_mut(handle.0)
            .ok_or(Error::InvalidRequest(InvalidRequest::UnknownEntryHandle {
                handle: handle.0,
            }))
    }

    pub fn key(&self, handle: EntryHandle) -> Result<&Key> {
        Ok(&self.entry(handle)?.key)
    }

    pub fn map(&self, handle: EntryHandle) -> Result<&str> {
        Ok(&self.entry(handle)?.map)
    }

    /// Current value of the entry, including mutations buffered by this unit of work
    pub fn value(&self, handle: EntryHandle) -> Result<Option<Bytes>> {
        Ok(self.entry(handle)?.value().cloned())
    }

    /// Value of the entry when it was enlisted
    pub fn original_value(&self, handle: EntryHandle) -> Result<Option<Bytes>> {
        Ok(self.entry(handle)?.original.clone())
    }

    pub fn is_present(&self, handle: EntryHandle) -> Result<bool> {
        Ok(self.entry(handle)?.value().is_some())
    }

    pub fn set_value(&mut self, handle: EntryHandle, value: Bytes) -> Result<()> {
        self.entry_mut(handle)?.pending = Pending::Set(value);
        Ok(())
    }

    pub fn remove(&mut self, handle: EntryHandle) -> Result<()> {
        self.entry_mut(handle)?.pending = Pending::Remove;
        Ok(())
    }

    fn find(&self, map: &str, binary: &Bytes) -> Option<EntryHandle> {
        self.entries
            .iter()
            .position(|entry| entry.map == map && entry.binary == *binary)
            .map(EntryHandle)
    }

    fn doom(&mut self, err: Error) -> Error {
        let returned = match &err {
            Error::CrossPartitionEnlist {
                key,
                anchor_partition,
                key_partition,
            } => Error::CrossPartitionEnlist {
                key: key.clone(),
                anchor_partition: *anchor_partition,
                key_partition: *key_partition,
            },
            Error::InvalidAssociation { key, associated } => Error::InvalidAssociation {
                key: key.clone(),
                associated: associated.clone(),
            },
            _ => return err,
        };
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }

        returned
    }

    /// Enlists a single entry. See [`Transaction::enlist_all`].
    pub async fn enlist(&mut self, map: &str, key: Key) -> Result<EntryHandle> {
        let mut handles = self.enlist_all(vec![(map.to_string(), key)]).await?;
        handles.pop().ok_or(Error::Logic {
            reason: "enlist_all returned no handle".to_string(),
        })
    }

    /// Enlists (and locks) every given entry, returning their handles in the same order as `keys`.
    ///
    /// Every key is checked to belong to this transaction's partition before anything is locked. Failing
    /// that check (or declaring an invalid association) dooms the whole unit of work: it will not commit
    /// even if the processor ignores the error. Keys already enlisted return their existing handle.
    #[instrument(level = "debug", skip(self, keys), fields(tx = self.id, partition = self.partition.id()))]
    pub async fn enlist_all(&mut self, keys: Vec<(String, Key)>) -> Result<Vec<EntryHandle>> {
        let anchor_partition = self.partition.id();
        let mut resolved = Vec::with_capacity(keys.len());
        for (map, key) in keys {
            let key_partition = match self.scheme.partition_of(&key) {
                Ok(partition) => partition,
                Err(err) => return Err(self.doom(err)),
            };
            let binary = key.serialize();
            if key_partition != anchor_partition {
                return Err(self.doom(Error::CrossPartitionEnlist {
                    key: binary,
                    anchor_partition,
                    key_partition,
                }));
            }
            resolved.push((map, key, binary));
        }

        let mut to_lock: Vec<(String, Key, Bytes)> = resolved
            .iter()
            .filter(|(map, _, binary)| self.find(map, binary).is_none())
            .cloned()
            .collect();
        to_lock.sort_by(|a, b| (&a.0, &a.2).cmp(&(&b.0, &b.2)));
        to_lock.dedup_by(|a, b| a.0 == b.0 && a.2 == b.2);

        let first_new = self.entries.len();
        let mut outcome = Ok(());
        for (map, key, binary) in to_lock {
            let id: LockId = (map, binary);
            if let Err(err) = self.lock(&id, &key).await {
                outcome = Err(err);
                break;
            }

            let (map, binary) = id;
            self.entries.push(Entry {
                map,
                key,
                binary,
                original: None,
                pending: Pending::Unchanged,
            });
        }

        // values are only read once every lock is held
        self.load_originals(first_new)?;
        outcome?;

        resolved
            .iter()
            .map(|(map, _, binary)| {
                self.find(map, binary).ok_or(Error::Logic {
                    reason: "enlisted entry not found".to_string(),
                })
            })
            .collect()
    }

    async fn lock(&mut self, id: &LockId, key: &Key) -> Result<()> {
        let locks = self.partition.locks();
        let in_order = self.locks.iter().max().map_or(true, |highest| id > highest);
        let started = Instant::now();
        let acquired = if in_order {
            let deadline = self.lock_timeout.map(|timeout| started + timeout);
            locks.lock(id, self.id, deadline).await?
        } else {
            locks.try_lock(id, self.id)?
        };

        if !acquired {
            event!(
                Level::DEBUG,
                "tx {} unable to lock {}:{} (in order: {})",
                self.id,
                id.0,
                hex::encode(&id.1),
                in_order
            );
            if !in_order {
                if self.contended.is_none() {
                    self.contended = Some((id.0.clone(), key.clone()));
                }
                return Err(self.contention(id));
            }
            return Err(Error::LockTimeout {
                map: id.0.clone(),
                key: id.1.clone(),
                partition: self.partition.id(),
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }

        self.locks.push(id.clone());
        Ok(())
    }

    fn contention(&self, id: &LockId) -> Error {
        Error::LockContention {
            map: id.0.clone(),
            key: id.1.clone(),
            partition: self.partition.id(),
        }
    }

    /// Keys to lock upfront when running the unit of work again after a [`Error::LockContention`]:
    /// everything enlisted so far except the anchor, plus the busy key. None if there was no contention.
    pub(crate) fn restart_keys(&self) -> Option<Vec<(String, Key)>> {
        let contended = self.contended.as_ref()?;
        let mut keys: Vec<(String, Key)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != self.anchor.0)
            .map(|(_, entry)| (entry.map.clone(), entry.key.clone()))
            .collect();
        keys.push(contended.clone());

        Some(keys)
    }

    fn contention_error(&self) -> Option<Error> {
        self.contended
            .as_ref()
            .map(|(map, key)| self.contention(&(map.clone(), key.serialize())))
    }

    fn load_originals(&mut self, from: usize) -> Result<()> {
        if from >= self.entries.len() {
            return Ok(());
        }

        let store = self.partition.read()?;
        for entry in self.entries[from..].iter_mut() {
            entry.original = store.get(&entry.map, &entry.binary)?;
        }

        Ok(())
    }

    /// Keys of the committed entries of `map` in this partition matching `filter`.
    ///
    /// Mutations buffered by this unit of work are not visible to the query. Entries returned are not
    /// enlisted: pass them to [`Transaction::enlist_all`] to lock them.
    pub fn query(&self, map: &str, filter: &Filter) -> Result<Vec<Key>> {
        self.query_entries(map, filter)
            .map(|entries| entries.into_iter().map(|(key, _)| key).collect())
    }

    /// Same as [`Transaction::query`] but also returns the committed values
    pub fn query_entries(&self, map: &str, filter: &Filter) -> Result<Vec<(Key, Bytes)>> {
        let entries = self.partition.read()?.query(map, filter)?;
        entries
            .into_iter()
            .map(|(binary, value)| Ok((Key::deserialize(binary)?, value)))
            .collect()
    }

    fn release_locks(&mut self) {
        let locks = self.partition.locks();
        while let Some(id) = self.locks.pop() {
            if let Err(err) = locks.release(&id, self.id) {
                event!(Level::ERROR, "tx {} unable to release lock: {}", self.id, err);
            }
        }
    }

    fn aborted(&self, cause: Error) -> Error {
        Error::TransactionAborted {
            partition: self.partition.id(),
            key: self
                .entries
                .get(self.anchor.0)
                .map(|anchor| anchor.binary.clone())
                .unwrap_or_default(),
            cause: Box::new(cause),
        }
    }

    /// Turns the error returned by a processor into the error surfaced to the caller, discarding every
    /// buffered mutation.
    pub(crate) fn abort(mut self, err: Error) -> Error {
        self.release_locks();
        if let Some(fatal) = self.fatal.take() {
            return fatal;
        }
        if let Some(contention) = self.contention_error() {
            return contention;
        }

        if err.is_core_transaction_error() {
            err
        } else {
            self.aborted(err)
        }
    }

    /// Applies every buffered mutation atomically and releases the locks.
    ///
    /// Interceptors can still reject the commit in [`EntryInterceptor::on_prepare`].
    #[instrument(level = "debug", skip(self, interceptors), fields(tx = self.id, partition = self.partition.id()))]
    pub(crate) fn commit(mut self, interceptors: &[Arc<dyn EntryInterceptor>]) -> Result<()> {
        if let Some(fatal) = self.fatal.take() {
            return Err(fatal);
        }
        if let Some(contention) = self.contention_error() {
            return Err(contention);
        }

        let events: Vec<EntryEvent> = self.entries.iter().filter_map(Entry::event).collect();
        let writes: Vec<Write> = self.entries.iter().filter_map(Entry::write).collect();
        let partition = self.partition.id();

        for interceptor in interceptors {
            if let Err(err) = interceptor.on_prepare(partition, &events) {
                event!(Level::DEBUG, "commit rejected by {:?}: {}", interceptor, err);
                return Err(self.aborted(err));
            }
        }

        if !writes.is_empty() {
            let applied = self.partition.write().and_then(|mut store| store.apply(&writes));
            if let Err(err) = applied {
                return Err(self.aborted(err));
            }
        }
        self.release_locks();
        event!(Level::DEBUG, "committed {} writes", writes.len());

        if !events.is_empty() {
            for interceptor in interceptors {
                interceptor.on_committed(partition, &events);
            }
        }

        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.release_locks();
    }
}
