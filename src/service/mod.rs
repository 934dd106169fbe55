//! The partitioned service: owns every partition of a service and routes units of work to them.
//!
//! All partitions live in this process. Which member *owns* each partition is the business of the
//! distribution layer and is only looked at by [`crate::ha`].
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{stream::FuturesUnordered, StreamExt};
use tracing::{event, instrument, Level};

use crate::{
    error::{Error, Result},
    events::EntryInterceptor,
    ha::{Member, OwnershipSnapshot, PartitionOwnership},
    partitioning::{hashing::HashPartitioning, Key, PartitionId, PartitioningScheme},
    query::{Extractor, Filter},
    transaction::{
        processors::{Put, Remove},
        EntryProcessor, Transaction,
    },
};

use self::{config::Config, partition::Partition};

pub mod config;
pub mod partition;

/// How many times a unit of work is run again after [`Error::LockContention`]. Every restart locks at
/// least one more key upfront than the previous run.
pub const MAX_LOCK_RESTARTS: usize = 16;

#[derive(Debug)]
pub struct PartitionedService {
    name: String,
    scheme: Arc<dyn PartitioningScheme>,
    partitions: Vec<Arc<Partition>>,
    backup_count: u32,
    lock_timeout: Option<Duration>,
    interceptors: RwLock<Vec<Arc<dyn EntryInterceptor>>>,
    next_transaction_id: AtomicU64,
}

impl PartitionedService {
    pub fn new(config: Config) -> Result<Self> {
        let scheme: Arc<dyn PartitioningScheme> = match config.partitioning_scheme {
            config::PartitioningScheme::Murmur3Hash => {
                Arc::new(HashPartitioning::new(config.partition_count)?)
            }
        };

        Self::with_scheme(config, scheme)
    }

    /// Builds a service routing keys through a custom [`PartitioningScheme`]. The scheme's partition count
    /// wins over the one in `config`.
    pub fn with_scheme(config: Config, scheme: Arc<dyn PartitioningScheme>) -> Result<Self> {
        if scheme.partition_count() == 0 {
            return Err(Error::InvalidConfig {
                reason: "partition_count must be greater than 0".to_string(),
            });
        }

        let partitions = (0..scheme.partition_count())
            .map(|id| Arc::new(Partition::new(id, config.storage_engine)))
            .collect();
        event!(
            Level::INFO,
            "service {} started with {} partitions",
            config.service_name,
            scheme.partition_count()
        );

        Ok(Self {
            name: config.service_name,
            scheme,
            partitions,
            backup_count: config.backup_count,
            lock_timeout: config.lock_timeout_ms.map(Duration::from_millis),
            interceptors: Default::default(),
            next_transaction_id: AtomicU64::new(1),
        })
    }

    pub async fn from_config(path: PathBuf) -> anyhow::Result<Self> {
        let c = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&c)?;

        Ok(Self::new(config)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> u32 {
        self.scheme.partition_count()
    }

    /// Number of backup copies the members owning this service are expected to keep
    pub fn backup_count(&self) -> u32 {
        self.backup_count
    }

    /// Snapshot of this service for [`crate::ha::compute_status`], given the members and the placement
    /// reported by the distribution layer.
    pub fn ownership_snapshot(
        &self,
        members: Vec<Member>,
        ownership: Vec<PartitionOwnership>,
    ) -> OwnershipSnapshot {
        OwnershipSnapshot {
            service: self.name.clone(),
            partition_count: self.partition_count(),
            backup_count: self.backup_count,
            members,
            ownership,
        }
    }

    pub fn partition_of(&self, key: &Key) -> Result<PartitionId> {
        self.scheme.partition_of(key)
    }

    /// See [`PartitioningScheme::partition_key`]
    pub fn partition_key(&self, partition: PartitionId) -> Result<Key> {
        self.scheme.partition_key(partition)
    }

    pub fn partition(&self, partition: PartitionId) -> Result<&Arc<Partition>> {
        let partition = self.scheme.check_partition(partition)?;
        self.partitions
            .get(partition as usize)
            .ok_or(Error::Logic {
                reason: format!("partition {} was never created", partition),
            })
    }

    fn interceptors(&self) -> Result<Vec<Arc<dyn EntryInterceptor>>> {
        match self.interceptors.read() {
            Ok(guard) => Ok(guard.clone()),
            Err(_) => Err(Error::Logic {
                reason: "Unable to read interceptors - poisoned...".to_string(),
            }),
        }
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn EntryInterceptor>) -> Result<()> {
        match self.interceptors.write() {
            Ok(mut guard) => {
                guard.push(interceptor);
                Ok(())
            }
            Err(_) => Err(Error::Logic {
                reason: "Unable to register interceptor - poisoned...".to_string(),
            }),
        }
    }

    /// Runs `processor` as a unit of work anchored at `key` in `map`.
    ///
    /// The anchor is locked before the processor starts. On success every buffered mutation is committed
    /// atomically, otherwise nothing is. After a [`Error::LockContention`] the processor is run again
    /// from scratch (at most [`MAX_LOCK_RESTARTS`] times) with the keys it enlisted locked upfront.
    #[instrument(skip(self, processor), fields(service = %self.name))]
    pub async fn invoke<P: EntryProcessor>(
        &self,
        map: &str,
        key: Key,
        processor: &P,
    ) -> Result<P::Output> {
        let partition = self.partition(self.scheme.partition_of(&key)?)?.clone();
        let mut prelock = Vec::new();
        let mut restarts = 0;
        loop {
            let id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
            let mut tx = Transaction::begin(
                id,
                partition.clone(),
                self.scheme.clone(),
                self.lock_timeout,
                map,
                key.clone(),
                prelock,
            )
            .await?;

            let result = processor.process(&mut tx).await;
            let restart_keys = tx.restart_keys();
            let result = match result {
                Ok(output) => self
                    .interceptors()
                    .and_then(|interceptors| tx.commit(&interceptors))
                    .map(|_| output),
                Err(err) => Err(tx.abort(err)),
            };

            match (result, restart_keys) {
                (Err(err), Some(keys)) if err.is_lock_contention() && restarts < MAX_LOCK_RESTARTS => {
                    restarts += 1;
                    event!(
                        Level::DEBUG,
                        "tx {} hit lock contention, restarting with {} keys locked upfront",
                        id,
                        keys.len()
                    );
                    prelock = keys;
                }
                (Err(err), _) => {
                    event!(Level::DEBUG, "tx {} aborted: {}", id, err);
                    return Err(err);
                }
                (Ok(output), _) => return Ok(output),
            }
        }
    }

    /// Runs `processor` once in every partition, anchored at each partition's synthetic key.
    ///
    /// Invocations run concurrently. Results are returned in partition order, one per partition, and a
    /// failure in one partition has no effect on the others.
    #[instrument(skip(self, processor), fields(service = %self.name))]
    pub async fn invoke_all_partitions<P: EntryProcessor>(
        &self,
        map: &str,
        processor: &P,
    ) -> Result<Vec<Result<P::Output>>> {
        let keys = (0..self.partition_count())
            .map(|partition| self.partition_key(partition))
            .collect::<Result<Vec<Key>>>()?;

        let mut futures = keys
            .into_iter()
            .enumerate()
            .map(|(partition, key)| async move { (partition, self.invoke(map, key, processor).await) })
            .collect::<FuturesUnordered<_>>();

        let mut results: Vec<Option<Result<P::Output>>> =
            (0..self.partition_count()).map(|_| None).collect();
        while let Some((partition, result)) = futures.next().await {
            results[partition] = Some(result);
        }

        results
            .into_iter()
            .map(|result| {
                result.ok_or(Error::Logic {
                    reason: "missing partition invocation result".to_string(),
                })
            })
            .collect()
    }

    /// Reads the committed value of `key` without taking its lock
    pub fn get(&self, map: &str, key: &Key) -> Result<Option<Bytes>> {
        let partition = self.partition(self.scheme.partition_of(key)?)?;
        let value = partition.read()?.get(map, &key.serialize())?;
        Ok(value)
    }

    /// Sets the value of `key`, returning the previous one
    pub async fn put(&self, map: &str, key: Key, value: Bytes) -> Result<Option<Bytes>> {
        self.invoke(map, key, &Put { value }).await
    }

    /// Removes `key`, returning the removed value
    pub async fn remove(&self, map: &str, key: Key) -> Result<Option<Bytes>> {
        self.invoke(map, key, &Remove).await
    }

    /// Number of entries of `map` across all partitions
    pub fn size(&self, map: &str) -> Result<usize> {
        let mut size = 0;
        for partition in self.partitions.iter() {
            size += partition.read()?.len(map);
        }
        Ok(size)
    }

    /// Runs `filter` in a single partition
    pub fn query_partition(
        &self,
        map: &str,
        partition: PartitionId,
        filter: &Filter,
    ) -> Result<Vec<(Key, Bytes)>> {
        let entries = self.partition(partition)?.read()?.query(map, filter)?;
        entries
            .into_iter()
            .map(|(binary, value)| Ok((Key::deserialize(binary)?, value)))
            .collect()
    }

    /// Runs `filter` in every partition.
    ///
    /// Each partition is queried atomically but partitions are visited one after the other, so a unit
    /// of work committing meanwhile may be seen in some partitions and not in others.
    #[instrument(level = "debug", skip(self, filter), fields(service = %self.name))]
    pub fn query(&self, map: &str, filter: &Filter) -> Result<Vec<(Key, Bytes)>> {
        let mut results = Vec::new();
        for partition in 0..self.partition_count() {
            results.extend(self.query_partition(map, partition, filter)?);
        }
        Ok(results)
    }

    /// Adds an index on `map` to every partition. Existing entries are indexed right away.
    #[instrument(skip(self, extractor), fields(service = %self.name, index = extractor.canonical_name()))]
    pub fn add_index(&self, map: &str, extractor: Extractor, ordered: bool) -> Result<()> {
        for partition in self.partitions.iter() {
            partition.add_index(map, extractor.clone(), ordered)?;
        }
        Ok(())
    }

    /// Removes the index named `name` from every partition. Returns true if any partition had it.
    pub fn remove_index(&self, map: &str, name: &str) -> Result<bool> {
        let mut removed = false;
        for partition in self.partitions.iter() {
            removed |= partition.remove_index(map, name)?;
        }
        Ok(removed)
    }
}
