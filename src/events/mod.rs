//! Entry events and interceptors.
//!
//! Every committed mutation is described by an [`EntryEvent`]. Interceptors registered on a
//! [`crate::service::PartitionedService`] see the events of a unit of work twice: before they are
//! applied ([`EntryInterceptor::on_prepare`], which can still reject the whole commit) and after
//! ([`EntryInterceptor::on_committed`]).
use std::fmt::Debug;

use bytes::Bytes;
use serde::Serialize;

use crate::{
    error::Result,
    partitioning::{Key, PartitionId},
    utils::serde_hex_bytes,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum EntryEvent {
    Inserted {
        map: String,
        #[serde(serialize_with = "serialize_key")]
        key: Key,
        #[serde(with = "serde_hex_bytes")]
        value: Bytes,
    },
    Updated {
        map: String,
        #[serde(serialize_with = "serialize_key")]
        key: Key,
        #[serde(with = "serde_hex_bytes")]
        old: Bytes,
        #[serde(with = "serde_hex_bytes")]
        new: Bytes,
    },
    Removed {
        map: String,
        #[serde(serialize_with = "serialize_key")]
        key: Key,
        #[serde(with = "serde_hex_bytes")]
        old: Bytes,
    },
}

fn serialize_key<S>(key: &Key, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serde_hex_bytes::serialize(&key.serialize(), serializer)
}

impl EntryEvent {
    pub fn map(&self) -> &str {
        match self {
            EntryEvent::Inserted { map, .. }
            | EntryEvent::Updated { map, .. }
            | EntryEvent::Removed { map, .. } => map,
        }
    }

    pub fn key(&self) -> &Key {
        match self {
            EntryEvent::Inserted { key, .. }
            | EntryEvent::Updated { key, .. }
            | EntryEvent::Removed { key, .. } => key,
        }
    }

    /// Value after the mutation. None for removals.
    pub fn new_value(&self) -> Option<&Bytes> {
        match self {
            EntryEvent::Inserted { value, .. } => Some(value),
            EntryEvent::Updated { new, .. } => Some(new),
            EntryEvent::Removed { .. } => None,
        }
    }

    /// Value before the mutation. None for insertions.
    pub fn old_value(&self) -> Option<&Bytes> {
        match self {
            EntryEvent::Inserted { .. } => None,
            EntryEvent::Updated { old, .. } | EntryEvent::Removed { old, .. } => Some(old),
        }
    }
}

/// Hooks invoked around the commit of every unit of work.
///
/// Both hooks run synchronously on the committing task. `on_prepare` runs while the unit of work still
/// holds its key locks but before anything is written; `on_committed` runs after the locks are released.
pub trait EntryInterceptor: Debug + Send + Sync {
    /// Returning an error rejects the commit. The caller gets a
    /// [`crate::error::Error::TransactionAborted`] wrapping it.
    fn on_prepare(&self, _partition: PartitionId, _events: &[EntryEvent]) -> Result<()> {
        Ok(())
    }

    fn on_committed(&self, _partition: PartitionId, _events: &[EntryEvent]) {}
}
