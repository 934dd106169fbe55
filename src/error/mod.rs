//! This module defines client/user visible errors that can be returned by partgrid.
//!
//! None of the operations in this crate retry on their own. Whether a [`Error::LockTimeout`] or a
//! [`Error::TransactionAborted`] is worth retrying is up to the caller (see [`Error::is_retryable`]).

use std::fmt::Display;

use bytes::Bytes;
use serde::Serialize;

use crate::{partitioning::PartitionId, utils::serde_hex_bytes};

pub type Result<T> = std::result::Result<T, Error>;

/// Error enum with all possible variants
#[derive(Debug, Serialize)]
pub enum Error {
    /// A key declares an associated key which itself declares another association.
    InvalidAssociation {
        #[serde(with = "serde_hex_bytes")]
        key: Bytes,
        #[serde(with = "serde_hex_bytes")]
        associated: Bytes,
    },
    /// A unit of work tried to enlist a key owned by a partition other than its anchor's.
    CrossPartitionEnlist {
        #[serde(with = "serde_hex_bytes")]
        key: Bytes,
        anchor_partition: PartitionId,
        key_partition: PartitionId,
    },
    /// A key lock could not be acquired in time.
    LockTimeout {
        map: String,
        #[serde(with = "serde_hex_bytes")]
        key: Bytes,
        partition: PartitionId,
        waited_ms: u64,
    },
    /// A busy key ordered below a lock the unit of work already held, so it couldn't be waited on.
    /// Returned once the unit of work ran out of restarts.
    LockContention {
        map: String,
        #[serde(with = "serde_hex_bytes")]
        key: Bytes,
        partition: PartitionId,
    },
    /// The unit of work (or an interceptor) failed. Nothing it buffered was applied.
    TransactionAborted {
        partition: PartitionId,
        #[serde(with = "serde_hex_bytes")]
        key: Bytes,
        cause: Box<Error>,
    },
    /// An index and a scan of the same partition disagree. Usually a custom extractor
    /// reusing the canonical name of a different extractor.
    IndexMismatch {
        map: String,
        index: String,
        #[serde(with = "serde_hex_bytes")]
        key: Bytes,
    },
    InvalidRequest(InvalidRequest),
    InvalidConfig {
        reason: String,
    },
    Internal(Internal),
    Io {
        reason: String,
    },
    /// Application level failure, usually raised from inside an [`crate::transaction::EntryProcessor`]
    Generic {
        reason: String,
    },
    Logic {
        reason: String,
    },
}

impl Error {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Error::LockContention { .. })
    }

    pub fn is_cross_partition_enlist(&self) -> bool {
        matches!(self, Error::CrossPartitionEnlist { .. })
    }

    pub fn is_invalid_association(&self) -> bool {
        matches!(self, Error::InvalidAssociation { .. })
    }

    pub fn is_transaction_aborted(&self) -> bool {
        matches!(self, Error::TransactionAborted { .. })
    }

    pub fn is_index_mismatch(&self) -> bool {
        matches!(self, Error::IndexMismatch { .. })
    }

    /// Errors the caller may reasonably retry. Programming errors (bad associations,
    /// cross partition enlistment, index mismatches) are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. }
                | Error::LockContention { .. }
                | Error::TransactionAborted { .. }
        )
    }

    /// Errors raised by the transaction machinery itself. These are surfaced to the caller as they are
    /// instead of being wrapped into [`Error::TransactionAborted`].
    pub(crate) fn is_core_transaction_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidAssociation { .. }
                | Error::CrossPartitionEnlist { .. }
                | Error::LockTimeout { .. }
                | Error::LockContention { .. }
        )
    }

    /// Returns the root cause of a [`Error::TransactionAborted`], or self for every other variant
    pub fn cause(&self) -> &Error {
        match self {
            Error::TransactionAborted { cause, .. } => cause.cause(),
            _ => self,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(InvalidRequest::InvalidJsonPayload(err.to_string()))
    }
}

impl From<crate::storage_engine::Error> for Error {
    fn from(err: crate::storage_engine::Error) -> Self {
        Self::Internal(Internal::StorageEngine(err))
    }
}

#[derive(Debug, Serialize)]
pub enum Internal {
    StorageEngine(crate::storage_engine::Error),
}

#[derive(Debug, Serialize)]
pub enum InvalidRequest {
    PartitionOutOfRange {
        partition: PartitionId,
        partition_count: u32,
    },
    MalformedKey {
        reason: String,
    },
    UnknownEntryHandle {
        handle: usize,
    },
    InvalidSnapshot {
        reason: String,
    },
    InvalidJsonPayload(String),
}
