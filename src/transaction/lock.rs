//! Per partition key lock table.
//!
//! Locks are exclusive and re-entrant for their owner. Waiters are woken whenever any lock of the
//! partition is released and simply retry, so there is no fairness between waiters.
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use bytes::Bytes;
use tokio::{
    sync::Notify,
    time::{self, Instant},
};

use crate::error::{Error, Result};

/// Identifies the unit of work holding a lock
pub type TransactionId = u64;

/// A lock is taken on a (map, serialized key) pair. The derived ordering is the order locks must be
/// acquired in.
pub type LockId = (String, Bytes);

#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashMap<LockId, TransactionId>>,
    released: Notify,
}

impl LockTable {
    fn acquire_lock(&self) -> Result<MutexGuard<HashMap<LockId, TransactionId>>> {
        match self.held.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => Err(Error::Logic {
                reason: "Unable to acquire lock table guard - poisoned...".to_string(),
            }),
        }
    }

    /// Takes the lock if it is free (or already owned by `owner`). Never waits.
    pub fn try_lock(&self, id: &LockId, owner: TransactionId) -> Result<bool> {
        let mut held = self.acquire_lock()?;
        match held.get(id) {
            Some(current) => Ok(*current == owner),
            None => {
                held.insert(id.clone(), owner);
                Ok(true)
            }
        }
    }

    /// Waits for the lock until `deadline` (forever if None).
    ///
    /// Returns false if the deadline passed before the lock could be taken.
    pub async fn lock(
        &self,
        id: &LockId,
        owner: TransactionId,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        loop {
            // registered before trying so that a release in between is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_lock(id, owner)? {
                return Ok(true);
            }

            match deadline {
                Some(deadline) => {
                    if time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(false);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Releases a lock held by `owner`. Releasing a lock owned by someone else is a logic error.
    pub fn release(&self, id: &LockId, owner: TransactionId) -> Result<()> {
        {
            let mut held = self.acquire_lock()?;
            match held.get(id) {
                Some(current) if *current == owner => {
                    held.remove(id);
                }
                Some(current) => {
                    return Err(Error::Logic {
                        reason: format!(
                            "transaction {} tried to release a lock owned by {}",
                            owner, current
                        ),
                    })
                }
                None => {}
            }
        }

        self.released.notify_waiters();
        Ok(())
    }

    pub fn owner(&self, id: &LockId) -> Result<Option<TransactionId>> {
        Ok(self.acquire_lock()?.get(id).copied())
    }

    /// Number of locks currently held
    pub fn len(&self) -> Result<usize> {
        Ok(self.acquire_lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
