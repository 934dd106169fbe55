//! Built-in [`EntryProcessor`]s operating on the anchor entry.
use async_trait::async_trait;
use bytes::Bytes;

use super::{EntryProcessor, Transaction};
use crate::error::Result;

/// Sets the anchor's value. Outputs the previous value.
#[derive(Clone, Debug)]
pub struct Put {
    pub value: Bytes,
}

#[async_trait]
impl EntryProcessor for Put {
    type Output = Option<Bytes>;

    async fn process(&self, tx: &mut Transaction) -> Result<Self::Output> {
        let anchor = tx.anchor();
        let previous = tx.value(anchor)?;
        tx.set_value(anchor, self.value.clone())?;
        Ok(previous)
    }
}

/// Removes the anchor. Outputs the removed value.
#[derive(Clone, Copy, Debug, Default)]
pub struct Remove;

#[async_trait]
impl EntryProcessor for Remove {
    type Output = Option<Bytes>;

    async fn process(&self, tx: &mut Transaction) -> Result<Self::Output> {
        let anchor = tx.anchor();
        let previous = tx.value(anchor)?;
        tx.remove(anchor)?;
        Ok(previous)
    }
}

/// Reads the anchor's value while holding its lock
#[derive(Clone, Copy, Debug, Default)]
pub struct Get;

#[async_trait]
impl EntryProcessor for Get {
    type Output = Option<Bytes>;

    async fn process(&self, tx: &mut Transaction) -> Result<Self::Output> {
        tx.value(tx.anchor())
    }
}
