//! Partition local query engine.
//!
//! [`query`] evaluates a [`Filter`] against the backing store of a single map in a single partition. It
//! uses the partition's [`IndexRegistry`] whenever the filter (or part of it) can be answered by an
//! index and falls back to a linear scan otherwise. Both paths return exactly the same entries.
use std::collections::BTreeSet;

use bytes::Bytes;
use tracing::{event, instrument, Level};

use crate::{
    error::{Error, Result},
    storage_engine::StorageView,
};

pub mod extractor;
pub mod filter;
pub mod index;

pub use extractor::{Field, FnExtractor, JsonPath, ValueExtractor};
pub use filter::{Extractor, Filter};
pub use index::{IndexRegistry, MapIndex};

/// How a filter is going to be executed when at least part of it is served by indexes
struct Plan<'f> {
    candidates: BTreeSet<Bytes>,
    /// clauses answered by the indexes. Every candidate must satisfy all of them.
    indexed: Vec<&'f Filter>,
    /// clauses that still have to be evaluated on each candidate
    residual: Vec<&'f Filter>,
}

fn plan<'f>(filter: &'f Filter, indexes: &IndexRegistry) -> Option<Plan<'f>> {
    match filter {
        Filter::And(clauses) => {
            let mut candidates: Option<BTreeSet<Bytes>> = None;
            let mut indexed = Vec::new();
            let mut residual = Vec::new();
            for clause in clauses.iter() {
                match clause.index_candidates(indexes) {
                    Some(keys) => {
                        candidates = Some(match candidates {
                            None => keys,
                            Some(current) => current.intersection(&keys).cloned().collect(),
                        });
                        indexed.push(clause);
                    }
                    None => residual.push(clause),
                }
            }

            candidates.map(|candidates| Plan {
                candidates,
                indexed,
                residual,
            })
        }
        _ => filter.index_candidates(indexes).map(|candidates| Plan {
            candidates,
            indexed: vec![filter],
            residual: Vec::new(),
        }),
    }
}

fn index_mismatch(indexes: &IndexRegistry, clause: &Filter, key: &Bytes) -> Error {
    Error::IndexMismatch {
        map: indexes.map().to_string(),
        index: clause.extractor_names().join(","),
        key: key.clone(),
    }
}

/// Returns the entries of `store` matching `filter`, sorted by key.
///
/// Candidates produced by an index are always re-checked against the clause that produced them. If an
/// index returns a key that is not in the store, or whose value does not satisfy the clause,
/// [`Error::IndexMismatch`] is returned instead of silently dropping (or returning) the entry.
#[instrument(level = "debug", skip(store, indexes), fields(map = indexes.map()))]
pub fn query(
    store: &dyn StorageView,
    indexes: &IndexRegistry,
    filter: &Filter,
) -> Result<Vec<(Bytes, Bytes)>> {
    let Some(plan) = plan(filter, indexes) else {
        event!(Level::DEBUG, "no usable index, scanning {} entries", store.len());
        let mut entries = store.entries()?;
        entries.retain(|(key, value)| filter.evaluate(key, value));
        entries.sort();
        return Ok(entries);
    };

    event!(
        Level::DEBUG,
        "{} candidates from indexes, {} residual clauses",
        plan.candidates.len(),
        plan.residual.len()
    );
    let mut results = Vec::with_capacity(plan.candidates.len());
    for key in plan.candidates {
        let Some(value) = store.get(&key)? else {
            return Err(index_mismatch(indexes, filter, &key));
        };

        if let Some(clause) = plan
            .indexed
            .iter()
            .find(|clause| !clause.evaluate(&key, &value))
        {
            return Err(index_mismatch(indexes, clause, &key));
        }

        if plan.residual.iter().all(|clause| clause.evaluate(&key, &value)) {
            results.push((key, value));
        }
    }

    Ok(results)
}
