//! Per partition indexes.
//!
//! A [`MapIndex`] keeps, for one extractor, the extracted field of every entry in a partition's map
//! (forward index) and the keys holding each distinct field (inverse index). Indexes are maintained by
//! the commit path while the partition's store write guard is held, so they never drift from the data
//! they describe.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::Bound,
};

use bytes::Bytes;
use tracing::{event, Level};

use super::{extractor::Field, filter::Extractor};
use crate::{error::Result, storage_engine::StorageView};

#[derive(Debug)]
pub struct MapIndex {
    extractor: Extractor,
    ordered: bool,
    forward: HashMap<Bytes, Field>,
    inverse: BTreeMap<Field, BTreeSet<Bytes>>,
    /// elements of list values, so that `Contains` can be answered without a scan
    elements: BTreeMap<Field, BTreeSet<Bytes>>,
    /// keys whose value the extractor could not process. They are simply not indexed.
    excluded: BTreeSet<Bytes>,
}

impl MapIndex {
    pub fn new(extractor: Extractor, ordered: bool) -> Self {
        Self {
            extractor,
            ordered,
            forward: Default::default(),
            inverse: Default::default(),
            elements: Default::default(),
            excluded: Default::default(),
        }
    }

    pub fn canonical_name(&self) -> &str {
        self.extractor.canonical_name()
    }

    /// Ordered indexes can serve range filters
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// An index is partial when some entries could not be indexed
    pub fn is_partial(&self) -> bool {
        !self.excluded.is_empty()
    }

    pub fn is_excluded(&self, key: &[u8]) -> bool {
        self.excluded.contains(key)
    }

    /// Number of indexed entries
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Field currently indexed for the given key
    pub fn get(&self, key: &[u8]) -> Option<&Field> {
        self.forward.get(key)
    }

    /// Indexes an entry, replacing whatever was indexed for the same key before
    pub fn insert(&mut self, key: &Bytes, value: &[u8]) {
        self.delete(key);

        let field = match self.extractor.extract(key, value) {
            Ok(field) => field,
            Err(err) => {
                event!(
                    Level::WARN,
                    "entry {} excluded from index {}: {}",
                    hex::encode(key),
                    self.canonical_name(),
                    err
                );
                self.excluded.insert(key.clone());
                return;
            }
        };

        if let Field::List(items) = &field {
            for item in items.iter() {
                self.elements
                    .entry(item.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }
        self.inverse
            .entry(field.clone())
            .or_default()
            .insert(key.clone());
        self.forward.insert(key.clone(), field);
    }

    /// Removes an entry from the index. Removing a key that is not indexed is a no-op.
    pub fn delete(&mut self, key: &[u8]) {
        self.excluded.remove(key);
        let Some(field) = self.forward.remove(key) else {
            return;
        };

        if let Field::List(items) = &field {
            for item in items.iter() {
                remove_from(&mut self.elements, item, key);
            }
        }
        remove_from(&mut self.inverse, &field, key);
    }

    /// Keys whose indexed field equals `value`
    pub fn equal(&self, value: &Field) -> BTreeSet<Bytes> {
        self.inverse.get(value).cloned().unwrap_or_default()
    }

    /// Keys whose indexed field is a list containing `value`
    pub fn containing(&self, value: &Field) -> BTreeSet<Bytes> {
        self.elements.get(value).cloned().unwrap_or_default()
    }

    /// Keys whose indexed field falls within the given bounds and is comparable with `kind`.
    ///
    /// Returns `None` for unordered indexes.
    pub fn range(
        &self,
        lower: Bound<&Field>,
        upper: Bound<&Field>,
        kind: &Field,
    ) -> Option<BTreeSet<Bytes>> {
        if !self.ordered {
            return None;
        }

        if let (
            Bound::Included(l) | Bound::Excluded(l),
            Bound::Included(u) | Bound::Excluded(u),
        ) = (lower, upper)
        {
            let empty = match l.cmp(u) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => {
                    matches!(lower, Bound::Excluded(_)) || matches!(upper, Bound::Excluded(_))
                }
                std::cmp::Ordering::Less => false,
            };
            if empty {
                return Some(BTreeSet::new());
            }
        }

        Some(
            self.inverse
                .range::<Field, _>((lower, upper))
                .filter(|(field, _)| field.comparable_with(kind))
                .flat_map(|(_, keys)| keys.iter().cloned())
                .collect(),
        )
    }
}

fn remove_from(map: &mut BTreeMap<Field, BTreeSet<Bytes>>, field: &Field, key: &[u8]) {
    if let Some(keys) = map.get_mut(field) {
        keys.remove(key);
        if keys.is_empty() {
            map.remove(field);
        }
    }
}

/// All indexes of one map in one partition, keyed by extractor canonical name
#[derive(Debug, Default)]
pub struct IndexRegistry {
    map: String,
    indexes: HashMap<String, MapIndex>,
}

impl IndexRegistry {
    pub fn new(map: &str) -> Self {
        Self {
            map: map.to_string(),
            indexes: Default::default(),
        }
    }

    /// Name of the map these indexes belong to
    pub fn map(&self) -> &str {
        &self.map
    }

    /// Registers an index and populates it from the current content of `store`.
    ///
    /// Adding an index whose canonical name is already registered is a no-op.
    pub fn add(&mut self, extractor: Extractor, ordered: bool, store: &dyn StorageView) -> Result<()> {
        let name = extractor.canonical_name().to_string();
        if self.indexes.contains_key(&name) {
            return Ok(());
        }

        let mut index = MapIndex::new(extractor, ordered);
        for (key, value) in store.entries()? {
            index.insert(&key, &value);
        }
        event!(
            Level::DEBUG,
            "index {} on {} built with {} entries",
            name,
            self.map,
            index.len()
        );
        self.indexes.insert(name, index);

        Ok(())
    }

    /// Returns true if an index was removed
    pub fn remove(&mut self, name: &str) -> bool {
        self.indexes.remove(name).is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<&MapIndex> {
        self.indexes.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.indexes.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Reflects a put on every index
    pub fn on_put(&mut self, key: &Bytes, value: &[u8]) {
        for index in self.indexes.values_mut() {
            index.insert(key, value);
        }
    }

    /// Reflects a delete on every index
    pub fn on_delete(&mut self, key: &[u8]) {
        for index in self.indexes.values_mut() {
            index.delete(key);
        }
    }
}
