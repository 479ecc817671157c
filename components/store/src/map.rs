use std::{fmt::Debug, marker::PhantomData, ops::Bound, sync::Arc};

use bytes::Bytes;

use crate::{
    backend::Table,
    codec::Codec,
    error::MapError,
    transaction::{successor, Storage},
};

/// Entries read from the backend at a time.
pub(crate) const SCAN_PAGE_SIZE: usize = 256;

/// A typed table of scavenge state. Writes join the ambient transaction, if any.
pub struct ScavengeMap<K, V> {
    table: Table,
    storage: Arc<Storage>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> ScavengeMap<K, V>
where
    K: Codec + Debug,
    V: Codec,
{
    pub(crate) fn new(table: Table, storage: Arc<Storage>) -> Self {
        Self {
            table,
            storage,
            _marker: PhantomData,
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Insert or overwrite.
    pub fn set(&self, key: &K, value: &V) -> Result<(), MapError> {
        self.storage.put(self.table, key.to_bytes(), value.to_bytes())
    }

    /// Insert a key that must not exist yet.
    pub fn insert(&self, key: &K, value: &V) -> Result<(), MapError> {
        let raw = key.to_bytes();
        if self.storage.get(self.table, &raw)?.is_some() {
            return Err(MapError::DuplicateKey(format!("{}/{:?}", self.table.name(), key)));
        }
        self.storage.put(self.table, raw, value.to_bytes())
    }

    pub fn try_get(&self, key: &K) -> Result<Option<V>, MapError> {
        self.storage
            .get(self.table, &key.to_bytes())?
            .map(V::from_bytes)
            .transpose()
    }

    pub fn try_remove(&self, key: &K) -> Result<Option<V>, MapError> {
        let raw = key.to_bytes();
        let value = self.storage.get(self.table, &raw)?;
        if value.is_some() {
            self.storage.delete(self.table, raw)?;
        }
        value.map(V::from_bytes).transpose()
    }

    /// All records, ordered by key.
    pub fn all_records(&self) -> Result<Vec<(K, V)>, MapError> {
        self.records((Bound::Unbounded, Bound::Unbounded), |_| true, usize::MAX)
    }

    /// Up to `limit` records satisfying `filter` with keys within `range`, ordered by key.
    ///
    /// The backend is read page by page, so the cost is bounded by the records visited.
    pub(crate) fn records<F>(
        &self,
        range: (Bound<&K>, Bound<&K>),
        mut filter: F,
        limit: usize,
    ) -> Result<Vec<(K, V)>, MapError>
    where
        F: FnMut(&V) -> bool,
    {
        let mut from = match range.0 {
            Bound::Unbounded => Bytes::new(),
            Bound::Included(key) => key.to_bytes(),
            Bound::Excluded(key) => successor(&key.to_bytes()),
        };
        let to = match range.1 {
            Bound::Unbounded => None,
            Bound::Included(key) => Some(successor(&key.to_bytes())),
            Bound::Excluded(key) => Some(key.to_bytes()),
        };

        let mut records = vec![];
        while records.len() < limit {
            let page_size = (limit - records.len()).min(SCAN_PAGE_SIZE);
            let page = self.storage.scan(self.table, from, to.clone(), page_size)?;
            for (raw_key, raw_value) in page.entries {
                if records.len() >= limit {
                    break;
                }
                let value = V::from_bytes(raw_value)?;
                if filter(&value) {
                    records.push((K::from_bytes(raw_key)?, value));
                }
            }
            match page.next {
                Some(next) => from = next,
                None => break,
            }
        }
        Ok(records)
    }

    /// Remove every record for which `predicate` holds. Returns the number removed.
    pub fn delete_where<F>(&self, mut predicate: F) -> Result<usize, MapError>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut removed = 0;
        let mut from = Bytes::new();
        loop {
            let page = self.storage.scan(self.table, from, None, SCAN_PAGE_SIZE)?;
            for (raw_key, raw_value) in page.entries {
                let key = K::from_bytes(raw_key.clone())?;
                let value = V::from_bytes(raw_value)?;
                if predicate(&key, &value) {
                    self.storage.delete(self.table, raw_key)?;
                    removed += 1;
                }
            }
            match page.next {
                Some(next) => from = next,
                None => break,
            }
        }
        Ok(removed)
    }
}
