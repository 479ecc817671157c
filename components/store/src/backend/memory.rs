use std::{collections::BTreeMap, ops::Bound};

use bytes::Bytes;
use parking_lot::RwLock;

use super::{KvBackend, Table, WriteBatch};
use crate::error::MapError;

#[derive(Default)]
pub(crate) struct MemoryBackend {
    tables: RwLock<BTreeMap<Table, BTreeMap<Bytes, Bytes>>>,
}

impl KvBackend for MemoryBackend {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>, MapError> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn scan(
        &self,
        table: Table,
        from: Bytes,
        to: Option<Bytes>,
        limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>, MapError> {
        let upper = to.map_or(Bound::Unbounded, Bound::Excluded);
        if let Bound::Excluded(to) = &upper {
            if *to <= from {
                return Ok(vec![]);
            }
        }
        Ok(self
            .tables
            .read()
            .get(&table)
            .map(|entries| {
                entries
                    .range((Bound::Included(from), upper))
                    .take(limit)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), MapError> {
        let mut tables = self.tables.write();
        for (table, key, value) in batch {
            let entries = tables.entry(table).or_default();
            match value {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
