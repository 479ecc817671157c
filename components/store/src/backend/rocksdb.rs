use std::path::Path;

use bytes::Bytes;
use log::info;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, DB};

use super::{KvBackend, Table, WriteBatch};
use crate::error::MapError;

/// Scavenge state in RocksDB, one column family per table.
pub(crate) struct RocksDbBackend {
    db: DB,
}

impl RocksDbBackend {
    pub(crate) fn open(path: &Path) -> Result<Self, MapError> {
        if !path.exists() {
            info!("Create directory: {:?}", path);
            std::fs::create_dir_all(path).map_err(|e| MapError::Backend(e.to_string()))?;
        }

        let cfs: Vec<_> = Table::ALL
            .iter()
            .map(|table| {
                let mut cf_opts = Options::default();
                cf_opts.optimize_for_point_lookup(16 << 20);
                ColumnFamilyDescriptor::new(table.name(), cf_opts)
            })
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_atomic_flush(true);

        let db = DB::open_cf_descriptors(&db_opts, path, cfs)
            .map_err(|e| MapError::Backend(e.into_string()))?;
        info!("Opened scavenge state at {:?}", path);
        Ok(Self { db })
    }

    fn cf(&self, table: Table) -> Result<&ColumnFamily, MapError> {
        self.db.cf_handle(table.name()).ok_or_else(|| {
            MapError::Backend(format!("Column family `{}` is missing", table.name()))
        })
    }
}

impl KvBackend for RocksDbBackend {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>, MapError> {
        self.db
            .get_cf(self.cf(table)?, key)
            .map(|value| value.map(Bytes::from))
            .map_err(|e| MapError::Backend(e.into_string()))
    }

    fn scan(
        &self,
        table: Table,
        from: Bytes,
        to: Option<Bytes>,
        limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>, MapError> {
        let mut entries = vec![];
        let iter = self
            .db
            .iterator_cf(self.cf(table)?, IteratorMode::From(&from, Direction::Forward));
        for entry in iter {
            if entries.len() >= limit {
                break;
            }
            let (key, value) = entry.map_err(|e| MapError::Backend(e.into_string()))?;
            if let Some(to) = &to {
                if key.as_ref() >= to.as_ref() {
                    break;
                }
            }
            entries.push((Bytes::from(key.into_vec()), Bytes::from(value.into_vec())));
        }
        Ok(entries)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), MapError> {
        let mut write_batch = rocksdb::WriteBatch::default();
        for (table, key, value) in batch {
            let cf = self.cf(table)?;
            match value {
                Some(value) => write_batch.put_cf(cf, &key, &value),
                None => write_batch.delete_cf(cf, &key),
            }
        }
        self.db
            .write(write_batch)
            .map_err(|e| MapError::Backend(e.into_string()))
    }
}
