use std::{collections::BTreeMap, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use log::{trace, warn};
use parking_lot::Mutex;

use crate::{
    backend::{KvBackend, Table, WriteBatch},
    error::MapError,
};

/// Writes staged by the transaction in progress. `None` marks a deletion.
type Pending = BTreeMap<(Table, Bytes), Option<Bytes>>;

/// Entries of one [`Storage::scan`] call.
pub(crate) struct ScanPage {
    pub(crate) entries: Vec<(Bytes, Bytes)>,

    /// Where the following page starts, `None` once the range is exhausted.
    pub(crate) next: Option<Bytes>,
}

/// The smallest key ordered after `key`.
pub(crate) fn successor(key: &Bytes) -> Bytes {
    let mut next = BytesMut::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.put_u8(0);
    next.freeze()
}

/// Backend access shared by all maps, with an ambient transaction.
///
/// While a transaction is open, writes are staged and reads observe them. Outside of a
/// transaction each write is applied on its own.
pub(crate) struct Storage {
    backend: Arc<dyn KvBackend>,
    pending: Mutex<Option<Pending>>,
}

impl Storage {
    pub(crate) fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            pending: Mutex::new(None),
        }
    }

    pub(crate) fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>, MapError> {
        if let Some(pending) = self.pending.lock().as_ref() {
            if let Some(value) = pending.get(&(table, Bytes::copy_from_slice(key))) {
                return Ok(value.clone());
            }
        }
        self.backend.get(table, key)
    }

    /// A page of `table` with keys in `[from, to)`. Staged writes are merged in, so a page
    /// may hold more or fewer than `limit` entries.
    pub(crate) fn scan(
        &self,
        table: Table,
        from: Bytes,
        to: Option<Bytes>,
        limit: usize,
    ) -> Result<ScanPage, MapError> {
        let limit = limit.max(1);
        let committed = self.backend.scan(table, from.clone(), to.clone(), limit)?;
        // A full page may stop short of `to`. Staged keys beyond its last key belong to the
        // next page.
        let last = if committed.len() >= limit {
            committed.last().map(|(key, _)| key.clone())
        } else {
            None
        };
        let next = last.as_ref().map(successor);

        let guard = self.pending.lock();
        let pending = match guard.as_ref() {
            Some(pending) => pending,
            None => {
                return Ok(ScanPage {
                    entries: committed,
                    next,
                });
            }
        };

        let mut merged: BTreeMap<Bytes, Bytes> = committed.into_iter().collect();
        for ((_, key), value) in pending
            .range((table, from)..)
            .take_while(|((staged, _), _)| *staged == table)
            .take_while(|((_, key), _)| match (&last, &to) {
                (Some(last), _) => key <= last,
                (None, Some(to)) => key < to,
                (None, None) => true,
            })
        {
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        Ok(ScanPage {
            entries: merged.into_iter().collect(),
            next,
        })
    }

    pub(crate) fn put(&self, table: Table, key: Bytes, value: Bytes) -> Result<(), MapError> {
        self.stage(table, key, Some(value))
    }

    pub(crate) fn delete(&self, table: Table, key: Bytes) -> Result<(), MapError> {
        self.stage(table, key, None)
    }

    fn stage(&self, table: Table, key: Bytes, value: Option<Bytes>) -> Result<(), MapError> {
        let mut guard = self.pending.lock();
        match guard.as_mut() {
            Some(pending) => {
                pending.insert((table, key), value);
                Ok(())
            }
            None => {
                drop(guard);
                self.backend.write(vec![(table, key, value)])
            }
        }
    }

    pub(crate) fn begin(&self) -> Result<(), MapError> {
        let mut guard = self.pending.lock();
        if guard.is_some() {
            return Err(MapError::TransactionInProgress);
        }
        *guard = Some(Pending::new());
        trace!("Transaction began");
        Ok(())
    }

    /// Apply the staged writes atomically. The transaction ends even if the backend fails.
    pub(crate) fn commit(&self) -> Result<(), MapError> {
        let pending = self.pending.lock().take().ok_or(MapError::NoTransaction)?;
        let batch: WriteBatch = pending
            .into_iter()
            .map(|((table, key), value)| (table, key, value))
            .collect();
        let len = batch.len();
        self.backend.write(batch).map_err(|e| {
            warn!("Failed to commit {} staged writes: {}", len, e);
            e
        })?;
        trace!("Transaction committed {} writes", len);
        Ok(())
    }

    pub(crate) fn rollback(&self) -> Result<(), MapError> {
        let pending = self.pending.lock().take().ok_or(MapError::NoTransaction)?;
        trace!("Transaction rolled back, {} writes discarded", pending.len());
        Ok(())
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.pending.lock().is_some()
    }
}
