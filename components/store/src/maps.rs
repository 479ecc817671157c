//! Bulk and read-modify-write operations of particular maps.
use std::{fmt::Debug, ops::Bound, ops::RangeInclusive};

use log::debug;
use model::{
    scavenge::{
        CalculationStatus, ChunkExecutionInfo, DiscardPoint, MetastreamData, OriginalStreamData,
    },
    StreamMetadata,
};

use crate::{codec::Codec, error::MapError, map::ScavengeMap};

impl<K> ScavengeMap<K, OriginalStreamData>
where
    K: Codec + Debug,
{
    fn update<F>(&self, key: &K, f: F) -> Result<(), MapError>
    where
        F: FnOnce(&mut OriginalStreamData),
    {
        let mut data = self.try_get(key)?.unwrap_or_default();
        f(&mut data);
        self.set(key, &data)
    }

    /// Mark the stream hard deleted. It needs calculating again.
    pub fn set_tombstone(&self, key: &K) -> Result<(), MapError> {
        self.update(key, |data| {
            data.is_tombstoned = true;
            data.status = CalculationStatus::Active;
        })
    }

    /// Replace the retention policy. It needs calculating again.
    pub fn set_metadata(&self, key: &K, metadata: &StreamMetadata) -> Result<(), MapError> {
        self.update(key, |data| {
            data.max_age = metadata.max_age;
            data.max_count = metadata.max_count;
            data.truncate_before = metadata.truncate_before;
            data.status = CalculationStatus::Active;
        })
    }

    pub fn set_discard_points(
        &self,
        key: &K,
        status: CalculationStatus,
        discard_point: DiscardPoint,
        maybe_discard_point: DiscardPoint,
    ) -> Result<(), MapError> {
        self.update(key, |data| {
            data.status = status;
            data.discard_point = discard_point;
            data.maybe_discard_point = maybe_discard_point.or(discard_point);
        })
    }

    pub fn set_status(&self, key: &K, status: CalculationStatus) -> Result<(), MapError> {
        self.update(key, |data| data.status = status)
    }

    pub fn try_get_chunk_execution_info(
        &self,
        key: &K,
    ) -> Result<Option<ChunkExecutionInfo>, MapError> {
        Ok(self.try_get(key)?.map(|data| data.execution_info()))
    }

    /// Up to `limit` active records with keys greater than `checkpoint`, ordered by key.
    pub fn active_records_from_checkpoint(
        &self,
        checkpoint: Option<&K>,
        limit: usize,
    ) -> Result<Vec<(K, OriginalStreamData)>, MapError> {
        let from = checkpoint.map_or(Bound::Unbounded, Bound::Excluded);
        self.records(
            (from, Bound::Unbounded),
            |data| data.status == CalculationStatus::Active,
            limit,
        )
    }

    /// Delete spent records, and archived ones too if `delete_archived`.
    pub fn delete_many(&self, delete_archived: bool) -> Result<usize, MapError> {
        let removed = self.delete_where(|_, data| match data.status {
            CalculationStatus::Spent => true,
            CalculationStatus::Archived => delete_archived,
            CalculationStatus::Active => false,
        })?;
        debug!("Deleted {} records from {}", removed, self.table().name());
        Ok(removed)
    }
}

impl<K> ScavengeMap<K, MetastreamData>
where
    K: Codec + Debug,
{
    pub fn set_tombstone(&self, key: &K) -> Result<(), MapError> {
        let mut data = self.try_get(key)?.unwrap_or_default();
        data.is_tombstoned = true;
        self.set(key, &data)
    }

    pub fn set_discard_point(&self, key: &K, discard_point: DiscardPoint) -> Result<(), MapError> {
        let mut data = self.try_get(key)?.unwrap_or_default();
        data.discard_point = discard_point;
        self.set(key, &data)
    }

    pub fn delete_all(&self) -> Result<usize, MapError> {
        self.delete_where(|_, _| true)
    }
}

impl ScavengeMap<u32, f32> {
    pub fn increase_weight(&self, logical_chunk_number: u32, delta: f32) -> Result<(), MapError> {
        let weight = self.try_get(&logical_chunk_number)?.unwrap_or_default();
        self.set(&logical_chunk_number, &(weight + delta))
    }

    pub fn sum_weights(&self, chunks: RangeInclusive<u32>) -> Result<f32, MapError> {
        let range = (Bound::Included(chunks.start()), Bound::Included(chunks.end()));
        Ok(self
            .records(range, |_| true, usize::MAX)?
            .into_iter()
            .map(|(_, weight)| weight)
            .sum())
    }

    pub fn reset_weights(&self, chunks: RangeInclusive<u32>) -> Result<(), MapError> {
        let range = (Bound::Included(chunks.start()), Bound::Included(chunks.end()));
        for (chunk, _) in self.records(range, |_| true, usize::MAX)? {
            self.try_remove(&chunk)?;
        }
        Ok(())
    }

    pub fn all_weights_are_zero(&self) -> Result<bool, MapError> {
        let unbounded = (Bound::Unbounded, Bound::Unbounded);
        Ok(self.records(unbounded, |weight| *weight != 0.0, 1)?.is_empty())
    }
}
