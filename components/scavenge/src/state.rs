use std::{ops::RangeInclusive, sync::Arc};

use log::{info, warn};
use model::{
    scavenge::{
        CalculationStatus, ChunkExecutionInfo, ChunkTimeStampRange, DiscardPoint, MetastreamData,
        OriginalStreamData, ScavengeCheckpoint, StreamHandle,
    },
    StreamMetadata,
};
use store::{error::MapError, ScavengeStore};

use crate::{collision::StreamIdentityResolver, hash::LongHasher};

/// Scavenge state addressed by stream id.
///
/// Combines the maps with the identity resolver, so that callers never choose between
/// hash-keyed and id-keyed maps themselves.
pub struct ScavengeState {
    store: Arc<ScavengeStore>,
    resolver: StreamIdentityResolver,
}

impl ScavengeState {
    pub fn new(
        store: Arc<ScavengeStore>,
        hasher: Arc<dyn LongHasher>,
        cache_capacity: usize,
    ) -> Result<Self, MapError> {
        let resolver = StreamIdentityResolver::new(Arc::clone(&store), hasher, cache_capacity)?;
        Ok(Self { store, resolver })
    }

    pub fn store(&self) -> &ScavengeStore {
        &self.store
    }

    pub fn resolver(&self) -> &StreamIdentityResolver {
        &self.resolver
    }

    pub fn begin(&self) -> Result<(), MapError> {
        self.store.begin()
    }

    /// Commit the transaction in progress together with `checkpoint`.
    pub fn commit(&self, checkpoint: &ScavengeCheckpoint) -> Result<(), MapError> {
        self.store.write_checkpoint(checkpoint)?;
        self.store.commit()
    }

    /// Discard the transaction in progress, if any.
    pub fn rollback(&self) -> Result<(), MapError> {
        if self.store.in_transaction() {
            warn!("Rolling back scavenge state");
            self.store.rollback()?;
            self.resolver.reload()?;
        }
        Ok(())
    }

    /// Run `f` in a transaction committed with the checkpoint it returns.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<(T, ScavengeCheckpoint), E>,
        E: From<MapError>,
    {
        self.begin()?;
        match f() {
            Ok((value, checkpoint)) => match self.commit(&checkpoint) {
                Ok(()) => Ok(value),
                Err(e) => {
                    // A failed commit ends the transaction but staged lookups may be cached.
                    self.resolver.reload()?;
                    Err(e.into())
                }
            },
            Err(e) => {
                self.rollback()?;
                Err(e)
            }
        }
    }

    pub fn read_checkpoint(&self) -> Result<Option<ScavengeCheckpoint>, MapError> {
        self.store.read_checkpoint()
    }

    pub fn set_checkpoint(&self, checkpoint: &ScavengeCheckpoint) -> Result<(), MapError> {
        info!("Scavenge checkpoint: {:?}", checkpoint);
        self.store.write_checkpoint(checkpoint)
    }

    pub fn detect_collisions(&self, stream_id: &str) -> Result<(), MapError> {
        self.resolver.detect_collisions(stream_id)
    }

    pub fn set_original_stream_metadata(
        &self,
        stream_id: &str,
        metadata: &StreamMetadata,
    ) -> Result<(), MapError> {
        match self.resolver.handle_of(stream_id) {
            StreamHandle::Hash(hash) => self.store.original_streams.set_metadata(&hash, metadata),
            StreamHandle::Exact(id) => self
                .store
                .original_stream_collisions
                .set_metadata(&id, metadata),
        }
    }

    pub fn set_original_stream_tombstone(&self, stream_id: &str) -> Result<(), MapError> {
        match self.resolver.handle_of(stream_id) {
            StreamHandle::Hash(hash) => self.store.original_streams.set_tombstone(&hash),
            StreamHandle::Exact(id) => self.store.original_stream_collisions.set_tombstone(&id),
        }
    }

    pub fn set_metastream_tombstone(&self, metastream_id: &str) -> Result<(), MapError> {
        match self.resolver.handle_of(metastream_id) {
            StreamHandle::Hash(hash) => self.store.metastreams.set_tombstone(&hash),
            StreamHandle::Exact(id) => self.store.metastream_collisions.set_tombstone(&id),
        }
    }

    pub fn set_metastream_discard_point(
        &self,
        metastream_id: &str,
        discard_point: DiscardPoint,
    ) -> Result<(), MapError> {
        match self.resolver.handle_of(metastream_id) {
            StreamHandle::Hash(hash) => self
                .store
                .metastreams
                .set_discard_point(&hash, discard_point),
            StreamHandle::Exact(id) => self
                .store
                .metastream_collisions
                .set_discard_point(&id, discard_point),
        }
    }

    pub fn metastream_data(&self, metastream_id: &str) -> Result<Option<MetastreamData>, MapError> {
        match self.resolver.handle_of(metastream_id) {
            StreamHandle::Hash(hash) => self.store.metastreams.try_get(&hash),
            StreamHandle::Exact(id) => self.store.metastream_collisions.try_get(&id),
        }
    }

    pub fn chunk_execution_info(
        &self,
        stream_id: &str,
    ) -> Result<Option<ChunkExecutionInfo>, MapError> {
        match self.resolver.handle_of(stream_id) {
            StreamHandle::Hash(hash) => self
                .store
                .original_streams
                .try_get_chunk_execution_info(&hash),
            StreamHandle::Exact(id) => self
                .store
                .original_stream_collisions
                .try_get_chunk_execution_info(&id),
        }
    }

    pub fn original_stream_data(
        &self,
        handle: &StreamHandle,
    ) -> Result<Option<OriginalStreamData>, MapError> {
        match handle {
            StreamHandle::Hash(hash) => self.store.original_streams.try_get(hash),
            StreamHandle::Exact(id) => self.store.original_stream_collisions.try_get(id),
        }
    }

    pub fn set_original_stream_discard_points(
        &self,
        handle: &StreamHandle,
        status: CalculationStatus,
        discard_point: DiscardPoint,
        maybe_discard_point: DiscardPoint,
    ) -> Result<(), MapError> {
        match handle {
            StreamHandle::Hash(hash) => self.store.original_streams.set_discard_points(
                hash,
                status,
                discard_point,
                maybe_discard_point,
            ),
            StreamHandle::Exact(id) => self.store.original_stream_collisions.set_discard_points(
                id,
                status,
                discard_point,
                maybe_discard_point,
            ),
        }
    }

    pub fn set_original_stream_status(
        &self,
        handle: &StreamHandle,
        status: CalculationStatus,
    ) -> Result<(), MapError> {
        match handle {
            StreamHandle::Hash(hash) => self.store.original_streams.set_status(hash, status),
            StreamHandle::Exact(id) => self
                .store
                .original_stream_collisions
                .set_status(id, status),
        }
    }

    /// Up to `limit` active original streams ordered by handle, after `checkpoint`.
    ///
    /// Hash handles order before exact ones, so a scan resumed from any handle visits
    /// every remaining stream exactly once.
    pub fn original_streams_to_calculate(
        &self,
        checkpoint: Option<&StreamHandle>,
        limit: usize,
    ) -> Result<Vec<(StreamHandle, OriginalStreamData)>, MapError> {
        let mut streams = vec![];
        let exact_from = match checkpoint {
            None | Some(StreamHandle::Hash(_)) => {
                let from = match checkpoint {
                    Some(StreamHandle::Hash(hash)) => Some(hash),
                    _ => None,
                };
                streams.extend(
                    self.store
                        .original_streams
                        .active_records_from_checkpoint(from, limit)?
                        .into_iter()
                        .map(|(hash, data)| (StreamHandle::Hash(hash), data)),
                );
                None
            }
            Some(StreamHandle::Exact(id)) => Some(id),
        };
        if streams.len() < limit {
            streams.extend(
                self.store
                    .original_stream_collisions
                    .active_records_from_checkpoint(exact_from, limit - streams.len())?
                    .into_iter()
                    .map(|(id, data)| (StreamHandle::Exact(id), data)),
            );
        }
        Ok(streams)
    }

    /// Every original stream, active or not, ordered by handle.
    pub fn all_original_streams(
        &self,
    ) -> Result<Vec<(StreamHandle, OriginalStreamData)>, MapError> {
        let mut streams: Vec<_> = self
            .store
            .original_streams
            .all_records()?
            .into_iter()
            .map(|(hash, data)| (StreamHandle::Hash(hash), data))
            .collect();
        streams.extend(
            self.store
                .original_stream_collisions
                .all_records()?
                .into_iter()
                .map(|(id, data)| (StreamHandle::Exact(id), data)),
        );
        Ok(streams)
    }

    pub fn chunk_time_stamp_range(
        &self,
        logical_chunk_number: u32,
    ) -> Result<Option<ChunkTimeStampRange>, MapError> {
        self.store.chunk_time_stamp_ranges.try_get(&logical_chunk_number)
    }

    pub fn set_chunk_time_stamp_range(
        &self,
        logical_chunk_number: u32,
        range: &ChunkTimeStampRange,
    ) -> Result<(), MapError> {
        self.store
            .chunk_time_stamp_ranges
            .set(&logical_chunk_number, range)
    }

    pub fn increase_chunk_weight(
        &self,
        logical_chunk_number: u32,
        delta: f32,
    ) -> Result<(), MapError> {
        self.store
            .chunk_weights
            .increase_weight(logical_chunk_number, delta)
    }

    pub fn sum_chunk_weights(&self, chunks: RangeInclusive<u32>) -> Result<f32, MapError> {
        self.store.chunk_weights.sum_weights(chunks)
    }

    pub fn reset_chunk_weights(&self, chunks: RangeInclusive<u32>) -> Result<(), MapError> {
        self.store.chunk_weights.reset_weights(chunks)
    }

    pub fn all_chunks_executed(&self) -> Result<bool, MapError> {
        self.store.chunk_weights.all_weights_are_zero()
    }

    pub fn delete_original_stream_data(&self, delete_archived: bool) -> Result<usize, MapError> {
        Ok(self.store.original_streams.delete_many(delete_archived)?
            + self
                .store
                .original_stream_collisions
                .delete_many(delete_archived)?)
    }

    pub fn delete_metastream_data(&self) -> Result<usize, MapError> {
        Ok(self.store.metastreams.delete_all()? + self.store.metastream_collisions.delete_all()?)
    }
}
