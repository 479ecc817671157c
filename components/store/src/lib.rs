//! Durable working state of the scavenger.
//!
//! State is kept in named maps on top of a pluggable key-value backend. All maps share
//! one ambient transaction: the scavenger begins it, updates maps together with the
//! checkpoint, then commits, so that a crash never separates progress from state.
pub mod backend;
pub mod codec;
pub mod error;

mod map;
mod maps;
mod transaction;

use std::sync::Arc;

use model::scavenge::{
    ChunkTimeStampRange, MetastreamData, OriginalStreamData, ScavengeCheckpoint, Unit,
};

use crate::{
    backend::{memory::MemoryBackend, KvBackend, Table},
    error::MapError,
    transaction::Storage,
};

pub use crate::map::ScavengeMap;

/// All maps of scavenge state.
pub struct ScavengeStore {
    storage: Arc<Storage>,

    /// Stream hash -> the stream id known to use it.
    pub hashes: ScavengeMap<u64, String>,

    /// Stream ids whose hash is shared with another stream.
    pub collisions: ScavengeMap<String, Unit>,

    pub metastreams: ScavengeMap<u64, MetastreamData>,
    pub metastream_collisions: ScavengeMap<String, MetastreamData>,
    pub original_streams: ScavengeMap<u64, OriginalStreamData>,
    pub original_stream_collisions: ScavengeMap<String, OriginalStreamData>,

    /// Logical chunk number -> timestamps of its prepares.
    pub chunk_time_stamp_ranges: ScavengeMap<u32, ChunkTimeStampRange>,

    /// Logical chunk number -> estimate of its discardable records.
    pub chunk_weights: ScavengeMap<u32, f32>,

    pub checkpoint: ScavengeMap<Unit, ScavengeCheckpoint>,
}

impl ScavengeStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        let storage = Arc::new(Storage::new(backend));
        Self {
            hashes: ScavengeMap::new(Table::Hashes, Arc::clone(&storage)),
            collisions: ScavengeMap::new(Table::Collisions, Arc::clone(&storage)),
            metastreams: ScavengeMap::new(Table::Metastreams, Arc::clone(&storage)),
            metastream_collisions: ScavengeMap::new(
                Table::MetastreamCollisions,
                Arc::clone(&storage),
            ),
            original_streams: ScavengeMap::new(Table::OriginalStreams, Arc::clone(&storage)),
            original_stream_collisions: ScavengeMap::new(
                Table::OriginalStreamCollisions,
                Arc::clone(&storage),
            ),
            chunk_time_stamp_ranges: ScavengeMap::new(
                Table::ChunkTimeStampRanges,
                Arc::clone(&storage),
            ),
            chunk_weights: ScavengeMap::new(Table::ChunkWeights, Arc::clone(&storage)),
            checkpoint: ScavengeMap::new(Table::Checkpoint, Arc::clone(&storage)),
            storage,
        }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::default()))
    }

    #[cfg(feature = "rocksdb")]
    pub fn rocksdb(path: &std::path::Path) -> Result<Self, MapError> {
        Ok(Self::new(Arc::new(backend::rocksdb::RocksDbBackend::open(
            path,
        )?)))
    }

    pub fn begin(&self) -> Result<(), MapError> {
        self.storage.begin()
    }

    pub fn commit(&self) -> Result<(), MapError> {
        self.storage.commit()
    }

    pub fn rollback(&self) -> Result<(), MapError> {
        self.storage.rollback()
    }

    pub fn in_transaction(&self) -> bool {
        self.storage.in_transaction()
    }

    pub fn read_checkpoint(&self) -> Result<Option<ScavengeCheckpoint>, MapError> {
        self.checkpoint.try_get(&Unit)
    }

    pub fn write_checkpoint(&self, checkpoint: &ScavengeCheckpoint) -> Result<(), MapError> {
        self.checkpoint.set(&Unit, checkpoint)
    }
}
