use bytes::Bytes;

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use crate::error::MapError;

pub(crate) mod memory;
#[cfg(feature = "rocksdb")]
pub(crate) mod rocksdb;

/// Named tables of scavenge state. Each lives in its own key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Hashes,
    Collisions,
    Metastreams,
    MetastreamCollisions,
    OriginalStreams,
    OriginalStreamCollisions,
    ChunkTimeStampRanges,
    ChunkWeights,
    Checkpoint,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Hashes,
        Table::Collisions,
        Table::Metastreams,
        Table::MetastreamCollisions,
        Table::OriginalStreams,
        Table::OriginalStreamCollisions,
        Table::ChunkTimeStampRanges,
        Table::ChunkWeights,
        Table::Checkpoint,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Hashes => "hashes",
            Table::Collisions => "collisions",
            Table::Metastreams => "metastreams",
            Table::MetastreamCollisions => "metastream-collisions",
            Table::OriginalStreams => "original-streams",
            Table::OriginalStreamCollisions => "original-stream-collisions",
            Table::ChunkTimeStampRanges => "chunk-timestamp-ranges",
            Table::ChunkWeights => "chunk-weights",
            Table::Checkpoint => "checkpoint",
        }
    }
}

/// Mutations applied atomically. `None` deletes the key.
pub type WriteBatch = Vec<(Table, Bytes, Option<Bytes>)>;

/// Durable key-value storage underneath the scavenge maps.
///
/// Keys are compared bytewise.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait KvBackend: Send + Sync {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>, MapError>;

    /// Up to `limit` entries of `table` ordered by key, with keys in `[from, to)`. An absent
    /// `to` leaves the range open.
    fn scan(
        &self,
        table: Table,
        from: Bytes,
        to: Option<Bytes>,
        limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>, MapError>;

    /// Apply all mutations of `batch`, or none of them.
    fn write(&self, batch: WriteBatch) -> Result<(), MapError>;
}
