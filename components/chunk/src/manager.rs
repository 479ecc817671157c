use std::sync::Arc;

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use crate::{chunk::Chunk, error::ChunkError};

/// The part of a chunked log the scavenger works against.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait ChunkManager: Send + Sync {
    /// Logical size of one chunk number.
    fn chunk_size(&self) -> u64;

    /// Log position the next record will be written at.
    fn writer_checkpoint(&self) -> i64;

    /// The completed chunk covering `logical_chunk_number`, if any.
    ///
    /// Chunks still being written to are never returned.
    fn completed_chunk(&self, logical_chunk_number: u32) -> Option<Arc<Chunk>>;

    /// Completed chunks in ascending order.
    fn completed_chunks(&self) -> Vec<Arc<Chunk>>;

    /// Replace the completed chunks covered by `chunk` with it.
    ///
    /// Returns the replaced chunks. Readers holding them are unaffected.
    fn switch_in(&self, chunk: Chunk) -> Result<Vec<Arc<Chunk>>, ChunkError>;
}
