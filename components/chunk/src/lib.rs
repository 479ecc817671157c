//! Chunks of the transaction log as the scavenger sees them.
//!
//! [`MemoryChunkDb`] is a complete in-memory chunked log: it appends records, seals chunks
//! once they are full, indexes committed events and lets scavenged chunks be switched in.
pub mod error;
pub mod index;

mod chunk;
mod manager;
mod memory;

pub use crate::chunk::{Chunk, ChunkBuilder, ChunkHeader, ChunkRecord, ChunkRecords, PosMap};
pub use crate::manager::ChunkManager;
#[cfg(any(test, feature = "mock"))]
pub use crate::manager::MockChunkManager;
pub use crate::memory::MemoryChunkDb;
