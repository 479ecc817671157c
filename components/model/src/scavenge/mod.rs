//! State the scavenger keeps about streams and chunks between passes.
mod checkpoint;
mod data;
mod discard;
mod handle;

pub use checkpoint::{ScavengeCheckpoint, ScavengePoint};
pub use data::{
    CalculationStatus, ChunkExecutionInfo, ChunkTimeStampRange, MetastreamData,
    OriginalStreamData, Unit,
};
pub use discard::DiscardPoint;
pub use handle::StreamHandle;
