use model::error::{DecodeError, RecordError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Failed to decode record at physical offset {offset}: {source}")]
    Decode { offset: usize, source: DecodeError },

    #[error("Invalid record")]
    Record(#[from] RecordError),

    #[error("Record of {0} bytes does not fit into a chunk")]
    RecordTooLarge(u64),

    #[error("Chunk #{0} is not found")]
    NotFound(u32),

    #[error("Chunk #{start}-{end} does not line up with existing chunks")]
    RangeMismatch { start: u32, end: u32 },

    #[error("Internal error: `{0}`")]
    Internal(String),
}
