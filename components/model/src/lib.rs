//! Data model of the transaction log and of the scavenge state kept about it.
//!
//! Log records are what chunks physically contain; the `scavenge` module holds the
//! per-stream and per-chunk facts the scavenger accumulates between passes.
pub mod error;
pub mod metadata;
pub mod record;
pub mod scavenge;
pub mod stream;

pub use crate::metadata::StreamMetadata;
pub use crate::record::{
    commit::CommitRecord, prepare::Event, prepare::PrepareBuilder, prepare::PrepareFlags,
    prepare::PrepareRecord, system::SystemRecord, LogRecord, RecordType,
};
