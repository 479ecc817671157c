//! # Scavenger
//!
//! Reclaims space in a chunked transaction log. A scavenge runs in phases against a
//! scavenge point, the log position it was started at:
//!
//! 1. Accumulation reads chunks written since the previous scavenge and records stream
//!    metadata, tombstones, timestamps of chunks and hash collisions of stream ids.
//! 2. Calculation turns the accumulated metadata into discard points of every stream and
//!    weighs chunks by how much of them is discardable.
//! 3. Chunk execution rewrites chunks that are heavy enough and switches them in.
//! 4. Chunk merging optionally combines adjacent small chunks.
//! 5. Index execution removes index entries of discarded events.
//! 6. Cleaning drops state that later scavenges will never need.
//!
//! Every phase checkpoints its progress into the scavenge state, so a stopped or
//! crashed scavenge resumes where it was left. State that refers to streams is keyed by
//! the hash of the stream id, unless the hash is known to collide, see
//! [`collision::StreamIdentityResolver`].
pub mod clock;
pub mod collision;
pub mod driver;
pub mod error;
pub mod hash;
pub mod index;
pub mod notification;
pub mod scavenger;
pub mod state;
pub mod status;

mod accumulator;
mod calculator;
mod cleaner;
mod executor;
mod merger;

pub use crate::driver::{ScavengeDriver, ScavengeHandle};
pub use crate::error::ScavengeError;
pub use crate::notification::{LoggingListener, ScavengeEvent, ScavengeListener, ScavengeResult};
pub use crate::scavenger::{open_store, ScavengeOptions, Scavenger};
pub use crate::status::{ScavengeStatus, StatusTracker};
