use chrono::{DateTime, Utc};

use super::StreamHandle;

/// Where and when a scavenge pass was started.
#[derive(Debug, Clone, PartialEq)]
pub struct ScavengePoint {
    /// Sequence number of the pass.
    pub number: u64,

    /// Writer checkpoint captured when the pass began. Only chunks ending at or below it
    /// are scavenged.
    pub position: i64,

    /// `now` used for every max-age decision of the pass.
    pub effective_now: DateTime<Utc>,

    /// Chunks weighing no more than this are not rewritten.
    pub threshold: f32,
}

/// Progress of the current pass. Exactly one exists at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum ScavengeCheckpoint {
    Accumulating {
        scavenge_point: ScavengePoint,
        done_logical_chunk_number: Option<u32>,
    },
    Calculating {
        scavenge_point: ScavengePoint,
        done_stream_handle: Option<StreamHandle>,
    },
    ExecutingChunks {
        scavenge_point: ScavengePoint,
        done_logical_chunk_number: Option<u32>,
        /// Chunks of the pass that failed so far. Index execution is skipped unless zero.
        chunks_failed: u32,
    },
    MergingChunks {
        scavenge_point: ScavengePoint,
        chunks_failed: u32,
    },
    ExecutingIndex {
        scavenge_point: ScavengePoint,
        chunks_failed: u32,
    },
    Cleaning {
        scavenge_point: ScavengePoint,
        chunks_failed: u32,
    },
    Done {
        scavenge_point: ScavengePoint,
    },
}

impl ScavengeCheckpoint {
    pub fn scavenge_point(&self) -> &ScavengePoint {
        match self {
            ScavengeCheckpoint::Accumulating { scavenge_point, .. }
            | ScavengeCheckpoint::Calculating { scavenge_point, .. }
            | ScavengeCheckpoint::ExecutingChunks { scavenge_point, .. }
            | ScavengeCheckpoint::MergingChunks { scavenge_point, .. }
            | ScavengeCheckpoint::ExecutingIndex { scavenge_point, .. }
            | ScavengeCheckpoint::Cleaning { scavenge_point, .. }
            | ScavengeCheckpoint::Done { scavenge_point } => scavenge_point,
        }
    }

    /// Chunks that failed earlier in the pass.
    pub fn chunks_failed(&self) -> u32 {
        match self {
            ScavengeCheckpoint::ExecutingChunks { chunks_failed, .. }
            | ScavengeCheckpoint::MergingChunks { chunks_failed, .. }
            | ScavengeCheckpoint::ExecutingIndex { chunks_failed, .. }
            | ScavengeCheckpoint::Cleaning { chunks_failed, .. } => *chunks_failed,
            ScavengeCheckpoint::Accumulating { .. }
            | ScavengeCheckpoint::Calculating { .. }
            | ScavengeCheckpoint::Done { .. } => 0,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ScavengeCheckpoint::Done { .. })
    }

    pub fn phase(&self) -> &'static str {
        match self {
            ScavengeCheckpoint::Accumulating { .. } => "Accumulating",
            ScavengeCheckpoint::Calculating { .. } => "Calculating",
            ScavengeCheckpoint::ExecutingChunks { .. } => "ExecutingChunks",
            ScavengeCheckpoint::MergingChunks { .. } => "MergingChunks",
            ScavengeCheckpoint::ExecutingIndex { .. } => "ExecutingIndex",
            ScavengeCheckpoint::Cleaning { .. } => "Cleaning",
            ScavengeCheckpoint::Done { .. } => "Done",
        }
    }
}
