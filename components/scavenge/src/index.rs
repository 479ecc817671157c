//! The table index as the scavenger needs it: reads for the calculator and compaction
//! once chunks are executed.
use std::sync::Arc;

use chunk::index::StreamIndex;
use log::info;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use model::scavenge::ScavengePoint;

use crate::error::ScavengeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInfo {
    pub event_number: i64,
    pub log_position: i64,
}

/// Reads of the index, limited to what was written before the scavenge point.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait IndexReader: Send + Sync {
    fn last_event_number(
        &self,
        stream_id: &str,
        scavenge_point: &ScavengePoint,
    ) -> Result<Option<i64>, ScavengeError>;

    /// Up to `max_count` events of `stream_id` from `from_event_number` onwards, ordered by
    /// event number. Event numbers are not necessarily contiguous.
    fn read_event_infos_forward(
        &self,
        stream_id: &str,
        from_event_number: i64,
        max_count: usize,
        scavenge_point: &ScavengePoint,
    ) -> Result<Vec<EventInfo>, ScavengeError>;
}

/// Decides whether an index entry refers to a discarded event.
pub trait IndexDiscardLookup {
    fn should_discard(
        &self,
        stream_id: &str,
        event_number: i64,
        log_position: i64,
    ) -> Result<bool, ScavengeError>;
}

/// Index compaction, invoked once per successful scavenge.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait IndexScavenger: Send + Sync {
    /// Remove entries of discarded events. Returns the number of entries removed.
    fn scavenge_index(
        &self,
        scavenge_point: &ScavengePoint,
        lookup: &dyn IndexDiscardLookup,
    ) -> Result<u64, ScavengeError>;
}

/// [`IndexReader`] and [`IndexScavenger`] over the in-memory stream index.
pub struct MemoryIndex {
    index: Arc<StreamIndex>,
}

impl MemoryIndex {
    pub fn new(index: Arc<StreamIndex>) -> Self {
        Self { index }
    }
}

impl IndexReader for MemoryIndex {
    fn last_event_number(
        &self,
        stream_id: &str,
        scavenge_point: &ScavengePoint,
    ) -> Result<Option<i64>, ScavengeError> {
        Ok(self
            .index
            .last_event_number(stream_id, scavenge_point.position))
    }

    fn read_event_infos_forward(
        &self,
        stream_id: &str,
        from_event_number: i64,
        max_count: usize,
        scavenge_point: &ScavengePoint,
    ) -> Result<Vec<EventInfo>, ScavengeError> {
        Ok(self
            .index
            .read_forward(
                stream_id,
                from_event_number,
                max_count,
                scavenge_point.position,
            )
            .into_iter()
            .map(|entry| EventInfo {
                event_number: entry.event_number,
                log_position: entry.log_position,
            })
            .collect())
    }
}

impl IndexScavenger for MemoryIndex {
    fn scavenge_index(
        &self,
        scavenge_point: &ScavengePoint,
        lookup: &dyn IndexDiscardLookup,
    ) -> Result<u64, ScavengeError> {
        let mut error = None;
        let removed = self.index.retain(|stream_id, entry| {
            if error.is_some() || entry.log_position >= scavenge_point.position {
                return true;
            }
            match lookup.should_discard(stream_id, entry.event_number, entry.log_position) {
                Ok(discard) => !discard,
                Err(e) => {
                    error = Some(e);
                    true
                }
            }
        });
        if let Some(e) = error {
            return Err(e);
        }
        info!(
            "Removed {} index entries, {} remain",
            removed,
            self.index.len()
        );
        Ok(removed as u64)
    }
}
