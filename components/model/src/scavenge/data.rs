use std::time::Duration;

use chrono::{DateTime, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::DiscardPoint;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CalculationStatus {
    /// Needs calculation and execution.
    #[default]
    Active = 0,

    /// Discard points are realized in every chunk; the state may be deleted.
    Spent = 1,

    /// Kept out of cleaning.
    Archived = 2,
}

/// Marker value of set-like maps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Unit;

/// What the scavenger knows about a stream that has metadata or a tombstone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginalStreamData {
    pub is_tombstoned: bool,
    pub max_age: Option<Duration>,
    pub max_count: Option<i64>,
    pub truncate_before: Option<i64>,

    /// Events below this point are certainly discardable.
    pub discard_point: DiscardPoint,

    /// Events below this point may be discardable, subject to their timestamps.
    /// Never lower than `discard_point`.
    pub maybe_discard_point: DiscardPoint,
    pub status: CalculationStatus,
}

impl OriginalStreamData {
    pub fn execution_info(&self) -> ChunkExecutionInfo {
        ChunkExecutionInfo {
            is_tombstoned: self.is_tombstoned,
            discard_point: self.discard_point,
            maybe_discard_point: self.maybe_discard_point,
            max_age: self.max_age,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetastreamData {
    /// Set when the original stream is hard deleted.
    pub is_tombstoned: bool,
    pub discard_point: DiscardPoint,
}

/// The part of `OriginalStreamData` chunk execution needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkExecutionInfo {
    pub is_tombstoned: bool,
    pub discard_point: DiscardPoint,
    pub maybe_discard_point: DiscardPoint,
    pub max_age: Option<Duration>,
}

/// Oldest and newest prepare timestamps within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTimeStampRange {
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
}

impl ChunkTimeStampRange {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            min: timestamp,
            max: timestamp,
        }
    }

    pub fn extend(&mut self, timestamp: DateTime<Utc>) {
        self.min = self.min.min(timestamp);
        self.max = self.max.max(timestamp);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{CalculationStatus, ChunkTimeStampRange};

    #[test]
    fn test_time_stamp_range() {
        let now = Utc::now();
        let mut range = ChunkTimeStampRange::new(now);
        range.extend(now - Duration::seconds(5));
        range.extend(now + Duration::seconds(5));
        range.extend(now);
        assert_eq!(now - Duration::seconds(5), range.min);
        assert_eq!(now + Duration::seconds(5), range.max);
    }

    #[test]
    fn test_status_encoding() {
        assert_eq!(1u8, Into::<u8>::into(CalculationStatus::Spent));
        assert_eq!(Ok(CalculationStatus::Archived), CalculationStatus::try_from(2u8));
        assert!(CalculationStatus::try_from(3u8).is_err());
    }
}
