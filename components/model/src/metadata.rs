use std::time::Duration;

use bytes::Bytes;
use log::warn;
use serde::{Deserialize, Serialize};

/// Retention policy of a stream, written as JSON events to its metastream.
///
/// Only the newest metadata event of a metastream is effective.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    /// Keep at most this many of the newest events.
    pub max_count: Option<i64>,

    /// Keep events younger than this.
    pub max_age: Option<Duration>,

    /// Events with lower numbers are deleted. `DELETED_STREAM` marks a soft delete.
    pub truncate_before: Option<i64>,

    pub temp_stream: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Raw {
    #[serde(rename = "$maxCount", default, skip_serializing_if = "Option::is_none")]
    max_count: Option<i64>,

    /// Seconds
    #[serde(rename = "$maxAge", default, skip_serializing_if = "Option::is_none")]
    max_age: Option<i64>,

    #[serde(rename = "$tb", default, skip_serializing_if = "Option::is_none")]
    truncate_before: Option<i64>,

    #[serde(rename = "$tmp", default, skip_serializing_if = "Option::is_none")]
    temp_stream: Option<bool>,
}

impl StreamMetadata {
    /// Parse metadata from the data of a metadata event.
    ///
    /// Malformed JSON yields a policy-free metadata, so that a broken metadata write
    /// never causes data to be scavenged. Out-of-range values are ignored individually.
    pub fn from_slice(data: &[u8]) -> Self {
        let raw: Raw = match serde_json::from_slice(data) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Ignoring malformed stream metadata: {}", e);
                return Self::default();
            }
        };

        Self {
            max_count: raw.max_count.filter(|count| *count > 0),
            max_age: raw
                .max_age
                .filter(|secs| *secs > 0)
                .map(|secs| Duration::from_secs(secs as u64)),
            truncate_before: raw.truncate_before.filter(|tb| *tb >= 0),
            temp_stream: raw.temp_stream,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        let raw = Raw {
            max_count: self.max_count,
            max_age: self.max_age.map(|age| age.as_secs() as i64),
            truncate_before: self.truncate_before,
            temp_stream: self.temp_stream,
        };
        serde_json::to_vec(&raw).map(Bytes::from)
    }

    pub fn has_policy(&self) -> bool {
        self.max_count.is_some() || self.max_age.is_some() || self.truncate_before.is_some()
    }

    pub fn with_max_count(mut self, max_count: i64) -> Self {
        self.max_count = Some(max_count);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_truncate_before(mut self, truncate_before: i64) -> Self {
        self.truncate_before = Some(truncate_before);
        self
    }
}
