//! Stream naming conventions and reserved event numbers.

/// Event number of a tombstone, also the `truncate-before` value of a soft deleted stream.
pub const DELETED_STREAM: i64 = i64::MAX;

/// Expected version of a write to a stream that does not exist yet.
pub const NO_STREAM: i64 = -1;

pub const METASTREAM_PREFIX: &str = "$$";

pub const SYSTEM_STREAM_PREFIX: &str = "$";

/// Event type of the single event carried by a tombstone.
pub const STREAM_DELETED_EVENT_TYPE: &str = "$streamDeleted";

/// Event type of events written to a metastream.
pub const METADATA_EVENT_TYPE: &str = "$metadata";

pub fn is_metastream(stream_id: &str) -> bool {
    stream_id.starts_with(METASTREAM_PREFIX)
}

pub fn is_system_stream(stream_id: &str) -> bool {
    stream_id.starts_with(SYSTEM_STREAM_PREFIX)
}

/// `orders` -> `$$orders`
pub fn metastream_of(stream_id: &str) -> String {
    format!("{}{}", METASTREAM_PREFIX, stream_id)
}

/// `$$orders` -> `orders`. Returns `None` if `stream_id` is not a metastream.
pub fn original_stream_of(stream_id: &str) -> Option<&str> {
    stream_id.strip_prefix(METASTREAM_PREFIX)
}
