use std::{
    fmt,
    ops::{BitOr, BitOrAssign},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::{DecodeError, RecordError},
    stream::{DELETED_STREAM, NO_STREAM, STREAM_DELETED_EVENT_TYPE},
};

use super::{
    ensure, get_blob, get_str, get_timestamp, get_uuid, put_blob, put_str, put_timestamp,
    truncate_to_millis, FRAME_HEADER_LEN,
};

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PrepareFlags(u16);

impl PrepareFlags {
    pub const NONE: PrepareFlags = PrepareFlags(0);
    pub const DATA: PrepareFlags = PrepareFlags(0x01);
    pub const TRANSACTION_BEGIN: PrepareFlags = PrepareFlags(0x02);
    pub const TRANSACTION_END: PrepareFlags = PrepareFlags(0x04);
    pub const STREAM_DELETE: PrepareFlags = PrepareFlags(0x08);
    pub const IS_COMMITTED: PrepareFlags = PrepareFlags(0x20);
    pub const IS_JSON: PrepareFlags = PrepareFlags(0x100);

    /// A write that is committed by itself, without a separate commit record.
    pub const SINGLE_WRITE: PrepareFlags = PrepareFlags(0x01 | 0x02 | 0x04 | 0x20);

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: PrepareFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: PrepareFlags) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for PrepareFlags {
    type Output = PrepareFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        PrepareFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PrepareFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PrepareFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (PrepareFlags::DATA, "Data"),
            (PrepareFlags::TRANSACTION_BEGIN, "TransactionBegin"),
            (PrepareFlags::TRANSACTION_END, "TransactionEnd"),
            (PrepareFlags::STREAM_DELETE, "StreamDelete"),
            (PrepareFlags::IS_COMMITTED, "IsCommitted"),
            (PrepareFlags::IS_JSON, "IsJson"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "PrepareFlags({})", set.join(" | "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl Event {
    pub fn new(event_type: &str, data: Bytes) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_owned(),
            data,
            metadata: Bytes::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Bytes) -> Self {
        self.metadata = metadata;
        self
    }

    /// Event =>
    ///   EventId => [u8; 16]
    ///   EventType => u16 length + UTF-8
    ///   Data => u32 length + bytes
    ///   Metadata => u32 length + bytes
    pub(crate) fn encoded_len(&self) -> usize {
        16 + 2 + self.event_type.len() + 4 + self.data.len() + 4 + self.metadata.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.event_id.as_bytes());
        put_str(buf, &self.event_type);
        put_blob(buf, &self.data);
        put_blob(buf, &self.metadata);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            event_id: get_uuid(buf)?,
            event_type: get_str(buf)?,
            data: get_blob(buf)?,
            metadata: get_blob(buf)?,
        })
    }
}

/// A staged write of one or more events to a single stream.
///
/// Prepare body =>
///   Flags => u16
///   TransactionPosition => i64
///   TransactionOffset => i32
///   ExpectedVersion => i64
///   StreamId => u16 length + UTF-8
///   Timestamp => i64, milliseconds since epoch
///   CorrelationId => [u8; 16]
///   EventCount => u16
///   Events => [Event]
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareRecord {
    pub log_position: i64,
    pub flags: PrepareFlags,
    pub transaction_position: i64,

    /// Index of the first event of this record within its transaction.
    pub transaction_offset: i32,

    /// Event number preceding the first event of this record.
    pub expected_version: i64,
    pub stream_id: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub events: Vec<Event>,
}

impl PrepareRecord {
    const FIXED_HEADER_LEN: usize = 2 + 8 + 4 + 8 + 2 + 8 + 16 + 2;

    /// Check that every field fits its length prefix.
    pub fn validate(&self) -> Result<(), RecordError> {
        let max = u16::MAX as usize;
        if self.events.len() > max {
            return Err(RecordError::TooManyEvents { max });
        }
        let too_long = |field, len: usize| RecordError::FieldTooLong { field, len, max };
        if self.stream_id.len() > max {
            return Err(too_long("stream_id", self.stream_id.len()));
        }
        if let Some(event) = self.events.iter().find(|event| event.event_type.len() > max) {
            return Err(too_long("event_type", event.event_type.len()));
        }
        Ok(())
    }

    pub fn is_committed(&self) -> bool {
        self.flags.contains(PrepareFlags::IS_COMMITTED)
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags.contains(PrepareFlags::STREAM_DELETE)
    }

    pub fn has_data(&self) -> bool {
        self.flags.contains(PrepareFlags::DATA)
    }

    pub fn is_batched(&self) -> bool {
        self.events.len() > 1
    }

    /// Number of the first event, valid for records committed by themselves.
    pub fn first_event_number(&self) -> i64 {
        self.expected_version + 1
    }

    pub fn last_event_number(&self) -> i64 {
        self.expected_version + self.events.len() as i64
    }

    /// Bytes from the start of the record to its first event.
    pub fn header_len(&self) -> usize {
        FRAME_HEADER_LEN + Self::FIXED_HEADER_LEN + self.stream_id.len()
    }

    /// Log position of the `index`th event carried by this record.
    pub fn event_log_position(&self, index: usize) -> i64 {
        let preceding: usize = self.events[..index.min(self.events.len())]
            .iter()
            .map(Event::encoded_len)
            .sum();
        self.log_position + (self.header_len() + preceding) as i64
    }

    /// Derive the record that carries only the events from `index` onwards.
    ///
    /// Surviving events are shared, not copied, so their payloads remain byte-identical.
    /// Each surviving event keeps its log position, which places the new record
    /// `header_len` bytes before its first event. When a single event survives, the
    /// record takes the log position of that event instead, so that the event stays
    /// addressable by a record position that the index already knows.
    pub fn keep_from(&self, index: usize) -> Result<PrepareRecord, RecordError> {
        let count = self.events.len();
        if index >= count {
            return Err(RecordError::EventIndexOutOfRange { index, count });
        }
        if index == 0 {
            return Ok(self.clone());
        }

        let event_position = self.event_log_position(index);
        let log_position = if count - index == 1 {
            event_position
        } else {
            event_position - self.header_len() as i64
        };
        let transaction_position = if self.transaction_position == self.log_position {
            log_position
        } else {
            self.transaction_position
        };

        Ok(PrepareRecord {
            log_position,
            flags: self.flags,
            transaction_position,
            transaction_offset: self.transaction_offset + index as i32,
            expected_version: self.expected_version + index as i64,
            stream_id: self.stream_id.clone(),
            timestamp: self.timestamp,
            correlation_id: self.correlation_id,
            events: self.events[index..].to_vec(),
        })
    }

    pub(crate) fn body_len(&self) -> usize {
        Self::FIXED_HEADER_LEN
            + self.stream_id.len()
            + self.events.iter().map(Event::encoded_len).sum::<usize>()
    }

    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.flags.bits());
        buf.put_i64_le(self.transaction_position);
        buf.put_i32_le(self.transaction_offset);
        buf.put_i64_le(self.expected_version);
        put_str(buf, &self.stream_id);
        put_timestamp(buf, &self.timestamp);
        buf.put_slice(self.correlation_id.as_bytes());
        buf.put_u16_le(self.events.len() as u16);
        for event in &self.events {
            event.encode(buf);
        }
    }

    pub(crate) fn decode_body(log_position: i64, buf: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(buf, 2 + 8 + 4 + 8)?;
        let flags = PrepareFlags::from_bits(buf.get_u16_le());
        let transaction_position = buf.get_i64_le();
        let transaction_offset = buf.get_i32_le();
        let expected_version = buf.get_i64_le();
        let stream_id = get_str(buf)?;
        let timestamp = get_timestamp(buf)?;
        let correlation_id = get_uuid(buf)?;
        ensure(buf, 2)?;
        let count = buf.get_u16_le() as usize;
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            events.push(Event::decode(buf)?);
        }
        Ok(Self {
            log_position,
            flags,
            transaction_position,
            transaction_offset,
            expected_version,
            stream_id,
            timestamp,
            correlation_id,
            events,
        })
    }
}

#[derive(Clone)]
pub struct PrepareBuilder {
    stream_id: String,
    flags: PrepareFlags,
    expected_version: i64,
    transaction: Option<(i64, i32)>,
    timestamp: Option<DateTime<Utc>>,
    correlation_id: Uuid,
    events: Vec<Event>,
}

impl PrepareBuilder {
    pub fn new(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_owned(),
            flags: PrepareFlags::SINGLE_WRITE,
            expected_version: NO_STREAM,
            transaction: None,
            timestamp: None,
            correlation_id: Uuid::new_v4(),
            events: vec![],
        }
    }

    /// A hard delete of `stream_id`: a single `$streamDeleted` event numbered `DELETED_STREAM`.
    pub fn tombstone(stream_id: &str) -> Self {
        Self::new(stream_id)
            .flags(PrepareFlags::SINGLE_WRITE | PrepareFlags::STREAM_DELETE)
            .expected_version(DELETED_STREAM - 1)
            .event(Event::new(STREAM_DELETED_EVENT_TYPE, Bytes::new()))
    }

    pub fn flags(mut self, flags: PrepareFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn expected_version(mut self, expected_version: i64) -> Self {
        self.expected_version = expected_version;
        self
    }

    /// Make the record part of the explicit transaction beginning at `position`.
    ///
    /// Such a record is not committed by itself; a commit record finalizes it.
    pub fn transaction(mut self, position: i64, offset: i32) -> Self {
        self.transaction = Some((position, offset));
        self.flags = self.flags.without(PrepareFlags::IS_COMMITTED);
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    pub fn events<I: IntoIterator<Item = Event>>(mut self, events: I) -> Self {
        self.events.extend(events);
        self
    }

    pub fn build(self, log_position: i64) -> Result<PrepareRecord, RecordError> {
        if self.events.is_empty() && self.flags.contains(PrepareFlags::DATA) {
            return Err(RecordError::RequiredFieldMissing("events"));
        }
        let (transaction_position, transaction_offset) =
            self.transaction.unwrap_or((log_position, 0));
        let prepare = PrepareRecord {
            log_position,
            flags: self.flags,
            transaction_position,
            transaction_offset,
            expected_version: self.expected_version,
            stream_id: self.stream_id,
            timestamp: truncate_to_millis(self.timestamp.unwrap_or_else(Utc::now)),
            correlation_id: self.correlation_id,
            events: self.events,
        };
        prepare.validate()?;
        Ok(prepare)
    }
}
