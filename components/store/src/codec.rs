//! Binary encoding of map keys and values.
//!
//! Integer keys are big-endian so that bytewise order equals numeric order; values are
//! little-endian like the log records.
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use model::scavenge::{
    CalculationStatus, ChunkTimeStampRange, DiscardPoint, MetastreamData, OriginalStreamData,
    ScavengeCheckpoint, ScavengePoint, StreamHandle, Unit,
};

use crate::error::MapError;

pub trait Codec: Sized {
    fn encode(&self, buf: &mut BytesMut);

    fn decode(buf: &mut Bytes) -> Result<Self, MapError>;

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    fn from_bytes(mut buf: Bytes) -> Result<Self, MapError> {
        let value = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(MapError::Codec(format!(
                "{} trailing bytes",
                buf.remaining()
            )));
        }
        Ok(value)
    }
}

fn ensure(buf: &Bytes, len: usize, what: &str) -> Result<(), MapError> {
    if buf.remaining() < len {
        return Err(MapError::Codec(what.to_owned()));
    }
    Ok(())
}

impl Codec for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(*self);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, MapError> {
        ensure(buf, 8, "u64")?;
        Ok(buf.get_u64())
    }
}

impl Codec for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(*self);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, MapError> {
        ensure(buf, 4, "u32")?;
        Ok(buf.get_u32())
    }
}

impl Codec for f32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_f32_le(*self);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, MapError> {
        ensure(buf, 4, "f32")?;
        Ok(buf.get_f32_le())
    }
}

/// The whole buffer, so strings are only usable as the last field.
impl Codec for String {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.as_bytes());
    }

    fn decode(buf: &mut Bytes) -> Result<Self, MapError> {
        let raw = buf.split_to(buf.len());
        String::from_utf8(raw.to_vec()).map_err(|_| MapError::Codec("string".to_owned()))
    }
}

impl Codec for Unit {
    fn encode(&self, _buf: &mut BytesMut) {}

    fn decode(_buf: &mut Bytes) -> Result<Self, MapError> {
        Ok(Unit)
    }
}

fn put_option_i64(buf: &mut BytesMut, value: Option<i64>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            buf.put_i64_le(value);
        }
        None => buf.put_u8(0),
    }
}

fn get_option_i64(buf: &mut Bytes) -> Result<Option<i64>, MapError> {
    ensure(buf, 1, "option")?;
    match buf.get_u8() {
        0 => Ok(None),
        _ => {
            ensure(buf, 8, "option")?;
            Ok(Some(buf.get_i64_le()))
        }
    }
}

fn put_timestamp(buf: &mut BytesMut, timestamp: &DateTime<Utc>) {
    buf.put_i64_le(timestamp.timestamp_millis());
}

fn get_timestamp(buf: &mut Bytes) -> Result<DateTime<Utc>, MapError> {
    ensure(buf, 8, "timestamp")?;
    let millis = buf.get_i64_le();
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| MapError::Codec(format!("timestamp {}", millis)))
}

fn get_discard_point(buf: &mut Bytes) -> Result<DiscardPoint, MapError> {
    ensure(buf, 8, "discard point")?;
    Ok(DiscardPoint::discard_before(buf.get_i64_le()))
}

impl Codec for OriginalStreamData {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.is_tombstoned as u8);
        put_option_i64(buf, self.max_age.map(|age| age.as_millis() as i64));
        put_option_i64(buf, self.max_count);
        put_option_i64(buf, self.truncate_before);
        buf.put_i64_le(self.discard_point.first_event_number_to_keep());
        buf.put_i64_le(self.maybe_discard_point.first_event_number_to_keep());
        buf.put_u8(self.status.into());
    }

    fn decode(buf: &mut Bytes) -> Result<Self, MapError> {
        ensure(buf, 1, "original stream data")?;
        let is_tombstoned = buf.get_u8() != 0;
        let max_age = get_option_i64(buf)?.map(|millis| Duration::from_millis(millis as u64));
        let max_count = get_option_i64(buf)?;
        let truncate_before = get_option_i64(buf)?;
        let discard_point = get_discard_point(buf)?;
        let maybe_discard_point = get_discard_point(buf)?;
        ensure(buf, 1, "calculation status")?;
        let status = buf.get_u8();
        let status = CalculationStatus::try_from(status)
            .map_err(|_| MapError::Codec(format!("calculation status {}", status)))?;
        Ok(Self {
            is_tombstoned,
            max_age,
            max_count,
            truncate_before,
            discard_point,
            maybe_discard_point,
            status,
        })
    }
}

impl Codec for MetastreamData {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.is_tombstoned as u8);
        buf.put_i64_le(self.discard_point.first_event_number_to_keep());
    }

    fn decode(buf: &mut Bytes) -> Result<Self, MapError> {
        ensure(buf, 1, "metastream data")?;
        let is_tombstoned = buf.get_u8() != 0;
        Ok(Self {
            is_tombstoned,
            discard_point: get_discard_point(buf)?,
        })
    }
}

impl Codec for ChunkTimeStampRange {
    fn encode(&self, buf: &mut BytesMut) {
        put_timestamp(buf, &self.min);
        put_timestamp(buf, &self.max);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, MapError> {
        Ok(Self {
            min: get_timestamp(buf)?,
            max: get_timestamp(buf)?,
        })
    }
}

impl Codec for ScavengePoint {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.number);
        buf.put_i64_le(self.position);
        put_timestamp(buf, &self.effective_now);
        buf.put_f32_le(self.threshold);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, MapError> {
        ensure(buf, 16, "scavenge point")?;
        let number = buf.get_u64_le();
        let position = buf.get_i64_le();
        let effective_now = get_timestamp(buf)?;
        ensure(buf, 4, "scavenge point")?;
        Ok(Self {
            number,
            position,
            effective_now,
            threshold: buf.get_f32_le(),
        })
    }
}

fn put_option_u32(buf: &mut BytesMut, value: Option<u32>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            buf.put_u32_le(value);
        }
        None => buf.put_u8(0),
    }
}

fn get_option_u32(buf: &mut Bytes) -> Result<Option<u32>, MapError> {
    ensure(buf, 1, "option")?;
    match buf.get_u8() {
        0 => Ok(None),
        _ => {
            ensure(buf, 4, "option")?;
            Ok(Some(buf.get_u32_le()))
        }
    }
}

fn get_u32(buf: &mut Bytes) -> Result<u32, MapError> {
    ensure(buf, 4, "u32")?;
    Ok(buf.get_u32_le())
}

fn put_option_handle(buf: &mut BytesMut, handle: Option<&StreamHandle>) {
    match handle {
        None => buf.put_u8(0),
        Some(StreamHandle::Hash(hash)) => {
            buf.put_u8(1);
            buf.put_u64_le(*hash);
        }
        Some(StreamHandle::Exact(stream_id)) => {
            buf.put_u8(2);
            buf.put_u32_le(stream_id.len() as u32);
            buf.put_slice(stream_id.as_bytes());
        }
    }
}

fn get_option_handle(buf: &mut Bytes) -> Result<Option<StreamHandle>, MapError> {
    ensure(buf, 1, "stream handle")?;
    match buf.get_u8() {
        0 => Ok(None),
        1 => {
            ensure(buf, 8, "stream handle")?;
            Ok(Some(StreamHandle::Hash(buf.get_u64_le())))
        }
        2 => {
            ensure(buf, 4, "stream handle")?;
            let len = buf.get_u32_le() as usize;
            ensure(buf, len, "stream handle")?;
            let mut raw = buf.split_to(len);
            Ok(Some(StreamHandle::Exact(String::decode(&mut raw)?)))
        }
        tag => Err(MapError::Codec(format!("stream handle tag {}", tag))),
    }
}

impl Codec for ScavengeCheckpoint {
    fn encode(&self, buf: &mut BytesMut) {
        let tag = match self {
            ScavengeCheckpoint::Accumulating { .. } => 0,
            ScavengeCheckpoint::Calculating { .. } => 1,
            ScavengeCheckpoint::ExecutingChunks { .. } => 2,
            ScavengeCheckpoint::MergingChunks { .. } => 3,
            ScavengeCheckpoint::ExecutingIndex { .. } => 4,
            ScavengeCheckpoint::Cleaning { .. } => 5,
            ScavengeCheckpoint::Done { .. } => 6,
        };
        buf.put_u8(tag);
        self.scavenge_point().encode(buf);
        match self {
            ScavengeCheckpoint::Accumulating {
                done_logical_chunk_number,
                ..
            }
            | ScavengeCheckpoint::ExecutingChunks {
                done_logical_chunk_number,
                ..
            } => put_option_u32(buf, *done_logical_chunk_number),
            ScavengeCheckpoint::Calculating {
                done_stream_handle, ..
            } => put_option_handle(buf, done_stream_handle.as_ref()),
            _ => {}
        }
        if let ScavengeCheckpoint::ExecutingChunks { chunks_failed, .. }
        | ScavengeCheckpoint::MergingChunks { chunks_failed, .. }
        | ScavengeCheckpoint::ExecutingIndex { chunks_failed, .. }
        | ScavengeCheckpoint::Cleaning { chunks_failed, .. } = self
        {
            buf.put_u32_le(*chunks_failed);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, MapError> {
        ensure(buf, 1, "checkpoint")?;
        let tag = buf.get_u8();
        let scavenge_point = ScavengePoint::decode(buf)?;
        let checkpoint = match tag {
            0 => ScavengeCheckpoint::Accumulating {
                scavenge_point,
                done_logical_chunk_number: get_option_u32(buf)?,
            },
            1 => ScavengeCheckpoint::Calculating {
                scavenge_point,
                done_stream_handle: get_option_handle(buf)?,
            },
            2 => ScavengeCheckpoint::ExecutingChunks {
                scavenge_point,
                done_logical_chunk_number: get_option_u32(buf)?,
                chunks_failed: get_u32(buf)?,
            },
            3 => ScavengeCheckpoint::MergingChunks {
                scavenge_point,
                chunks_failed: get_u32(buf)?,
            },
            4 => ScavengeCheckpoint::ExecutingIndex {
                scavenge_point,
                chunks_failed: get_u32(buf)?,
            },
            5 => ScavengeCheckpoint::Cleaning {
                scavenge_point,
                chunks_failed: get_u32(buf)?,
            },
            6 => ScavengeCheckpoint::Done { scavenge_point },
            tag => return Err(MapError::Codec(format!("checkpoint tag {}", tag))),
        };
        Ok(checkpoint)
    }
}
