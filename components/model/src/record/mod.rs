//! Physical log records and their binary layout.
//!
//! Every record is framed the same way, regardless of its type:
//!
//! Record =>
//!   Length => u32, length of Type through Crc
//!   Type => u8
//!   Version => u8
//!   LogPosition => i64
//!   Body => type specific
//!   Crc => u32, CRC32 of Type through Body
//!   Length => u32, repeated so that a chunk can be read backwards
//!
//! All integers are little-endian.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::error::DecodeError;

use self::{commit::CommitRecord, prepare::PrepareRecord, system::SystemRecord};

pub mod commit;
pub mod prepare;
pub mod system;

pub const RECORD_VERSION: u8 = 1;

/// `Length`, `Type`, `Version` and `LogPosition`.
pub const FRAME_HEADER_LEN: usize = 4 + 1 + 1 + 8;

/// `Crc` and the trailing `Length`.
pub const FRAME_FOOTER_LEN: usize = 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RecordType {
    Prepare = 0,
    Commit = 1,
    System = 2,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Prepare(PrepareRecord),
    Commit(CommitRecord),
    System(SystemRecord),
}

impl LogRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            LogRecord::Prepare(_) => RecordType::Prepare,
            LogRecord::Commit(_) => RecordType::Commit,
            LogRecord::System(_) => RecordType::System,
        }
    }

    pub fn log_position(&self) -> i64 {
        match self {
            LogRecord::Prepare(prepare) => prepare.log_position,
            LogRecord::Commit(commit) => commit.log_position,
            LogRecord::System(system) => system.log_position,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LogRecord::Prepare(prepare) => prepare.timestamp,
            LogRecord::Commit(commit) => commit.timestamp,
            LogRecord::System(system) => system.timestamp,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            LogRecord::Prepare(prepare) => prepare.body_len(),
            LogRecord::Commit(_) => CommitRecord::BODY_LEN,
            LogRecord::System(system) => system.body_len(),
        }
    }

    /// Number of bytes the record occupies in a chunk.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body_len() + FRAME_FOOTER_LEN
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf.freeze()
    }

    pub fn encode_to(&self, buf: &mut BytesMut) {
        let length = (self.encoded_len() - 8) as u32;
        buf.put_u32_le(length);
        let checked_from = buf.len();
        buf.put_u8(self.record_type().into());
        buf.put_u8(RECORD_VERSION);
        buf.put_i64_le(self.log_position());
        match self {
            LogRecord::Prepare(prepare) => prepare.encode_body(buf),
            LogRecord::Commit(commit) => commit.encode_body(buf),
            LogRecord::System(system) => system.encode_body(buf),
        }
        let crc = crc32fast::hash(&buf[checked_from..]);
        buf.put_u32_le(crc);
        buf.put_u32_le(length);
    }

    /// Decode the record at the front of `buf`, advancing `buf` past it.
    ///
    /// Payloads of the decoded record share memory with `buf`.
    pub fn decode(buf: &mut Bytes) -> Result<LogRecord, DecodeError> {
        if buf.len() < 4 {
            return Err(DecodeError::DataLengthMismatch);
        }
        let length = (&buf[..4]).get_u32_le() as usize;
        if length < 1 + 1 + 8 + 4 || buf.len() < length + 8 {
            return Err(DecodeError::DataLengthMismatch);
        }

        let mut frame = buf.split_to(length + 8);
        frame.advance(4);
        let mut body = frame.split_to(length - 4);
        let expected = frame.get_u32_le();
        let actual = crc32fast::hash(&body);
        if expected != actual {
            return Err(DecodeError::ChecksumMismatch { expected, actual });
        }
        if frame.get_u32_le() as usize != length {
            return Err(DecodeError::DataLengthMismatch);
        }

        let record_type = body.get_u8();
        let version = body.get_u8();
        if version != RECORD_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let log_position = body.get_i64_le();
        let record = match RecordType::try_from(record_type)
            .map_err(|_| DecodeError::UnknownRecordType(record_type))?
        {
            RecordType::Prepare => {
                LogRecord::Prepare(PrepareRecord::decode_body(log_position, &mut body)?)
            }
            RecordType::Commit => {
                LogRecord::Commit(CommitRecord::decode_body(log_position, &mut body)?)
            }
            RecordType::System => {
                LogRecord::System(SystemRecord::decode_body(log_position, &mut body)?)
            }
        };

        if body.has_remaining() {
            return Err(DecodeError::DataLengthMismatch);
        }
        Ok(record)
    }
}

/// Drop the sub-millisecond part, which the layout does not carry.
pub fn truncate_to_millis(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(timestamp.timestamp_millis())
        .single()
        .unwrap_or(timestamp)
}

pub(crate) fn ensure(buf: &Bytes, len: usize) -> Result<(), DecodeError> {
    if buf.remaining() < len {
        return Err(DecodeError::DataLengthMismatch);
    }
    Ok(())
}

pub(crate) fn put_timestamp(buf: &mut BytesMut, timestamp: &DateTime<Utc>) {
    buf.put_i64_le(timestamp.timestamp_millis());
}

pub(crate) fn get_timestamp(buf: &mut Bytes) -> Result<DateTime<Utc>, DecodeError> {
    ensure(buf, 8)?;
    let millis = buf.get_i64_le();
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(DecodeError::InvalidTimestamp(millis))
}

pub(crate) fn get_uuid(buf: &mut Bytes) -> Result<Uuid, DecodeError> {
    ensure(buf, 16)?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

/// `value` must fit a u16 length, see [`PrepareRecord::validate`].
pub(crate) fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

pub(crate) fn get_str(buf: &mut Bytes) -> Result<String, DecodeError> {
    ensure(buf, 2)?;
    let len = buf.get_u16_le() as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidString)
}

pub(crate) fn put_blob(buf: &mut BytesMut, value: &Bytes) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

pub(crate) fn get_blob(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    ensure(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}
