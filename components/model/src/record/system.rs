use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::error::DecodeError;

use super::{ensure, get_blob, get_timestamp, put_blob, put_timestamp};

/// Log bookkeeping unrelated to any stream, e.g. epochs. Never scavenged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemRecord {
    pub log_position: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: u8,
    pub data: Bytes,
}

impl SystemRecord {
    pub(crate) fn body_len(&self) -> usize {
        8 + 1 + 4 + self.data.len()
    }

    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        put_timestamp(buf, &self.timestamp);
        buf.put_u8(self.kind);
        put_blob(buf, &self.data);
    }

    pub(crate) fn decode_body(log_position: i64, buf: &mut Bytes) -> Result<Self, DecodeError> {
        let timestamp = get_timestamp(buf)?;
        ensure(buf, 1)?;
        let kind = buf.get_u8();
        Ok(Self {
            log_position,
            timestamp,
            kind,
            data: get_blob(buf)?,
        })
    }
}
