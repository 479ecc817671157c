use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DecodeError;

use super::{ensure, get_timestamp, get_uuid, put_timestamp};

/// Finalizes the transaction whose first prepare lives at `transaction_position`.
///
/// Commit body =>
///   TransactionPosition => i64
///   FirstEventNumber => i64
///   SortKey => i64
///   CorrelationId => [u8; 16]
///   Timestamp => i64
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub log_position: i64,
    pub transaction_position: i64,
    pub first_event_number: i64,
    pub sort_key: i64,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl CommitRecord {
    pub(crate) const BODY_LEN: usize = 8 + 8 + 8 + 16 + 8;

    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.transaction_position);
        buf.put_i64_le(self.first_event_number);
        buf.put_i64_le(self.sort_key);
        buf.put_slice(self.correlation_id.as_bytes());
        put_timestamp(buf, &self.timestamp);
    }

    pub(crate) fn decode_body(log_position: i64, buf: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(buf, 8 * 3)?;
        let transaction_position = buf.get_i64_le();
        let first_event_number = buf.get_i64_le();
        let sort_key = buf.get_i64_le();
        Ok(Self {
            log_position,
            transaction_position,
            first_event_number,
            sort_key,
            correlation_id: get_uuid(buf)?,
            timestamp: get_timestamp(buf)?,
        })
    }
}
