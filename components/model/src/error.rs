use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("The length of the record does not match the length of the data")]
    DataLengthMismatch,

    #[error("Unknown record type `{0}`")]
    UnknownRecordType(u8),

    #[error("Unsupported record version `{0}`")]
    UnsupportedVersion(u8),

    #[error("Checksum mismatch, expected: {expected}, actual: {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Timestamp `{0}` is out of range")]
    InvalidTimestamp(i64),

    #[error("Stream id or event type is not valid UTF-8")]
    InvalidString,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Required record field is missing: {0}")]
    RequiredFieldMissing(&'static str),

    #[error("Event index {index} is out of range, the record carries {count} events")]
    EventIndexOutOfRange { index: usize, count: usize },

    #[error("A record carries at most {max} events")]
    TooManyEvents { max: usize },

    #[error("Field `{field}` is {len} bytes long, at most {max} fit")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}
