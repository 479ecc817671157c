use bytes::{Bytes, BytesMut};
use model::LogRecord;
use uuid::Uuid;

use crate::error::ChunkError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_id: Uuid,

    /// First logical chunk number covered.
    pub chunk_start_number: u32,

    /// Last logical chunk number covered. Greater than `chunk_start_number` after a merge.
    pub chunk_end_number: u32,

    /// Logical size of one chunk number.
    pub chunk_size: u64,

    /// Scavenged chunks are no longer contiguous in log positions and address
    /// records through a position map.
    pub is_scavenged: bool,
}

impl ChunkHeader {
    pub fn start_position(&self) -> i64 {
        self.chunk_start_number as i64 * self.chunk_size as i64
    }

    /// Exclusive.
    pub fn end_position(&self) -> i64 {
        (self.chunk_end_number as i64 + 1) * self.chunk_size as i64
    }
}

/// Maps the log position of a record of a scavenged chunk to its physical offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosMap {
    pub log_position: i64,
    pub actual_position: u32,
}

/// A record as stored in a chunk.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub record: LogRecord,

    /// Encoded bytes of the record, exactly as in the chunk.
    pub raw: Bytes,
}

/// A sealed chunk. Immutable; scavenging replaces it with a new chunk.
#[derive(Debug)]
pub struct Chunk {
    header: ChunkHeader,
    data: Bytes,
    pos_map: Vec<PosMap>,
}

impl Chunk {
    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn start_number(&self) -> u32 {
        self.header.chunk_start_number
    }

    pub fn end_number(&self) -> u32 {
        self.header.chunk_end_number
    }

    pub fn is_scavenged(&self) -> bool {
        self.header.is_scavenged
    }

    pub fn contains_position(&self, log_position: i64) -> bool {
        log_position >= self.header.start_position() && log_position < self.header.end_position()
    }

    /// Bytes of records held.
    pub fn physical_data_size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn pos_map(&self) -> &[PosMap] {
        &self.pos_map
    }

    pub fn records(&self) -> ChunkRecords {
        ChunkRecords {
            data: self.data.clone(),
            offset: 0,
        }
    }

    /// Read the record starting at `log_position`.
    pub fn read(&self, log_position: i64) -> Result<Option<LogRecord>, ChunkError> {
        if !self.contains_position(log_position) {
            return Ok(None);
        }
        let offset = if self.header.is_scavenged {
            match self
                .pos_map
                .binary_search_by_key(&log_position, |entry| entry.log_position)
            {
                Ok(index) => self.pos_map[index].actual_position as usize,
                Err(_) => return Ok(None),
            }
        } else {
            (log_position - self.header.start_position()) as usize
        };
        if offset >= self.data.len() {
            return Ok(None);
        }
        let mut buf = self.data.slice(offset..);
        LogRecord::decode(&mut buf)
            .map(Some)
            .map_err(|source| ChunkError::Decode { offset, source })
    }
}

pub struct ChunkRecords {
    data: Bytes,
    offset: usize,
}

impl Iterator for ChunkRecords {
    type Item = Result<ChunkRecord, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let offset = self.offset;
        let before = self.data.len();
        let mut buf = self.data.clone();
        match LogRecord::decode(&mut buf) {
            Ok(record) => {
                let len = before - buf.len();
                let raw = self.data.split_to(len);
                self.offset += len;
                Some(Ok(ChunkRecord { record, raw }))
            }
            Err(source) => {
                // Stop after a corrupted record.
                self.data = Bytes::new();
                Some(Err(ChunkError::Decode { offset, source }))
            }
        }
    }
}

/// Accumulates records into a new chunk.
pub struct ChunkBuilder {
    header: ChunkHeader,
    data: BytesMut,
    pos_map: Vec<PosMap>,
}

impl ChunkBuilder {
    pub fn new(
        chunk_start_number: u32,
        chunk_end_number: u32,
        chunk_size: u64,
        is_scavenged: bool,
    ) -> Self {
        Self {
            header: ChunkHeader {
                chunk_id: Uuid::new_v4(),
                chunk_start_number,
                chunk_end_number,
                chunk_size,
                is_scavenged,
            },
            data: BytesMut::new(),
            pos_map: vec![],
        }
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn physical_data_size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<(), ChunkError> {
        if let LogRecord::Prepare(prepare) = record {
            prepare.validate()?;
        }
        self.track(record.log_position())?;
        record.encode_to(&mut self.data);
        Ok(())
    }

    /// Append a record already encoded, e.g. one copied from another chunk.
    pub fn append_raw(&mut self, log_position: i64, raw: &Bytes) -> Result<(), ChunkError> {
        self.track(log_position)?;
        self.data.extend_from_slice(raw);
        Ok(())
    }

    fn track(&mut self, log_position: i64) -> Result<(), ChunkError> {
        if log_position < self.header.start_position()
            || log_position >= self.header.end_position()
        {
            return Err(ChunkError::Internal(format!(
                "Log position {} is out of chunk #{}-{}",
                log_position, self.header.chunk_start_number, self.header.chunk_end_number
            )));
        }
        if let Some(last) = self.pos_map.last() {
            if last.log_position >= log_position {
                return Err(ChunkError::Internal(format!(
                    "Log position {} does not increase, last: {}",
                    log_position, last.log_position
                )));
            }
        }
        if self.header.is_scavenged {
            self.pos_map.push(PosMap {
                log_position,
                actual_position: self.data.len() as u32,
            });
        } else if self.header.start_position() + self.data.len() as i64 != log_position {
            return Err(ChunkError::Internal(format!(
                "Log position {} is not contiguous in unscavenged chunk",
                log_position
            )));
        }
        Ok(())
    }

    pub fn complete(self) -> Chunk {
        Chunk {
            header: self.header,
            data: self.data.freeze(),
            pos_map: self.pos_map,
        }
    }
}
