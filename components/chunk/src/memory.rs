use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use log::{debug, info};
use model::{
    record::truncate_to_millis, CommitRecord, LogRecord, PrepareBuilder, PrepareFlags,
    PrepareRecord, SystemRecord,
};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::{
    chunk::{Chunk, ChunkBuilder},
    error::ChunkError,
    index::StreamIndex,
    manager::ChunkManager,
};

/// Events of a transaction prepare awaiting their commit.
struct PendingPrepare {
    stream_id: String,
    transaction_offset: i32,
    event_positions: Vec<i64>,
}

struct Writer {
    checkpoint: i64,
    active: ChunkBuilder,
    pending: FxHashMap<i64, Vec<PendingPrepare>>,
}

/// A chunked log kept in memory.
///
/// Records are appended to the active chunk; a chunk is completed when the next record
/// does not fit, or on [`MemoryChunkDb::complete_chunk`]. Only completed chunks are
/// visible through [`ChunkManager`].
pub struct MemoryChunkDb {
    chunk_size: u64,
    chunks: RwLock<BTreeMap<u32, Arc<Chunk>>>,
    writer: Mutex<Writer>,
    index: Arc<StreamIndex>,
}

impl MemoryChunkDb {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            chunks: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(Writer {
                checkpoint: 0,
                active: ChunkBuilder::new(0, 0, chunk_size, false),
                pending: FxHashMap::default(),
            }),
            index: Arc::new(StreamIndex::default()),
        }
    }

    /// Index of committed events.
    pub fn index(&self) -> Arc<StreamIndex> {
        Arc::clone(&self.index)
    }

    /// Append the record produced by `build` for the log position it will occupy.
    ///
    /// `build` is invoked again with the start of the next chunk if the record does not
    /// fit into the active chunk.
    pub fn append<F>(&self, mut build: F) -> Result<LogRecord, ChunkError>
    where
        F: FnMut(i64) -> Result<LogRecord, ChunkError>,
    {
        let mut writer = self.writer.lock();
        let mut record = build(writer.checkpoint)?;
        let len = record.encoded_len() as u64;
        if len > self.chunk_size {
            return Err(ChunkError::RecordTooLarge(len));
        }
        if writer.active.header().end_position() - writer.checkpoint < len as i64 {
            self.complete_active(&mut writer);
            record = build(writer.checkpoint)?;
        }
        writer.active.append(&record)?;
        writer.checkpoint += record.encoded_len() as i64;
        self.index_record(&mut writer, &record);
        Ok(record)
    }

    pub fn write_prepare(&self, builder: PrepareBuilder) -> Result<PrepareRecord, ChunkError> {
        let record = self.append(|log_position| {
            Ok(LogRecord::Prepare(builder.clone().build(log_position)?))
        })?;
        match record {
            LogRecord::Prepare(prepare) => Ok(prepare),
            _ => Err(ChunkError::Internal("Prepare expected".to_owned())),
        }
    }

    /// Write the prepare built by `builder` followed by its commit, the way a writer
    /// finalizes a single-record transaction.
    pub fn write_committed(
        &self,
        builder: PrepareBuilder,
    ) -> Result<(PrepareRecord, CommitRecord), ChunkError> {
        let template = builder.clone().build(0)?;
        let prepare =
            self.write_prepare(builder.flags(template.flags.without(PrepareFlags::IS_COMMITTED)))?;
        let commit = self.write_commit(prepare.log_position, template.expected_version + 1)?;
        Ok((prepare, commit))
    }

    pub fn write_commit(
        &self,
        transaction_position: i64,
        first_event_number: i64,
    ) -> Result<CommitRecord, ChunkError> {
        let correlation_id = Uuid::new_v4();
        let timestamp = truncate_to_millis(chrono::Utc::now());
        let record = self.append(|log_position| {
            Ok(LogRecord::Commit(CommitRecord {
                log_position,
                transaction_position,
                first_event_number,
                sort_key: 0,
                correlation_id,
                timestamp,
            }))
        })?;
        match record {
            LogRecord::Commit(commit) => Ok(commit),
            _ => Err(ChunkError::Internal("Commit expected".to_owned())),
        }
    }

    pub fn write_system(&self, kind: u8, data: Bytes) -> Result<SystemRecord, ChunkError> {
        let timestamp = truncate_to_millis(chrono::Utc::now());
        let record = self.append(|log_position| {
            Ok(LogRecord::System(SystemRecord {
                log_position,
                timestamp,
                kind,
                data: data.clone(),
            }))
        })?;
        match record {
            LogRecord::System(system) => Ok(system),
            _ => Err(ChunkError::Internal("System record expected".to_owned())),
        }
    }

    /// Seal the active chunk, even if it is not full, and start the next one.
    pub fn complete_chunk(&self) {
        let mut writer = self.writer.lock();
        self.complete_active(&mut writer);
    }

    fn complete_active(&self, writer: &mut Writer) {
        let next = writer.active.header().chunk_end_number + 1;
        let active = std::mem::replace(
            &mut writer.active,
            ChunkBuilder::new(next, next, self.chunk_size, false),
        );
        let chunk = active.complete();
        debug!(
            "Chunk #{} completed with {} bytes",
            chunk.start_number(),
            chunk.physical_data_size()
        );
        self.chunks.write().insert(chunk.start_number(), Arc::new(chunk));
        writer.checkpoint = next as i64 * self.chunk_size as i64;
    }

    fn index_record(&self, writer: &mut Writer, record: &LogRecord) {
        match record {
            LogRecord::Prepare(prepare) if prepare.is_committed() => {
                for i in 0..prepare.events.len() {
                    self.index.add(
                        &prepare.stream_id,
                        prepare.first_event_number() + i as i64,
                        prepare.event_log_position(i),
                    );
                }
            }
            LogRecord::Prepare(prepare) if !prepare.events.is_empty() => {
                writer
                    .pending
                    .entry(prepare.transaction_position)
                    .or_default()
                    .push(PendingPrepare {
                        stream_id: prepare.stream_id.clone(),
                        transaction_offset: prepare.transaction_offset,
                        event_positions: (0..prepare.events.len())
                            .map(|i| prepare.event_log_position(i))
                            .collect(),
                    });
            }
            LogRecord::Commit(commit) => {
                if let Some(prepares) = writer.pending.remove(&commit.transaction_position) {
                    for prepare in prepares {
                        let first = commit.first_event_number + prepare.transaction_offset as i64;
                        for (i, position) in prepare.event_positions.iter().enumerate() {
                            self.index.add(&prepare.stream_id, first + i as i64, *position);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

impl ChunkManager for MemoryChunkDb {
    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn writer_checkpoint(&self) -> i64 {
        self.writer.lock().checkpoint
    }

    fn completed_chunk(&self, logical_chunk_number: u32) -> Option<Arc<Chunk>> {
        let chunks = self.chunks.read();
        chunks
            .range(..=logical_chunk_number)
            .next_back()
            .filter(|(_, chunk)| chunk.end_number() >= logical_chunk_number)
            .map(|(_, chunk)| Arc::clone(chunk))
    }

    fn completed_chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.read().values().cloned().collect()
    }

    fn switch_in(&self, chunk: Chunk) -> Result<Vec<Arc<Chunk>>, ChunkError> {
        let start = chunk.start_number();
        let end = chunk.end_number();
        let mut chunks = self.chunks.write();

        let covered: Vec<u32> = chunks.range(start..=end).map(|(number, _)| *number).collect();
        let lines_up = chunks.get(&start).is_some()
            && covered
                .last()
                .and_then(|last| chunks.get(last))
                .map_or(false, |last| last.end_number() == end);
        if !lines_up {
            return Err(ChunkError::RangeMismatch { start, end });
        }

        let replaced: Vec<_> = covered
            .iter()
            .filter_map(|number| chunks.remove(number))
            .collect();
        info!(
            "Switched in chunk #{}-{}, replacing {} chunk(s)",
            start,
            end,
            replaced.len()
        );
        chunks.insert(start, Arc::new(chunk));
        Ok(replaced)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use model::{Event, LogRecord, PrepareBuilder};

    use super::MemoryChunkDb;
    use crate::{chunk::ChunkBuilder, error::ChunkError, manager::ChunkManager};

    fn event() -> Event {
        Event::new("e", Bytes::from(vec![1u8; 100]))
    }

    #[test]
    fn test_append_rolls_over_chunks() {
        ulog::try_init_log();
        let db = MemoryChunkDb::new(1024);
        let mut positions = vec![];
        for i in 0..12 {
            let prepare = db
                .write_prepare(PrepareBuilder::new("a").expected_version(i - 1).event(event()))
                .unwrap();
            positions.push(prepare.log_position);
        }
        assert!(db.completed_chunks().len() >= 2);
        for chunk in db.completed_chunks() {
            for record in chunk.records() {
                let record = record.unwrap();
                assert!(chunk.contains_position(record.record.log_position()));
            }
        }
        assert!(db.completed_chunk(0).is_some());
        let last = *positions.last().unwrap();
        assert!(db.writer_checkpoint() > last);
        assert_eq!(Some(11), db.index().last_event_number("a", i64::MAX));
    }

    #[test]
    fn test_active_chunk_is_not_completed() {
        let db = MemoryChunkDb::new(4096);
        db.write_prepare(PrepareBuilder::new("a").event(event())).unwrap();
        assert!(db.completed_chunk(0).is_none());
        db.complete_chunk();
        assert!(db.completed_chunk(0).is_some());
        assert_eq!(4096, db.writer_checkpoint());
        assert!(db.completed_chunk(1).is_none());
    }

    #[test]
    fn test_transaction_indexed_on_commit() {
        let db = MemoryChunkDb::new(4096);
        let begin = db
            .write_prepare(PrepareBuilder::new("a").transaction(0, 0).event(event()))
            .unwrap();
        db.write_prepare(
            PrepareBuilder::new("a")
                .transaction(begin.log_position, 1)
                .event(event())
                .event(event()),
        )
        .unwrap();
        assert_eq!(None, db.index().last_event_number("a", i64::MAX));
        db.write_commit(begin.log_position, 5).unwrap();
        assert_eq!(Some(7), db.index().last_event_number("a", i64::MAX));
    }

    #[test]
    fn test_write_committed() {
        let db = MemoryChunkDb::new(4096);
        let (prepare, commit) = db
            .write_committed(PrepareBuilder::new("a").expected_version(2).event(event()))
            .unwrap();
        assert!(!prepare.is_committed());
        assert_eq!(prepare.log_position, commit.transaction_position);
        assert_eq!(3, commit.first_event_number);
        assert_eq!(Some(3), db.index().last_event_number("a", i64::MAX));
    }

    #[test]
    fn test_record_too_large() {
        let db = MemoryChunkDb::new(128);
        assert!(matches!(
            db.write_prepare(PrepareBuilder::new("a").event(event())),
            Err(ChunkError::RecordTooLarge(_))
        ));
    }

    #[test]
    fn test_switch_in() {
        let db = MemoryChunkDb::new(1024);
        for _ in 0..3 {
            db.write_prepare(PrepareBuilder::new("a").event(event())).unwrap();
            db.complete_chunk();
        }

        let mut merged = ChunkBuilder::new(0, 1, 1024, true);
        for number in 0..2 {
            let chunk = db.completed_chunk(number).unwrap();
            for record in chunk.records() {
                let record = record.unwrap();
                merged
                    .append_raw(record.record.log_position(), &record.raw)
                    .unwrap();
            }
        }
        let replaced = db.switch_in(merged.complete()).unwrap();
        assert_eq!(2, replaced.len());
        assert_eq!(2, db.completed_chunks().len());
        let chunk = db.completed_chunk(1).unwrap();
        assert_eq!(0, chunk.start_number());
        assert!(matches!(chunk.read(1024).unwrap(), Some(LogRecord::Prepare(_))));

        // Only whole chunks can be replaced.
        let partial = ChunkBuilder::new(1, 2, 1024, true);
        assert!(matches!(
            db.switch_in(partial.complete()),
            Err(ChunkError::RangeMismatch { start: 1, end: 2 })
        ));
    }
}
