use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use chunk::ChunkManager;
use config::{Backend, Configuration};
use log::{debug, error, info, warn};
use model::{
    record::truncate_to_millis,
    scavenge::{ScavengeCheckpoint, ScavengePoint},
};
use store::ScavengeStore;
use tokio_util::sync::CancellationToken;

use crate::{
    accumulator::Accumulator,
    calculator::Calculator,
    cleaner::Cleaner,
    clock::{Clock, SystemClock},
    error::ScavengeError,
    executor::{ChunkExecutor, IndexEntryFilter},
    hash::{LongHasher, XxHasher},
    index::{IndexReader, IndexScavenger},
    merger::ChunkMerger,
    notification::{ScavengeListener, ScavengeResult, ScavengerLog},
    state::ScavengeState,
    status::{ScavengeStatus, StatusTracker},
};

/// Options of a single scavenge.
#[derive(Debug, Clone, Default)]
pub struct ScavengeOptions {
    /// Switch in rewritten chunks even when they are not smaller.
    pub always_keep_scavenged: bool,

    pub merge_chunks: bool,

    /// First logical chunk to execute. Execution never goes back before the checkpoint.
    pub start_from_chunk: Option<u32>,

    /// Overrides the configured execution threshold of a new scavenge point.
    pub threshold: Option<f32>,
}

/// Open the scavenge state configured in `config`.
pub fn open_store(config: &Configuration) -> Result<Arc<ScavengeStore>, ScavengeError> {
    match config.state.backend {
        Backend::Memory => Ok(Arc::new(ScavengeStore::memory())),
        #[cfg(feature = "rocksdb")]
        Backend::RocksDB => Ok(Arc::new(ScavengeStore::rocksdb(config.state.path())?)),
        #[cfg(not(feature = "rocksdb"))]
        Backend::RocksDB => Err(ScavengeError::Internal(
            "RocksDB backend is not compiled in".to_owned(),
        )),
    }
}

/// Runs scavenges: accumulate, calculate, execute chunks, merge, execute the index,
/// clean. Progress is checkpointed, so an interrupted scavenge resumes where it stopped.
pub struct Scavenger {
    config: Configuration,
    store: Arc<ScavengeStore>,
    state: ScavengeState,
    chunk_manager: Arc<dyn ChunkManager>,
    index_reader: Arc<dyn IndexReader>,
    index_scavenger: Arc<dyn IndexScavenger>,
    status: Arc<dyn StatusTracker>,
    listener: Arc<dyn ScavengeListener>,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
}

/// Marks a scavenge as running until dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Result<Self, ScavengeError> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ScavengeError::AlreadyRunning)?;
        Ok(Self(running))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scavenger {
    pub fn new(
        config: &Configuration,
        store: Arc<ScavengeStore>,
        chunk_manager: Arc<dyn ChunkManager>,
        index_reader: Arc<dyn IndexReader>,
        index_scavenger: Arc<dyn IndexScavenger>,
        status: Arc<dyn StatusTracker>,
        listener: Arc<dyn ScavengeListener>,
    ) -> Result<Self, ScavengeError> {
        let state = ScavengeState::new(
            Arc::clone(&store),
            Arc::new(XxHasher),
            config.scavenge.hash_users_cache_capacity,
        )?;
        status.set_status(ScavengeStatus::Idle);
        Ok(Self {
            config: config.clone(),
            store,
            state,
            chunk_manager,
            index_reader,
            index_scavenger,
            status,
            listener,
            clock: Arc::new(SystemClock),
            running: AtomicBool::new(false),
        })
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn LongHasher>) -> Result<Self, ScavengeError> {
        self.state = ScavengeState::new(
            Arc::clone(&self.store),
            hasher,
            self.config.scavenge.hash_users_cache_capacity,
        )?;
        Ok(self)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> &ScavengeState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run a scavenge to completion, cancellation or failure.
    ///
    /// Fails only with [`ScavengeError::AlreadyRunning`] if another scavenge is in
    /// progress, in which case nothing is touched. Errors of the scavenge itself are
    /// logged, reported to the listener and reflected in the result.
    pub fn scavenge(
        &self,
        options: &ScavengeOptions,
        token: &CancellationToken,
    ) -> Result<ScavengeResult, ScavengeError> {
        let _running = RunningGuard::acquire(&self.running).map_err(|e| {
            warn!("Refuse to start a scavenge: another one is running");
            e
        })?;
        let started = Instant::now();
        let log = ScavengerLog::new(Arc::clone(&self.listener));

        if token.is_cancelled() {
            info!("Scavenge {} is cancelled before start", log.scavenge_id());
            log.started();
            self.status.set_status(ScavengeStatus::Stopped);
            log.completed(ScavengeResult::Stopped, None, started.elapsed());
            return Ok(ScavengeResult::Stopped);
        }

        log.started();
        let (result, error) = match self.run(options, &log, token) {
            Ok(()) if log.chunks_failed() > 0 => (
                ScavengeResult::Failed,
                Some(format!("{} chunk(s) failed", log.chunks_failed())),
            ),
            Ok(()) => (ScavengeResult::Success, None),
            Err(ScavengeError::Cancelled) => {
                info!("Scavenge {} is stopped", log.scavenge_id());
                (ScavengeResult::Stopped, None)
            }
            Err(e) => {
                error!("Scavenge {} failed: {}", log.scavenge_id(), e);
                (ScavengeResult::Failed, Some(e.to_string()))
            }
        };

        if let Err(e) = self.state.rollback() {
            error!("Failed to roll back scavenge state: {}", e);
        }
        self.status.set_status(match result {
            ScavengeResult::Success => ScavengeStatus::Done,
            ScavengeResult::Stopped => ScavengeStatus::Stopped,
            ScavengeResult::Failed => ScavengeStatus::Failed,
        });
        log.completed(result, error, started.elapsed());
        Ok(result)
    }

    fn run(
        &self,
        options: &ScavengeOptions,
        log: &ScavengerLog,
        token: &CancellationToken,
    ) -> Result<(), ScavengeError> {
        let mut checkpoint = match self.state.read_checkpoint()? {
            Some(checkpoint) if !checkpoint.is_done() => {
                info!("Continue scavenge from {:?}", checkpoint);
                log.restore_failures(checkpoint.chunks_failed());
                checkpoint
            }
            previous => {
                let previous = previous.map(|checkpoint| checkpoint.scavenge_point().clone());
                let checkpoint = self.start_new(previous.as_ref(), options);
                self.state.set_checkpoint(&checkpoint)?;
                checkpoint
            }
        };

        let collisions = self.state.resolver().collisions()?;
        debug!("{} known collisions: {:?}", collisions.len(), collisions);
        self.state.resolver().start_pass();

        loop {
            if token.is_cancelled() {
                return Err(ScavengeError::Cancelled);
            }
            checkpoint = match checkpoint {
                ScavengeCheckpoint::Accumulating {
                    scavenge_point,
                    done_logical_chunk_number,
                } => {
                    self.status.set_status(ScavengeStatus::Accumulating);
                    self.accumulator()
                        .accumulate(&scavenge_point, done_logical_chunk_number, token)?;
                    ScavengeCheckpoint::Calculating {
                        scavenge_point,
                        done_stream_handle: None,
                    }
                }
                ScavengeCheckpoint::Calculating {
                    scavenge_point,
                    done_stream_handle,
                } => {
                    self.status.set_status(ScavengeStatus::Calculating);
                    self.calculator()
                        .calculate(&scavenge_point, done_stream_handle, token)?;
                    ScavengeCheckpoint::ExecutingChunks {
                        scavenge_point,
                        done_logical_chunk_number: None,
                        chunks_failed: 0,
                    }
                }
                ScavengeCheckpoint::ExecutingChunks {
                    scavenge_point,
                    done_logical_chunk_number,
                    ..
                } => {
                    self.status.set_status(ScavengeStatus::Executing);
                    self.executor(log).execute(
                        &scavenge_point,
                        done_logical_chunk_number,
                        options.start_from_chunk,
                        options.always_keep_scavenged,
                        token,
                    )?;
                    ScavengeCheckpoint::MergingChunks {
                        scavenge_point,
                        chunks_failed: log.chunks_failed(),
                    }
                }
                ScavengeCheckpoint::MergingChunks { scavenge_point, .. } => {
                    if options.merge_chunks {
                        self.status.set_status(ScavengeStatus::Merging);
                        ChunkMerger {
                            chunk_manager: self.chunk_manager.as_ref(),
                            log,
                            max_chunk_data_size: self.config.chunk.max_chunk_data_size(),
                        }
                        .merge(&scavenge_point, token)?;
                    }
                    ScavengeCheckpoint::ExecutingIndex {
                        scavenge_point,
                        chunks_failed: log.chunks_failed(),
                    }
                }
                ScavengeCheckpoint::ExecutingIndex {
                    scavenge_point,
                    chunks_failed,
                } => {
                    // The index must not lose entries of events still in failed chunks.
                    if chunks_failed > 0 {
                        warn!("Skip index execution: {} chunk(s) failed", chunks_failed);
                    } else {
                        self.status.set_status(ScavengeStatus::ExecutingIndex);
                        self.execute_index(&scavenge_point, log)?;
                    }
                    ScavengeCheckpoint::Cleaning {
                        scavenge_point,
                        chunks_failed,
                    }
                }
                ScavengeCheckpoint::Cleaning {
                    scavenge_point,
                    chunks_failed,
                } => {
                    self.status.set_status(ScavengeStatus::Cleaning);
                    Cleaner {
                        state: &self.state,
                        delete_archived: self.config.scavenge.delete_archived,
                        chunks_failed,
                    }
                    .clean(&scavenge_point, token)?;
                    ScavengeCheckpoint::Done { scavenge_point }
                }
                ScavengeCheckpoint::Done { .. } => return Ok(()),
            };
            self.state.set_checkpoint(&checkpoint)?;
        }
    }

    fn start_new(
        &self,
        previous: Option<&ScavengePoint>,
        options: &ScavengeOptions,
    ) -> ScavengeCheckpoint {
        let scavenge_point = ScavengePoint {
            number: previous.map_or(0, |previous| previous.number + 1),
            position: self.chunk_manager.writer_checkpoint(),
            effective_now: truncate_to_millis(self.clock.now()),
            threshold: options
                .threshold
                .unwrap_or(self.config.scavenge.chunk_execution_threshold),
        };
        info!("Start new scavenge at {:?}", scavenge_point);

        // Chunks wholly before the previous scavenge point are accumulated already.
        let chunk_size = self.chunk_manager.chunk_size() as i64;
        let done_logical_chunk_number = previous
            .and_then(|previous| ((previous.position / chunk_size) as u32).checked_sub(1));
        ScavengeCheckpoint::Accumulating {
            scavenge_point,
            done_logical_chunk_number,
        }
    }

    fn execute_index(
        &self,
        scavenge_point: &ScavengePoint,
        log: &ScavengerLog,
    ) -> Result<(), ScavengeError> {
        let filter = IndexEntryFilter {
            state: &self.state,
            scavenge_point,
            unsafe_ignore_hard_deletes: self.config.scavenge.unsafe_ignore_hard_deletes,
        };
        match self.index_scavenger.scavenge_index(scavenge_point, &filter) {
            Ok(entries_deleted) => {
                log.index_scavenged(entries_deleted, None);
                Ok(())
            }
            Err(e) => {
                log.index_scavenged(0, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn accumulator(&self) -> Accumulator<'_> {
        Accumulator {
            state: &self.state,
            chunk_manager: self.chunk_manager.as_ref(),
            index_reader: self.index_reader.as_ref(),
            metastream_max_count: self.config.scavenge.metastream_max_count,
        }
    }

    fn calculator(&self) -> Calculator<'_> {
        Calculator {
            state: &self.state,
            index_reader: self.index_reader.as_ref(),
            chunk_size: self.chunk_manager.chunk_size(),
            batch_size: self.config.scavenge.calculation_batch_size,
        }
    }

    fn executor<'a>(&'a self, log: &'a ScavengerLog) -> ChunkExecutor<'a> {
        ChunkExecutor {
            state: &self.state,
            chunk_manager: self.chunk_manager.as_ref(),
            log,
            unsafe_ignore_hard_deletes: self.config.scavenge.unsafe_ignore_hard_deletes,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use bytes::{Bytes, BytesMut};
    use chrono::{DateTime, Utc};
    use chunk::{error::ChunkError, Chunk, ChunkManager, MemoryChunkDb};
    use config::Configuration;
    use crossbeam::channel::{self, Receiver, Sender};
    use model::{
        scavenge::ScavengeCheckpoint,
        stream::{metastream_of, DELETED_STREAM, METADATA_EVENT_TYPE},
        Event, LogRecord, PrepareBuilder, PrepareRecord, StreamMetadata,
    };
    use parking_lot::Mutex;
    use store::ScavengeStore;
    use tokio_util::sync::CancellationToken;

    use super::{ScavengeOptions, Scavenger};
    use crate::{
        clock::Clock,
        error::ScavengeError,
        hash::LongHasher,
        index::{IndexScavenger, MemoryIndex, MockIndexScavenger},
        notification::{ScavengeEvent, ScavengeListener, ScavengeResult},
        status::{MemoryStatusTracker, ScavengeStatus},
    };

    const CHUNK_SIZE: u64 = 4096;

    /// Records events, optionally cancelling after a number of scavenged chunks.
    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<ScavengeEvent>>,
        cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    }

    impl RecordingListener {
        fn chunks_scavenged(&self) -> Vec<(u32, bool)> {
            self.events
                .lock()
                .iter()
                .filter_map(|event| match event {
                    ScavengeEvent::ChunkScavenged {
                        chunk_start,
                        scavenged,
                        ..
                    } => Some((*chunk_start, *scavenged)),
                    _ => None,
                })
                .collect()
        }

        fn clear(&self) {
            self.events.lock().clear();
            *self.cancel_after.lock() = None;
        }
    }

    impl ScavengeListener for RecordingListener {
        fn on_event(&self, event: &ScavengeEvent) -> Result<(), ScavengeError> {
            self.events.lock().push(event.clone());
            if let ScavengeEvent::ChunkScavenged { scavenged: true, .. } = event {
                let mut cancel_after = self.cancel_after.lock();
                if let Some((remaining, token)) = cancel_after.as_mut() {
                    *remaining -= 1;
                    if *remaining == 0 {
                        token.cancel();
                    }
                }
            }
            Ok(())
        }
    }

    struct PanickingListener;

    impl ScavengeListener for PanickingListener {
        fn on_event(&self, event: &ScavengeEvent) -> Result<(), ScavengeError> {
            if let ScavengeEvent::Completed { .. } = event {
                panic!("completion handler failed");
            }
            Ok(())
        }
    }

    /// Fails to switch in chunks starting at the given number.
    struct FailingChunkManager {
        inner: Arc<MemoryChunkDb>,
        failing: u32,
    }

    impl ChunkManager for FailingChunkManager {
        fn chunk_size(&self) -> u64 {
            self.inner.chunk_size()
        }

        fn writer_checkpoint(&self) -> i64 {
            self.inner.writer_checkpoint()
        }

        fn completed_chunk(&self, logical_chunk_number: u32) -> Option<Arc<Chunk>> {
            self.inner.completed_chunk(logical_chunk_number)
        }

        fn completed_chunks(&self) -> Vec<Arc<Chunk>> {
            self.inner.completed_chunks()
        }

        fn switch_in(&self, chunk: Chunk) -> Result<Vec<Arc<Chunk>>, ChunkError> {
            if chunk.start_number() == self.failing {
                return Err(ChunkError::Internal("injected failure".to_owned()));
            }
            self.inner.switch_in(chunk)
        }
    }

    struct FirstCharHasher;

    impl LongHasher for FirstCharHasher {
        fn hash(&self, stream_id: &str) -> u64 {
            stream_id.bytes().next().map_or(0, u64::from)
        }
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    struct Fixture {
        db: Arc<MemoryChunkDb>,
        store: Arc<ScavengeStore>,
        status: Arc<MemoryStatusTracker>,
        listener: Arc<RecordingListener>,
        config: Configuration,
    }

    impl Fixture {
        fn new() -> Self {
            ulog::try_init_log();
            let mut config = Configuration::default();
            config.chunk.chunk_size = CHUNK_SIZE;
            config.check_and_apply().unwrap();
            Self {
                db: Arc::new(MemoryChunkDb::new(CHUNK_SIZE)),
                store: Arc::new(ScavengeStore::memory()),
                status: Arc::new(MemoryStatusTracker::default()),
                listener: Arc::new(RecordingListener::default()),
                config,
            }
        }

        fn scavenger_with(
            &self,
            chunk_manager: Arc<dyn ChunkManager>,
            index_scavenger: Arc<dyn IndexScavenger>,
            listener: Arc<dyn ScavengeListener>,
        ) -> Scavenger {
            Scavenger::new(
                &self.config,
                Arc::clone(&self.store),
                chunk_manager,
                Arc::new(MemoryIndex::new(self.db.index())),
                index_scavenger,
                Arc::clone(&self.status) as _,
                listener,
            )
            .unwrap()
        }

        fn scavenger(&self) -> Scavenger {
            self.scavenger_with(
                Arc::clone(&self.db) as _,
                Arc::new(MemoryIndex::new(self.db.index())),
                Arc::clone(&self.listener) as _,
            )
        }

        fn scavenge(&self) -> ScavengeResult {
            self.scavenger()
                .scavenge(&ScavengeOptions::default(), &CancellationToken::new()).unwrap()
        }

        fn write(&self, stream_id: &str, event_number: i64) {
            self.db
                .write_committed(
                    PrepareBuilder::new(stream_id)
                        .expected_version(event_number - 1)
                        .event(event(event_number)),
                )
                .unwrap();
        }

        fn write_batch(&self, stream_id: &str, first: i64, count: i64) -> PrepareRecord {
            self.db
                .write_prepare(
                    PrepareBuilder::new(stream_id)
                        .expected_version(first - 1)
                        .events((first..first + count).map(event)),
                )
                .unwrap()
        }

        fn write_metadata(&self, stream_id: &str, version: i64, metadata: StreamMetadata) {
            self.db
                .write_committed(
                    PrepareBuilder::new(&metastream_of(stream_id))
                        .expected_version(version - 1)
                        .event(Event::new(METADATA_EVENT_TYPE, metadata.to_bytes().unwrap())),
                )
                .unwrap();
        }

        fn records(&self) -> Vec<(LogRecord, Bytes)> {
            self.db
                .completed_chunks()
                .iter()
                .flat_map(|chunk| chunk.records())
                .map(|record| {
                    let record = record.unwrap();
                    (record.record, record.raw)
                })
                .collect()
        }

        fn prepares(&self, stream_id: &str) -> Vec<PrepareRecord> {
            self.records()
                .into_iter()
                .filter_map(|(record, _)| match record {
                    LogRecord::Prepare(prepare) if prepare.stream_id == stream_id => Some(prepare),
                    _ => None,
                })
                .collect()
        }

        fn event_numbers(&self, stream_id: &str) -> Vec<i64> {
            self.prepares(stream_id)
                .iter()
                .flat_map(|prepare| {
                    (0..prepare.events.len() as i64).map(|i| prepare.first_event_number() + i)
                })
                .collect()
        }
    }

    fn event(event_number: i64) -> Event {
        let mut data = BytesMut::new();
        data.extend_from_slice(&event_number.to_le_bytes());
        data.extend_from_slice(&[7u8; 56]);
        Event::new("e", data.freeze())
    }

    #[test]
    fn test_tombstone_keeps_only_the_tombstone() {
        let fixture = Fixture::new();
        for i in 0..4 {
            fixture.write("a", i);
        }
        fixture
            .db
            .write_committed(PrepareBuilder::tombstone("a"))
            .unwrap();
        fixture.db.complete_chunk();
        assert_eq!(10, fixture.records().len());

        assert_eq!(ScavengeResult::Success, fixture.scavenge());
        let records = fixture.records();
        assert_eq!(2, records.len());
        assert!(matches!(&records[0].0, LogRecord::Prepare(prepare) if prepare.is_tombstone()));
        assert!(matches!(&records[1].0, LogRecord::Commit(_)));
        assert_eq!(1, fixture.db.index().len());
        assert_eq!(
            vec![
                ScavengeStatus::Idle,
                ScavengeStatus::Accumulating,
                ScavengeStatus::Calculating,
                ScavengeStatus::Executing,
                ScavengeStatus::ExecutingIndex,
                ScavengeStatus::Cleaning,
                ScavengeStatus::Done,
            ],
            fixture.status.history()
        );
    }

    #[test]
    fn test_max_count() {
        let fixture = Fixture::new();
        fixture.write_metadata("a", 0, StreamMetadata::default().with_max_count(3));
        for i in 0..5 {
            fixture.write("a", i);
        }
        fixture.db.complete_chunk();

        assert_eq!(ScavengeResult::Success, fixture.scavenge());
        assert_eq!(vec![2, 3, 4], fixture.event_numbers("a"));
        assert_eq!(1, fixture.prepares("$$a").len());
        // Metadata and three events, each with its commit.
        assert_eq!(8, fixture.records().len());
    }

    #[test]
    fn test_stricter_of_max_age_and_max_count_wins() {
        let fixture = Fixture::new();
        let old = Utc::now() - chrono::Duration::hours(2);
        for stream_id in ["age", "count"] {
            for i in 0..3 {
                fixture
                    .db
                    .write_prepare(
                        PrepareBuilder::new(stream_id)
                            .expected_version(i - 1)
                            .timestamp(old)
                            .event(event(i)),
                    )
                    .unwrap();
            }
        }
        fixture.db.complete_chunk();
        let max_age = Duration::from_secs(3600);
        for (stream_id, max_count) in [("age", 4), ("count", 2)] {
            let metadata = StreamMetadata::default()
                .with_max_age(max_age)
                .with_max_count(max_count);
            fixture.write_metadata(stream_id, 0, metadata);
        }
        for stream_id in ["age", "count"] {
            for i in 3..6 {
                fixture.write(stream_id, i);
            }
        }
        fixture.db.complete_chunk();

        assert_eq!(ScavengeResult::Success, fixture.scavenge());
        assert_eq!(vec![3, 4, 5], fixture.event_numbers("age"));
        assert_eq!(vec![4, 5], fixture.event_numbers("count"));
    }

    #[test]
    fn test_max_age_keeps_last_event() {
        let fixture = Fixture::new();
        fixture.write_metadata(
            "a",
            0,
            StreamMetadata::default().with_max_age(Duration::from_secs(3600)),
        );
        for i in 0..4 {
            fixture.write("a", i);
        }
        fixture.db.complete_chunk();

        let scavenger = fixture
            .scavenger()
            .with_clock(Arc::new(FixedClock(Utc::now() + chrono::Duration::hours(2))));
        assert_eq!(
            ScavengeResult::Success,
            scavenger.scavenge(&ScavengeOptions::default(), &CancellationToken::new()).unwrap()
        );
        assert_eq!(vec![3], fixture.event_numbers("a"));
    }

    #[test]
    fn test_truncate_before_at_record_boundary() {
        let fixture = Fixture::new();
        fixture.write_metadata("a", 0, StreamMetadata::default().with_truncate_before(2));
        for first in [0, 2, 4] {
            fixture.write_batch("a", first, 2);
        }
        fixture.db.complete_chunk();
        let before: Vec<Bytes> = fixture
            .records()
            .into_iter()
            .filter(|(record, _)| match record {
                LogRecord::Prepare(prepare) => {
                    prepare.stream_id == "a" && prepare.first_event_number() >= 2
                }
                _ => false,
            })
            .map(|(_, raw)| raw)
            .collect();

        assert_eq!(ScavengeResult::Success, fixture.scavenge());
        let after: Vec<Bytes> = fixture
            .records()
            .into_iter()
            .filter(|(record, _)| {
                matches!(record, LogRecord::Prepare(prepare) if prepare.stream_id == "a")
            })
            .map(|(_, raw)| raw)
            .collect();
        assert_eq!(before, after);
        assert_eq!(vec![2, 3, 4, 5], fixture.event_numbers("a"));
    }

    #[test]
    fn test_truncate_before_inside_batched_record() {
        let fixture = Fixture::new();
        fixture.write_metadata("a", 0, StreamMetadata::default().with_truncate_before(3));
        let mut original = vec![];
        for first in [0, 2, 4] {
            original.push(fixture.write_batch("a", first, 2));
        }
        fixture.db.complete_chunk();

        assert_eq!(ScavengeResult::Success, fixture.scavenge());
        let prepares = fixture.prepares("a");
        assert_eq!(2, prepares.len());
        let split = &prepares[0];
        assert_eq!(1, split.events.len());
        assert_eq!(3, split.first_event_number());
        assert_eq!(original[1].events[1].data, split.events[0].data);
        // A single survivor takes the position of the event itself.
        assert_eq!(original[1].event_log_position(1), split.log_position);
        assert_eq!(original[2], prepares[1]);
        let chunk = fixture.db.completed_chunk(0).unwrap();
        assert_eq!(
            Some(LogRecord::Prepare(split.clone())),
            chunk.read(split.log_position).unwrap()
        );
    }

    #[test]
    fn test_soft_delete_keeps_last_event() {
        let fixture = Fixture::new();
        for first in [0, 3, 6] {
            fixture.write_batch("a", first, 3);
        }
        fixture.write_metadata(
            "a",
            0,
            StreamMetadata::default().with_truncate_before(DELETED_STREAM),
        );
        fixture.db.complete_chunk();

        assert_eq!(ScavengeResult::Success, fixture.scavenge());
        let prepares = fixture.prepares("a");
        assert_eq!(1, prepares.len());
        assert_eq!(1, prepares[0].events.len());
        assert_eq!(8, prepares[0].first_event_number());
    }

    #[test]
    fn test_hash_collision() {
        let fixture = Fixture::new();
        for i in 0..3 {
            fixture.write("a-1", i);
        }
        fixture.write_metadata("a-1", 0, StreamMetadata::default().with_max_count(1));
        for i in 0..3 {
            fixture.write("a-2", i);
        }
        fixture.db.complete_chunk();

        let scavenger = fixture
            .scavenger()
            .with_hasher(Arc::new(FirstCharHasher))
            .unwrap();
        assert_eq!(
            ScavengeResult::Success,
            scavenger.scavenge(&ScavengeOptions::default(), &CancellationToken::new()).unwrap()
        );
        assert_eq!(vec![2], fixture.event_numbers("a-1"));
        assert_eq!(vec![0, 1, 2], fixture.event_numbers("a-2"));
        assert_eq!(
            vec!["a-1".to_owned(), "a-2".to_owned()],
            scavenger.state().resolver().collisions().unwrap()
        );
        assert!(fixture
            .store
            .original_stream_collisions
            .try_get(&"a-1".to_owned())
            .unwrap()
            .is_some());
        assert!(fixture
            .store
            .original_stream_collisions
            .try_get(&"a-2".to_owned())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_cancel_before_start() {
        let fixture = Fixture::new();
        for i in 0..3 {
            fixture.write("a", i);
        }
        fixture.write_metadata("a", 0, StreamMetadata::default().with_max_count(1));
        fixture.db.complete_chunk();
        let index_len = fixture.db.index().len();

        let token = CancellationToken::new();
        token.cancel();
        let result = fixture
            .scavenger()
            .scavenge(&ScavengeOptions::default(), &token)
            .unwrap();
        assert_eq!(ScavengeResult::Stopped, result);
        let events = fixture.listener.events.lock().clone();
        assert_eq!(2, events.len());
        assert!(matches!(events[0], ScavengeEvent::Started { .. }));
        assert!(matches!(
            events[1],
            ScavengeEvent::Completed {
                result: ScavengeResult::Stopped,
                ..
            }
        ));
        assert_eq!(index_len, fixture.db.index().len());
        assert_eq!(None, fixture.store.read_checkpoint().unwrap());
        assert_eq!(Some(ScavengeStatus::Stopped), fixture.status.history().last().copied());
    }

    fn write_chunks(fixture: &Fixture, chunks: i64) {
        fixture.write_metadata("a", 0, StreamMetadata::default().with_max_count(1));
        for chunk in 0..chunks {
            fixture.write("a", chunk * 2);
            fixture.write("a", chunk * 2 + 1);
            fixture.db.complete_chunk();
        }
    }

    #[test]
    fn test_cancel_mid_run_then_resume() {
        let fixture = Fixture::new();
        write_chunks(&fixture, 5);
        let token = CancellationToken::new();
        *fixture.listener.cancel_after.lock() = Some((2, token.clone()));

        let scavenger = fixture.scavenger();
        assert_eq!(
            ScavengeResult::Stopped,
            scavenger.scavenge(&ScavengeOptions::default(), &token).unwrap()
        );
        assert_eq!(vec![(0, true), (1, true)], fixture.listener.chunks_scavenged());
        assert!(fixture.db.completed_chunk(1).unwrap().is_scavenged());
        assert!(!fixture.db.completed_chunk(2).unwrap().is_scavenged());
        assert!(matches!(
            fixture.store.read_checkpoint().unwrap(),
            Some(ScavengeCheckpoint::ExecutingChunks {
                done_logical_chunk_number: Some(1),
                ..
            })
        ));

        // A restarted scavenger picks up at the next chunk.
        fixture.listener.clear();
        assert_eq!(ScavengeResult::Success, fixture.scavenge());
        let resumed: Vec<u32> = fixture
            .listener
            .chunks_scavenged()
            .into_iter()
            .map(|(chunk, _)| chunk)
            .collect();
        assert_eq!(vec![2, 3, 4], resumed);
        assert_eq!(vec![9], fixture.event_numbers("a"));
    }

    /// Blocks the first scavenge at its first chunk until released.
    struct BlockingListener {
        started: AtomicUsize,
        gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    }

    impl ScavengeListener for BlockingListener {
        fn on_event(&self, event: &ScavengeEvent) -> Result<(), ScavengeError> {
            match event {
                ScavengeEvent::Started { .. } => {
                    self.started.fetch_add(1, Ordering::SeqCst);
                }
                ScavengeEvent::ChunkScavenged { .. } => {
                    let gate = self.gate.lock().take();
                    if let Some((reached, release)) = gate {
                        let _ = reached.send(());
                        let _ = release.recv();
                    }
                }
                _ => {}
            }
            Ok(())
        }
    }

    #[test]
    fn test_concurrent_scavenge_is_rejected() {
        let fixture = Fixture::new();
        write_chunks(&fixture, 2);
        let (reached_tx, reached_rx) = channel::bounded(1);
        let (release_tx, release_rx) = channel::bounded(1);
        let listener = Arc::new(BlockingListener {
            started: AtomicUsize::new(0),
            gate: Mutex::new(Some((reached_tx, release_rx))),
        });
        let scavenger = fixture.scavenger_with(
            Arc::clone(&fixture.db) as _,
            Arc::new(MemoryIndex::new(fixture.db.index())),
            Arc::clone(&listener) as _,
        );
        let options = ScavengeOptions::default();

        std::thread::scope(|s| {
            let first = s.spawn(|| scavenger.scavenge(&options, &CancellationToken::new()));
            reached_rx.recv().unwrap();
            assert!(scavenger.is_running());
            let status = fixture.status.history();

            assert!(matches!(
                scavenger.scavenge(&options, &CancellationToken::new()),
                Err(ScavengeError::AlreadyRunning)
            ));
            // The rejected call leaves no trace.
            assert_eq!(1, listener.started.load(Ordering::SeqCst));
            assert_eq!(status, fixture.status.history());
            assert!(scavenger.is_running());

            release_tx.send(()).unwrap();
            assert_eq!(ScavengeResult::Success, first.join().unwrap().unwrap());
        });

        assert!(!scavenger.is_running());
        assert_eq!(
            ScavengeResult::Success,
            scavenger.scavenge(&options, &CancellationToken::new()).unwrap()
        );
        assert_eq!(2, listener.started.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failed_chunks_skip_index_after_restart() {
        let fixture = Fixture::new();
        write_chunks(&fixture, 3);
        let token = CancellationToken::new();
        // Chunk 1 fails, cancel once chunk 2 is scavenged.
        *fixture.listener.cancel_after.lock() = Some((2, token.clone()));
        let scavenger = fixture.scavenger_with(
            Arc::new(FailingChunkManager {
                inner: Arc::clone(&fixture.db),
                failing: 1,
            }),
            Arc::new(MemoryIndex::new(fixture.db.index())),
            Arc::clone(&fixture.listener) as _,
        );
        assert_eq!(
            ScavengeResult::Stopped,
            scavenger
                .scavenge(&ScavengeOptions::default(), &token)
                .unwrap()
        );
        assert!(matches!(
            fixture.store.read_checkpoint().unwrap(),
            Some(ScavengeCheckpoint::ExecutingChunks {
                done_logical_chunk_number: Some(2),
                chunks_failed: 1,
                ..
            })
        ));

        // The restarted scavenger has seen no failure itself.
        fixture.listener.clear();
        let mut index_scavenger = MockIndexScavenger::new();
        index_scavenger.expect_scavenge_index().times(0);
        let scavenger = fixture.scavenger_with(
            Arc::clone(&fixture.db) as _,
            Arc::new(index_scavenger),
            Arc::clone(&fixture.listener) as _,
        );
        assert_eq!(
            ScavengeResult::Failed,
            scavenger
                .scavenge(&ScavengeOptions::default(), &CancellationToken::new())
                .unwrap()
        );
        assert!(fixture.listener.chunks_scavenged().is_empty());
        assert!(!fixture
            .status
            .history()
            .contains(&ScavengeStatus::ExecutingIndex));
        assert!(matches!(
            fixture.store.read_checkpoint().unwrap(),
            Some(ScavengeCheckpoint::Done { .. })
        ));
    }

    #[test]
    fn test_chunk_failure_is_contained() {
        let fixture = Fixture::new();
        write_chunks(&fixture, 3);
        let mut index_scavenger = MockIndexScavenger::new();
        index_scavenger.expect_scavenge_index().times(0);
        let scavenger = fixture.scavenger_with(
            Arc::new(FailingChunkManager {
                inner: Arc::clone(&fixture.db),
                failing: 1,
            }),
            Arc::new(index_scavenger),
            Arc::clone(&fixture.listener) as _,
        );

        assert_eq!(
            ScavengeResult::Failed,
            scavenger.scavenge(&ScavengeOptions::default(), &CancellationToken::new()).unwrap()
        );
        assert_eq!(
            vec![(0, true), (1, false), (2, true)],
            fixture.listener.chunks_scavenged()
        );
        assert!(fixture.db.completed_chunk(2).unwrap().is_scavenged());
        // The failed chunk keeps its weight for the next scavenge.
        assert!(!scavenger.state().all_chunks_executed().unwrap());
        assert_eq!(Some(ScavengeStatus::Failed), fixture.status.history().last().copied());
    }

    #[test]
    fn test_completion_listener_panic_is_swallowed() {
        let fixture = Fixture::new();
        write_chunks(&fixture, 1);
        let scavenger = fixture.scavenger_with(
            Arc::clone(&fixture.db) as _,
            Arc::new(MemoryIndex::new(fixture.db.index())),
            Arc::new(PanickingListener),
        );
        assert_eq!(
            ScavengeResult::Success,
            scavenger.scavenge(&ScavengeOptions::default(), &CancellationToken::new()).unwrap()
        );
    }

    #[test]
    fn test_idempotent() {
        let fixture = Fixture::new();
        write_chunks(&fixture, 3);
        for i in 0..3 {
            fixture.write("b", i);
        }
        fixture.db.write_committed(PrepareBuilder::tombstone("b")).unwrap();
        fixture.db.complete_chunk();

        assert_eq!(ScavengeResult::Success, fixture.scavenge());
        let first = fixture.records();
        assert_eq!(ScavengeResult::Success, fixture.scavenge());
        let second = fixture.records();
        assert_eq!(
            first.iter().map(|(_, raw)| raw).collect::<Vec<_>>(),
            second.iter().map(|(_, raw)| raw).collect::<Vec<_>>()
        );
        assert!(matches!(
            fixture.store.read_checkpoint().unwrap(),
            Some(ScavengeCheckpoint::Done { scavenge_point }) if scavenge_point.number == 1
        ));
    }

    #[test]
    fn test_merge_after_scavenge() {
        let fixture = Fixture::new();
        write_chunks(&fixture, 4);
        let options = ScavengeOptions {
            merge_chunks: true,
            ..Default::default()
        };
        assert_eq!(
            ScavengeResult::Success,
            fixture.scavenger().scavenge(&options, &CancellationToken::new()).unwrap()
        );
        let chunks = fixture.db.completed_chunks();
        assert_eq!(1, chunks.len());
        assert_eq!(3, chunks[0].end_number());
        assert_eq!(vec![7], fixture.event_numbers("a"));
        assert!(fixture
            .listener
            .events
            .lock()
            .iter()
            .any(|event| matches!(event, ScavengeEvent::Merged { merged: true, .. })));
    }

    #[test]
    fn test_start_from_chunk() {
        let fixture = Fixture::new();
        write_chunks(&fixture, 3);
        let options = ScavengeOptions {
            start_from_chunk: Some(1),
            ..Default::default()
        };
        assert_eq!(
            ScavengeResult::Success,
            fixture.scavenger().scavenge(&options, &CancellationToken::new()).unwrap()
        );
        assert_eq!(vec![(1, true), (2, true)], fixture.listener.chunks_scavenged());
        assert!(!fixture.db.completed_chunk(0).unwrap().is_scavenged());
    }

    #[test]
    fn test_open_memory_store() {
        let fixture = Fixture::new();
        let store = super::open_store(&fixture.config).unwrap();
        assert_eq!(None, store.read_checkpoint().unwrap());
    }

    #[cfg(feature = "rocksdb")]
    #[test]
    fn test_checkpoint_survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let mut fixture = Fixture::new();
        let dir = tempfile::tempdir()?;
        fixture.config.state.backend = config::Backend::RocksDB;
        fixture.config.state.path = dir.path().join("state").to_string_lossy().into_owned();
        fixture.config.check_and_apply()?;
        fixture.store = super::open_store(&fixture.config)?;
        write_chunks(&fixture, 3);
        let token = CancellationToken::new();
        *fixture.listener.cancel_after.lock() = Some((1, token.clone()));
        assert_eq!(
            ScavengeResult::Stopped,
            fixture.scavenger().scavenge(&ScavengeOptions::default(), &token).unwrap()
        );

        // Release the database lock, then reopen as a restarted process would.
        fixture.store = Arc::new(ScavengeStore::memory());
        fixture.store = super::open_store(&fixture.config)?;
        fixture.listener.clear();
        assert_eq!(ScavengeResult::Success, fixture.scavenge());
        assert_eq!(vec![(1, true), (2, true)], fixture.listener.chunks_scavenged());
        assert_eq!(vec![5], fixture.event_numbers("a"));
        Ok(())
    }
}
