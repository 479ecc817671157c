use chunk::{error::ChunkError, Chunk, ChunkBuilder, ChunkManager};
use log::{debug, error, info, trace};
use model::{
    scavenge::{ChunkExecutionInfo, ScavengeCheckpoint, ScavengePoint},
    stream::is_metastream,
    LogRecord, PrepareFlags, PrepareRecord,
};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ScavengeError, index::IndexDiscardLookup, notification::ScavengerLog,
    state::ScavengeState,
};

/// What happens to a prepare when its chunk is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrepareDecision {
    Keep,
    Drop,

    /// Keep the events from the given index onwards.
    KeepFrom(usize),
}

/// Rewrites chunks without the records discard points and tombstones make obsolete.
pub(crate) struct ChunkExecutor<'a> {
    pub(crate) state: &'a ScavengeState,
    pub(crate) chunk_manager: &'a dyn ChunkManager,
    pub(crate) log: &'a ScavengerLog,
    pub(crate) unsafe_ignore_hard_deletes: bool,
}

impl<'a> ChunkExecutor<'a> {
    /// Execute every completed chunk below the scavenge point after `done`, or from
    /// `start_from_chunk` if that is further.
    ///
    /// A chunk that fails is reported and skipped; its weight is left for the next pass.
    pub(crate) fn execute(
        &self,
        scavenge_point: &ScavengePoint,
        done: Option<u32>,
        start_from_chunk: Option<u32>,
        always_keep_scavenged: bool,
        token: &CancellationToken,
    ) -> Result<(), ScavengeError> {
        let mut logical_chunk_number = done
            .map_or(0, |done| done + 1)
            .max(start_from_chunk.unwrap_or_default());
        info!(
            "Executing chunks from #{} with threshold {}",
            logical_chunk_number, scavenge_point.threshold
        );

        while let Some(chunk) = self.chunk_manager.completed_chunk(logical_chunk_number) {
            if chunk.header().end_position() > scavenge_point.position {
                break;
            }
            if token.is_cancelled() {
                return Err(ScavengeError::Cancelled);
            }

            let start = chunk.start_number();
            let end = chunk.end_number();
            let checkpoint = || ScavengeCheckpoint::ExecutingChunks {
                scavenge_point: scavenge_point.clone(),
                done_logical_chunk_number: Some(end),
                chunks_failed: self.log.chunks_failed(),
            };
            let weight = self.state.sum_chunk_weights(start..=end)?;
            if weight > scavenge_point.threshold
                || scavenge_point.threshold < 0.0
                || self.unsafe_ignore_hard_deletes
            {
                match self.execute_chunk(&chunk, scavenge_point, always_keep_scavenged) {
                    Ok(space_saved) => {
                        self.state.transaction(|| {
                            self.state.reset_chunk_weights(start..=end)?;
                            Ok::<_, ScavengeError>(((), checkpoint()))
                        })?;
                        self.log.chunk_scavenged(start, end, space_saved);
                    }
                    Err(e) => {
                        error!("Failed to scavenge chunk #{}-{}: {}", start, end, e);
                        // Count the failure before checkpointing past the chunk.
                        self.log.chunk_not_scavenged(start, end, Some(e.to_string()));
                        self.state.set_checkpoint(&checkpoint())?;
                    }
                }
            } else {
                debug!(
                    "Skip chunk #{}-{} with weight {}, threshold: {}",
                    start, end, weight, scavenge_point.threshold
                );
                self.state.set_checkpoint(&checkpoint())?;
                self.log.chunk_not_scavenged(start, end, None);
            }

            // Listeners may cancel on notification.
            if token.is_cancelled() {
                return Err(ScavengeError::Cancelled);
            }
            logical_chunk_number = end + 1;
        }
        Ok(())
    }

    /// Rewrite `chunk` and switch the result in. Returns the bytes saved.
    fn execute_chunk(
        &self,
        chunk: &Chunk,
        scavenge_point: &ScavengePoint,
        always_keep_scavenged: bool,
    ) -> Result<i64, ScavengeError> {
        let header = chunk.header();

        // Transactions committed inside this chunk: transaction position -> first event number.
        let mut commits: FxHashMap<i64, i64> = FxHashMap::default();
        for record in chunk.records() {
            if let LogRecord::Commit(commit) = record?.record {
                if commit.transaction_position >= header.start_position() {
                    commits.insert(commit.transaction_position, commit.first_event_number);
                }
            }
        }

        // Absent: undecided. True: a prepare is kept. False: every prepare seen was dropped.
        let mut keep_commit: FxHashMap<i64, bool> = FxHashMap::default();
        let mut builder = ChunkBuilder::new(
            header.chunk_start_number,
            header.chunk_end_number,
            header.chunk_size,
            true,
        );
        let mut kept = 0;
        let mut discarded = 0;
        for record in chunk.records() {
            let record = record?;
            match &record.record {
                LogRecord::Prepare(prepare) => {
                    let first_event_number = commits.get(&prepare.transaction_position).map(
                        |first| first + prepare.transaction_offset as i64,
                    );
                    let decision =
                        self.decide_prepare(prepare, first_event_number, scavenge_point)?;
                    trace!(
                        "{:?} prepare of {} at {}",
                        decision,
                        prepare.stream_id,
                        prepare.log_position
                    );
                    match decision {
                        PrepareDecision::Keep => {
                            keep_commit.insert(prepare.transaction_position, true);
                            builder.append_raw(prepare.log_position, &record.raw)?;
                            kept += 1;
                        }
                        PrepareDecision::KeepFrom(index) => {
                            keep_commit.insert(prepare.transaction_position, true);
                            let split = prepare.keep_from(index).map_err(ChunkError::from)?;
                            builder.append(&LogRecord::Prepare(split))?;
                            kept += 1;
                        }
                        PrepareDecision::Drop => {
                            keep_commit.entry(prepare.transaction_position).or_insert(false);
                            discarded += 1;
                        }
                    }
                }
                LogRecord::Commit(commit) => {
                    if keep_commit.get(&commit.transaction_position) == Some(&false) {
                        discarded += 1;
                    } else {
                        builder.append_raw(commit.log_position, &record.raw)?;
                        kept += 1;
                    }
                }
                LogRecord::System(system) => {
                    builder.append_raw(system.log_position, &record.raw)?;
                    kept += 1;
                }
            }
        }

        let old_size = chunk.physical_data_size() as i64;
        let new_size = builder.physical_data_size() as i64;
        if new_size >= old_size && !always_keep_scavenged {
            info!(
                "Keep chunk #{}-{}: scavenging would not save space ({} >= {} bytes)",
                header.chunk_start_number, header.chunk_end_number, new_size, old_size
            );
            return Ok(0);
        }

        self.chunk_manager.switch_in(builder.complete())?;
        info!(
            "Scavenged chunk #{}-{}: {} records kept, {} discarded, {} -> {} bytes",
            header.chunk_start_number,
            header.chunk_end_number,
            kept,
            discarded,
            old_size,
            new_size
        );
        Ok(old_size - new_size)
    }

    /// `first_event_number` is known when the commit of the prepare is in the same chunk.
    fn decide_prepare(
        &self,
        prepare: &PrepareRecord,
        first_event_number: Option<i64>,
        scavenge_point: &ScavengePoint,
    ) -> Result<PrepareDecision, ScavengeError> {
        if prepare.log_position >= scavenge_point.position {
            return Ok(PrepareDecision::Keep);
        }
        if !prepare.is_committed() && first_event_number.is_none() {
            // The commit is elsewhere, if it exists at all.
            return Ok(PrepareDecision::Keep);
        }
        let first_event_number = first_event_number.unwrap_or_else(|| prepare.first_event_number());

        if is_metastream(&prepare.stream_id) {
            return Ok(match self.state.metastream_data(&prepare.stream_id)? {
                Some(data) if data.is_tombstoned => PrepareDecision::Drop,
                Some(data) => discard_events(prepare, first_event_number, |event_number| {
                    data.discard_point.should_discard(event_number)
                }),
                None => PrepareDecision::Keep,
            });
        }

        let info = self.state.chunk_execution_info(&prepare.stream_id)?;
        if prepare.is_tombstone() {
            let drop =
                self.unsafe_ignore_hard_deletes && info.map_or(false, |info| info.is_tombstoned);
            return Ok(if drop {
                PrepareDecision::Drop
            } else {
                PrepareDecision::Keep
            });
        }
        let tombstoned = info.map_or(false, |info| info.is_tombstoned);
        if !prepare.has_data() {
            // Transaction markers go with a hard deleted stream only. Its transaction begins
            // stay unless hard deletes are ignored.
            let drop = tombstoned
                && (self.unsafe_ignore_hard_deletes
                    || !prepare.flags.contains(PrepareFlags::TRANSACTION_BEGIN));
            return Ok(if drop {
                PrepareDecision::Drop
            } else {
                PrepareDecision::Keep
            });
        }
        if tombstoned {
            return Ok(PrepareDecision::Drop);
        }

        Ok(match info {
            Some(info) => discard_events(prepare, first_event_number, |event_number| {
                should_discard_event(&info, event_number, prepare, scavenge_point)
            }),
            None => PrepareDecision::Keep,
        })
    }
}

fn should_discard_event(
    info: &ChunkExecutionInfo,
    event_number: i64,
    prepare: &PrepareRecord,
    scavenge_point: &ScavengePoint,
) -> bool {
    if info.discard_point.should_discard(event_number) {
        return true;
    }
    if !info.maybe_discard_point.should_discard(event_number) {
        return false;
    }
    info.max_age
        .and_then(|max_age| chrono::Duration::from_std(max_age).ok())
        .and_then(|max_age| scavenge_point.effective_now.checked_sub_signed(max_age))
        .map_or(false, |cutoff| prepare.timestamp < cutoff)
}

/// Decide a prepare from the fate of each of its events.
fn discard_events<F>(
    prepare: &PrepareRecord,
    first_event_number: i64,
    discard: F,
) -> PrepareDecision
where
    F: Fn(i64) -> bool,
{
    let first_kept = (0..prepare.events.len()).find(|i| !discard(first_event_number + *i as i64));
    match first_kept {
        None => PrepareDecision::Drop,
        Some(0) => PrepareDecision::Keep,
        Some(index) => PrepareDecision::KeepFrom(index),
    }
}

/// Decides index entries with the same rules chunk execution applies to events.
///
/// Entries of events that may be discarded by age are kept: only the chunk knows
/// their timestamps.
pub(crate) struct IndexEntryFilter<'a> {
    pub(crate) state: &'a ScavengeState,
    pub(crate) scavenge_point: &'a ScavengePoint,
    pub(crate) unsafe_ignore_hard_deletes: bool,
}

impl<'a> IndexDiscardLookup for IndexEntryFilter<'a> {
    fn should_discard(
        &self,
        stream_id: &str,
        event_number: i64,
        log_position: i64,
    ) -> Result<bool, ScavengeError> {
        if log_position >= self.scavenge_point.position {
            return Ok(false);
        }
        if is_metastream(stream_id) {
            return Ok(match self.state.metastream_data(stream_id)? {
                Some(data) => data.is_tombstoned || data.discard_point.should_discard(event_number),
                None => false,
            });
        }
        Ok(match self.state.chunk_execution_info(stream_id)? {
            Some(info) if info.is_tombstoned && self.unsafe_ignore_hard_deletes => true,
            Some(info) => info.discard_point.should_discard(event_number),
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use chrono::Utc;
    use chunk::{ChunkManager, MemoryChunkDb, MockChunkManager};
    use model::{
        scavenge::{CalculationStatus, DiscardPoint, ScavengePoint},
        Event, LogRecord, PrepareBuilder, PrepareFlags,
    };
    use store::ScavengeStore;
    use tokio_util::sync::CancellationToken;

    use super::{discard_events, ChunkExecutor, IndexEntryFilter, PrepareDecision};
    use crate::{
        error::ScavengeError,
        hash::XxHasher,
        index::IndexDiscardLookup,
        notification::{LoggingListener, ScavengerLog},
        state::ScavengeState,
    };

    fn event(i: u8) -> Event {
        Event::new("e", Bytes::from(vec![i; 64]))
    }

    fn state() -> ScavengeState {
        ScavengeState::new(Arc::new(ScavengeStore::memory()), Arc::new(XxHasher), 16).unwrap()
    }

    fn point(position: i64, threshold: f32) -> ScavengePoint {
        ScavengePoint {
            number: 0,
            position,
            effective_now: Utc::now(),
            threshold,
        }
    }

    fn set_discard_point(state: &ScavengeState, stream_id: &str, discard_point: DiscardPoint) {
        state.detect_collisions(stream_id).unwrap();
        let handle = state.resolver().handle_of(stream_id);
        state
            .set_original_stream_discard_points(
                &handle,
                CalculationStatus::Active,
                discard_point,
                discard_point,
            )
            .unwrap();
    }

    fn prepares(chunk: &chunk::Chunk) -> Vec<model::PrepareRecord> {
        chunk
            .records()
            .filter_map(|record| match record.unwrap().record {
                LogRecord::Prepare(prepare) => Some(prepare),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_discard_events() {
        let prepare = PrepareBuilder::new("a")
            .expected_version(9)
            .events((0..4).map(event))
            .build(0)
            .unwrap();
        assert_eq!(PrepareDecision::Keep, discard_events(&prepare, 10, |n| n < 10));
        assert_eq!(PrepareDecision::KeepFrom(2), discard_events(&prepare, 10, |n| n < 12));
        assert_eq!(PrepareDecision::Drop, discard_events(&prepare, 10, |n| n < 14));
    }

    #[test]
    fn test_execute_chunk() -> Result<(), ScavengeError> {
        ulog::try_init_log();
        let db = MemoryChunkDb::new(64 * 1024);
        for i in 0..10 {
            db.write_prepare(
                PrepareBuilder::new("a")
                    .expected_version(i - 1)
                    .event(event(i as u8)),
            )?;
        }
        db.write_committed(PrepareBuilder::new("b").event(event(0)))?;
        db.write_prepare(
            PrepareBuilder::new("c")
                .events((0..4).map(event))
                .flags(PrepareFlags::SINGLE_WRITE),
        )?;
        // A transaction without its commit.
        db.write_prepare(PrepareBuilder::new("b").transaction(0, 0).event(event(1)))?;
        db.complete_chunk();

        let state = state();
        set_discard_point(&state, "a", DiscardPoint::discard_before(8));
        set_discard_point(&state, "b", DiscardPoint::discard_before(1));
        set_discard_point(&state, "c", DiscardPoint::discard_before(2));
        state.increase_chunk_weight(0, 10.0)?;

        let log = ScavengerLog::new(Arc::new(LoggingListener));
        let executor = ChunkExecutor {
            state: &state,
            chunk_manager: &db,
            log: &log,
            unsafe_ignore_hard_deletes: false,
        };
        let point = point(db.writer_checkpoint(), 0.0);
        executor.execute(&point, None, None, false, &CancellationToken::new())?;

        assert_eq!(1, log.chunks_scavenged());
        assert!(log.space_saved() > 0);
        assert!(state.all_chunks_executed()?);

        let chunk = db.completed_chunk(0).unwrap();
        assert!(chunk.is_scavenged());
        let kept = prepares(&chunk);
        let a: Vec<i64> = kept
            .iter()
            .filter(|prepare| prepare.stream_id == "a")
            .map(|prepare| prepare.first_event_number())
            .collect();
        assert_eq!(vec![8, 9], a);
        // The committed prepare of b is gone with its commit. The pending one stays.
        let b: Vec<_> = kept.iter().filter(|prepare| prepare.stream_id == "b").collect();
        assert_eq!(1, b.len());
        assert!(!b[0].is_committed());
        assert!(chunk
            .records()
            .all(|record| !matches!(record.unwrap().record, LogRecord::Commit(_))));

        let c: Vec<_> = kept.iter().filter(|prepare| prepare.stream_id == "c").collect();
        assert_eq!(1, c.len());
        assert_eq!(2, c[0].events.len());
        assert_eq!(2, c[0].first_event_number());
        assert_eq!(
            Some(LogRecord::Prepare(c[0].clone())),
            chunk.read(c[0].log_position)?
        );
        Ok(())
    }

    #[test]
    fn test_transaction_markers() -> Result<(), ScavengeError> {
        let db = MemoryChunkDb::new(64 * 1024);
        let mut transactions = vec![];
        for stream_id in ["t", "x"] {
            let begin = db.write_prepare(
                PrepareBuilder::new(stream_id).flags(PrepareFlags::TRANSACTION_BEGIN),
            )?;
            db.write_prepare(
                PrepareBuilder::new(stream_id)
                    .flags(PrepareFlags::DATA)
                    .transaction(begin.log_position, 0)
                    .event(event(0)),
            )?;
            db.write_prepare(
                PrepareBuilder::new(stream_id)
                    .flags(PrepareFlags::TRANSACTION_END)
                    .transaction(begin.log_position, 1),
            )?;
            db.write_commit(begin.log_position, 0)?;
            transactions.push(begin.log_position);
        }
        for i in 0..4 {
            db.write_committed(
                PrepareBuilder::new("a")
                    .expected_version(i - 1)
                    .event(event(i as u8)),
            )?;
        }
        db.complete_chunk();

        let state = state();
        set_discard_point(&state, "a", DiscardPoint::discard_before(3));
        state.detect_collisions("x")?;
        state.set_original_stream_tombstone("x")?;
        let log = ScavengerLog::new(Arc::new(LoggingListener));
        let executor = ChunkExecutor {
            state: &state,
            chunk_manager: &db,
            log: &log,
            unsafe_ignore_hard_deletes: false,
        };
        let point = point(db.writer_checkpoint(), -1.0);
        executor.execute(&point, None, None, true, &CancellationToken::new())?;
        assert_eq!(1, log.chunks_scavenged());

        let chunk = db.completed_chunk(0).unwrap();
        let kept = prepares(&chunk);
        // A stream without limits keeps its whole transaction.
        let t: Vec<PrepareFlags> = kept
            .iter()
            .filter(|prepare| prepare.stream_id == "t")
            .map(|prepare| prepare.flags)
            .collect();
        assert_eq!(
            vec![
                PrepareFlags::TRANSACTION_BEGIN,
                PrepareFlags::DATA,
                PrepareFlags::TRANSACTION_END
            ],
            t
        );
        // A hard deleted stream keeps the transaction begin only.
        let x: Vec<_> = kept.iter().filter(|prepare| prepare.stream_id == "x").collect();
        assert_eq!(1, x.len());
        assert!(x[0].flags.contains(PrepareFlags::TRANSACTION_BEGIN));
        let commits: Vec<i64> = chunk
            .records()
            .filter_map(|record| match record.unwrap().record {
                LogRecord::Commit(commit) => Some(commit.transaction_position),
                _ => None,
            })
            .collect();
        assert!(commits.contains(&transactions[0]));
        Ok(())
    }

    #[test]
    fn test_light_chunk_is_skipped() -> Result<(), ScavengeError> {
        let db = MemoryChunkDb::new(4096);
        db.write_prepare(PrepareBuilder::new("a").event(event(0)))?;
        db.complete_chunk();
        let state = state();
        state.increase_chunk_weight(0, 1.0)?;
        let log = ScavengerLog::new(Arc::new(LoggingListener));
        let executor = ChunkExecutor {
            state: &state,
            chunk_manager: &db,
            log: &log,
            unsafe_ignore_hard_deletes: false,
        };
        let point = point(db.writer_checkpoint(), 1.0);
        executor.execute(&point, None, None, false, &CancellationToken::new())?;
        assert_eq!(0, log.chunks_scavenged());
        assert!(!db.completed_chunk(0).unwrap().is_scavenged());
        assert_eq!(1.0, state.sum_chunk_weights(0..=0)?);
        Ok(())
    }

    #[test]
    fn test_failed_switch_in_is_contained() -> Result<(), ScavengeError> {
        let db = MemoryChunkDb::new(4096);
        db.write_prepare(PrepareBuilder::new("a").event(event(0)))?;
        db.write_prepare(PrepareBuilder::new("a").expected_version(0).event(event(1)))?;
        db.complete_chunk();
        db.write_prepare(PrepareBuilder::new("a").expected_version(1).event(event(2)))?;
        db.complete_chunk();
        let chunks = db.completed_chunks();

        let mut manager = MockChunkManager::new();
        manager.expect_chunk_size().return_const(4096u64);
        manager
            .expect_completed_chunk()
            .returning(move |n| chunks.get(n as usize).cloned());
        manager
            .expect_switch_in()
            .returning(|_| Err(chunk::error::ChunkError::Internal("disk full".to_owned())));

        let state = state();
        set_discard_point(&state, "a", DiscardPoint::discard_before(2));
        let log = ScavengerLog::new(Arc::new(LoggingListener));
        let executor = ChunkExecutor {
            state: &state,
            chunk_manager: &manager,
            log: &log,
            unsafe_ignore_hard_deletes: false,
        };
        let point = point(db.writer_checkpoint(), -1.0);
        executor.execute(&point, None, None, true, &CancellationToken::new())?;
        assert_eq!(2, log.chunks_failed());
        assert_eq!(0, log.chunks_scavenged());
        Ok(())
    }

    #[test]
    fn test_index_entry_filter() -> Result<(), ScavengeError> {
        let state = state();
        set_discard_point(&state, "a", DiscardPoint::discard_before(5));
        state.detect_collisions("$$a")?;
        state.set_metastream_discard_point("$$a", DiscardPoint::discard_before(3))?;
        state.detect_collisions("t")?;
        state.set_original_stream_tombstone("t")?;

        let point = point(1000, 0.0);
        let filter = IndexEntryFilter {
            state: &state,
            scavenge_point: &point,
            unsafe_ignore_hard_deletes: false,
        };
        assert!(filter.should_discard("a", 4, 10)?);
        assert!(!filter.should_discard("a", 5, 10)?);
        assert!(!filter.should_discard("a", 4, 1000)?);
        assert!(filter.should_discard("$$a", 2, 10)?);
        assert!(!filter.should_discard("$$a", 3, 10)?);
        assert!(!filter.should_discard("t", i64::MAX, 10)?);
        assert!(!filter.should_discard("unknown", 0, 10)?);

        let filter = IndexEntryFilter {
            unsafe_ignore_hard_deletes: true,
            ..filter
        };
        assert!(filter.should_discard("t", i64::MAX, 10)?);
        Ok(())
    }
}
