use chunk::{Chunk, ChunkManager};
use log::{debug, info, warn};
use model::{
    scavenge::{ChunkTimeStampRange, DiscardPoint, ScavengeCheckpoint, ScavengePoint},
    stream::{is_metastream, metastream_of, original_stream_of},
    LogRecord, PrepareRecord, StreamMetadata,
};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::{error::ScavengeError, index::IndexReader, state::ScavengeState};

/// Weight added to a chunk for each event that is certainly discardable.
pub(crate) const DISCARD_WEIGHT: f32 = 2.0;

/// Weight added to a chunk for each event that might be discardable.
pub(crate) const MAYBE_DISCARD_WEIGHT: f32 = 1.0;

/// Number of later metadata events inspected to decide whether one is out of order.
const METADATA_ORDERING_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct ChunkStats {
    originals: usize,
    metadata: usize,
    tombstones: usize,
}

/// Reads the chunks written since the previous scavenge point and records stream
/// metadata, tombstones, collisions, chunk time ranges and metadata weights.
pub(crate) struct Accumulator<'a> {
    pub(crate) state: &'a ScavengeState,
    pub(crate) chunk_manager: &'a dyn ChunkManager,
    pub(crate) index_reader: &'a dyn IndexReader,
    pub(crate) metastream_max_count: i64,
}

impl<'a> Accumulator<'a> {
    /// Accumulate every completed chunk below the scavenge point after `done`.
    ///
    /// Each chunk is processed in a transaction committed with the checkpoint that
    /// marks it done.
    pub(crate) fn accumulate(
        &self,
        scavenge_point: &ScavengePoint,
        done: Option<u32>,
        token: &CancellationToken,
    ) -> Result<(), ScavengeError> {
        let chunk_size = self.chunk_manager.chunk_size();
        let mut logical_chunk_number = done.map_or(0, |done| done + 1);
        info!(
            "Accumulating from chunk #{} up to position {}",
            logical_chunk_number, scavenge_point.position
        );

        while let Some(chunk) = self.chunk_manager.completed_chunk(logical_chunk_number) {
            if chunk.header().end_position() > scavenge_point.position {
                break;
            }
            if token.is_cancelled() {
                return Err(ScavengeError::Cancelled);
            }

            let from_position = logical_chunk_number as i64 * chunk_size as i64;
            let stats = self.state.transaction(|| {
                let stats = self.accumulate_chunk(&chunk, from_position, scavenge_point)?;
                let checkpoint = ScavengeCheckpoint::Accumulating {
                    scavenge_point: scavenge_point.clone(),
                    done_logical_chunk_number: Some(chunk.end_number()),
                };
                Ok::<_, ScavengeError>((stats, checkpoint))
            })?;
            debug!(
                "Accumulated chunk #{}-{}: {:?}",
                chunk.start_number(),
                chunk.end_number(),
                stats
            );
            logical_chunk_number = chunk.end_number() + 1;
        }
        Ok(())
    }

    fn accumulate_chunk(
        &self,
        chunk: &Chunk,
        from_position: i64,
        scavenge_point: &ScavengePoint,
    ) -> Result<ChunkStats, ScavengeError> {
        let chunk_size = self.chunk_manager.chunk_size() as i64;
        let mut stats = ChunkStats::default();
        let mut ranges: FxHashMap<u32, ChunkTimeStampRange> = FxHashMap::default();

        // Transaction position -> first event number.
        let mut commits: FxHashMap<i64, i64> = FxHashMap::default();
        for record in chunk.records() {
            if let LogRecord::Commit(commit) = record?.record {
                commits.insert(commit.transaction_position, commit.first_event_number);
            }
        }

        for record in chunk.records() {
            let record = record?;
            let prepare = match record.record {
                LogRecord::Prepare(prepare) if prepare.log_position >= from_position => prepare,
                _ => continue,
            };

            let logical_chunk_number = (prepare.log_position / chunk_size) as u32;
            ranges
                .entry(logical_chunk_number)
                .and_modify(|range| range.extend(prepare.timestamp))
                .or_insert_with(|| ChunkTimeStampRange::new(prepare.timestamp));

            if prepare.is_tombstone() {
                self.process_tombstone(&prepare, scavenge_point)?;
                stats.tombstones += 1;
            } else if is_metastream(&prepare.stream_id) {
                let first_event_number = if prepare.is_committed() {
                    Some(prepare.first_event_number())
                } else {
                    commits
                        .get(&prepare.transaction_position)
                        .map(|first| first + prepare.transaction_offset as i64)
                };
                self.process_metadata(&prepare, first_event_number, scavenge_point)?;
                stats.metadata += 1;
            } else {
                self.state.detect_collisions(&prepare.stream_id)?;
                stats.originals += 1;
            }
        }

        for (logical_chunk_number, range) in ranges {
            self.state
                .set_chunk_time_stamp_range(logical_chunk_number, &range)?;
        }
        Ok(stats)
    }

    fn process_metadata(
        &self,
        prepare: &PrepareRecord,
        first_event_number: Option<i64>,
        scavenge_point: &ScavengePoint,
    ) -> Result<(), ScavengeError> {
        let metastream_id = prepare.stream_id.as_str();
        let original_stream_id = original_stream_of(metastream_id).unwrap_or_default();
        self.state.detect_collisions(original_stream_id)?;
        self.state.detect_collisions(metastream_id)?;

        let first_event_number = match first_event_number {
            Some(first_event_number) => first_event_number,
            None => {
                warn!(
                    "Ignoring metadata of a transaction not committed in its chunk: {} at {}",
                    metastream_id, prepare.log_position
                );
                return Ok(());
            }
        };

        for (i, event) in prepare.events.iter().enumerate() {
            let event_number = first_event_number + i as i64;
            let log_position = prepare.event_log_position(i);
            let (in_order, replaced) = self.check_metadata_ordering(
                metastream_id,
                event_number,
                log_position,
                scavenge_point,
            )?;

            if let Some(position) = replaced {
                self.increase_weight_at(position, DISCARD_WEIGHT)?;
            }
            if !in_order {
                info!(
                    "Out of order metadata {}:{} is ignored",
                    metastream_id, event_number
                );
                continue;
            }

            // Metadata of a metastream does not configure the metastream.
            if !is_metastream(original_stream_id) {
                self.state.set_original_stream_metadata(
                    original_stream_id,
                    &StreamMetadata::from_slice(&event.data),
                )?;
            }

            let discard_point =
                DiscardPoint::discard_before(event_number - self.metastream_max_count + 1);
            if !discard_point.is_keep_all() {
                self.state
                    .set_metastream_discard_point(metastream_id, discard_point)?;
            }
        }
        Ok(())
    }

    /// Whether the metadata event is in order, and the position of the event it replaces
    /// or, when out of order, its own position.
    fn check_metadata_ordering(
        &self,
        metastream_id: &str,
        event_number: i64,
        log_position: i64,
        scavenge_point: &ScavengePoint,
    ) -> Result<(bool, Option<i64>), ScavengeError> {
        let from = if event_number == 0 { 0 } else { event_number - 1 };
        let infos = self.index_reader.read_event_infos_forward(
            metastream_id,
            from,
            METADATA_ORDERING_WINDOW,
            scavenge_point,
        )?;

        let in_order = !infos
            .iter()
            .any(|info| info.log_position < log_position && info.event_number >= event_number);
        if !in_order {
            return Ok((false, Some(log_position)));
        }
        let replaced = infos
            .first()
            .filter(|info| info.event_number < event_number && info.log_position < log_position)
            .map(|info| info.log_position);
        Ok((true, replaced))
    }

    fn process_tombstone(
        &self,
        prepare: &PrepareRecord,
        scavenge_point: &ScavengePoint,
    ) -> Result<(), ScavengeError> {
        let stream_id = prepare.stream_id.as_str();
        self.state.detect_collisions(stream_id)?;
        if is_metastream(stream_id) {
            return Err(ScavengeError::Internal(format!(
                "Tombstone found in metastream {}",
                stream_id
            )));
        }

        self.state.set_original_stream_tombstone(stream_id)?;
        let metastream_id = metastream_of(stream_id);
        self.state.detect_collisions(&metastream_id)?;
        self.state.set_metastream_tombstone(&metastream_id)?;

        // No metadata follows a tombstone, so the last metadata event becomes discardable.
        if let Some(last) = self
            .index_reader
            .last_event_number(&metastream_id, scavenge_point)?
        {
            let infos =
                self.index_reader
                    .read_event_infos_forward(&metastream_id, last, 1, scavenge_point)?;
            for info in infos {
                self.increase_weight_at(info.log_position, DISCARD_WEIGHT)?;
            }
        }
        Ok(())
    }

    fn increase_weight_at(&self, log_position: i64, delta: f32) -> Result<(), ScavengeError> {
        let logical_chunk_number = (log_position / self.chunk_manager.chunk_size() as i64) as u32;
        self.state
            .increase_chunk_weight(logical_chunk_number, delta)?;
        Ok(())
    }
}
