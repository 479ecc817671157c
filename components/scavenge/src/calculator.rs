use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use model::scavenge::{
    CalculationStatus, ChunkTimeStampRange, DiscardPoint, OriginalStreamData, ScavengeCheckpoint,
    ScavengePoint, StreamHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    accumulator::{DISCARD_WEIGHT, MAYBE_DISCARD_WEIGHT},
    error::ScavengeError,
    index::IndexReader,
    state::ScavengeState,
};

/// Number of event infos read from the index at a time.
const SLICE_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiscardDecision {
    Discard,
    MaybeDiscard,
    Keep,
}

/// Decide the fate of one event of an original stream.
///
/// The last event of a stream is always kept, so a stream never appears empty to
/// readers. A tombstone is the last event of its stream.
pub(crate) fn decide_event(
    data: &OriginalStreamData,
    event_number: i64,
    last_event_number: i64,
    time_stamp_range: Option<ChunkTimeStampRange>,
    effective_now: DateTime<Utc>,
) -> DiscardDecision {
    if event_number >= last_event_number {
        return DiscardDecision::Keep;
    }
    if data.is_tombstoned {
        return DiscardDecision::Discard;
    }
    if data.truncate_before.map_or(false, |tb| event_number < tb) {
        return DiscardDecision::Discard;
    }
    if data
        .max_count
        .map_or(false, |max_count| event_number <= last_event_number.saturating_sub(max_count))
    {
        return DiscardDecision::Discard;
    }
    if let Some(max_age) = data.max_age {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|max_age| effective_now.checked_sub_signed(max_age));
        return match (time_stamp_range, cutoff) {
            (Some(range), Some(cutoff)) if range.max < cutoff => DiscardDecision::Discard,
            (Some(range), Some(cutoff)) if range.min >= cutoff => DiscardDecision::Keep,
            (Some(_), Some(_)) => DiscardDecision::MaybeDiscard,
            _ => DiscardDecision::Keep,
        };
    }
    DiscardDecision::Keep
}

/// Turns accumulated metadata into discard points of original streams and weighs the
/// chunks holding the discardable events.
pub(crate) struct Calculator<'a> {
    pub(crate) state: &'a ScavengeState,
    pub(crate) index_reader: &'a dyn IndexReader,
    pub(crate) chunk_size: u64,
    pub(crate) batch_size: usize,
}

impl<'a> Calculator<'a> {
    pub(crate) fn calculate(
        &self,
        scavenge_point: &ScavengePoint,
        done: Option<StreamHandle>,
        token: &CancellationToken,
    ) -> Result<(), ScavengeError> {
        info!("Calculating discard points from {:?}", done);
        let mut done = done;
        let mut total = 0;
        loop {
            if token.is_cancelled() {
                return Err(ScavengeError::Cancelled);
            }
            let batch = self
                .state
                .original_streams_to_calculate(done.as_ref(), self.batch_size)?;
            let last = match batch.last() {
                Some((handle, _)) => handle.clone(),
                None => break,
            };

            self.state.transaction(|| {
                for (handle, data) in &batch {
                    self.calculate_stream(handle, data, scavenge_point)?;
                }
                let checkpoint = ScavengeCheckpoint::Calculating {
                    scavenge_point: scavenge_point.clone(),
                    done_stream_handle: Some(last.clone()),
                };
                Ok::<_, ScavengeError>(((), checkpoint))
            })?;
            total += batch.len();
            debug!("Calculated {} streams, {} in total", batch.len(), total);
            done = Some(last);
        }
        info!("Calculated discard points of {} streams", total);
        Ok(())
    }

    fn calculate_stream(
        &self,
        handle: &StreamHandle,
        data: &OriginalStreamData,
        scavenge_point: &ScavengePoint,
    ) -> Result<(), ScavengeError> {
        let stream_id = self.state.resolver().stream_id_of(handle)?;
        let (discard_point, maybe_discard_point) = match stream_id {
            Some(stream_id) => self.calculate_discard_points(&stream_id, data, scavenge_point)?,
            None => {
                warn!("No stream id is known for {}", handle);
                (DiscardPoint::KEEP_ALL, DiscardPoint::KEEP_ALL)
            }
        };

        // Discard points never move backwards.
        let discard_point = discard_point.max(data.discard_point);
        let maybe_discard_point = maybe_discard_point.max(data.maybe_discard_point);
        if discard_point != data.discard_point
            || maybe_discard_point != data.maybe_discard_point
            || data.status != CalculationStatus::Active
        {
            debug!(
                "Stream {}: discard point {:?}, maybe discard point {:?}",
                handle, discard_point, maybe_discard_point
            );
            self.state.set_original_stream_discard_points(
                handle,
                CalculationStatus::Active,
                discard_point,
                maybe_discard_point,
            )?;
        }
        Ok(())
    }

    fn calculate_discard_points(
        &self,
        stream_id: &str,
        data: &OriginalStreamData,
        scavenge_point: &ScavengePoint,
    ) -> Result<(DiscardPoint, DiscardPoint), ScavengeError> {
        let last_event_number = match self
            .index_reader
            .last_event_number(stream_id, scavenge_point)?
        {
            Some(last) => last,
            None => return Ok((DiscardPoint::KEEP_ALL, DiscardPoint::KEEP_ALL)),
        };

        let mut discard_point = DiscardPoint::KEEP_ALL;
        let mut maybe_discard_point = DiscardPoint::KEEP_ALL;
        let mut first = true;
        let mut from = 0;
        loop {
            let slice = self.index_reader.read_event_infos_forward(
                stream_id,
                from,
                SLICE_SIZE,
                scavenge_point,
            )?;

            for info in &slice {
                if first {
                    // Events before the first one in the index are gone already.
                    discard_point = DiscardPoint::discard_before(info.event_number);
                    maybe_discard_point = discard_point;
                    first = false;
                }

                let logical_chunk_number = (info.log_position / self.chunk_size as i64) as u32;
                let range = if data.max_age.is_some() {
                    self.state.chunk_time_stamp_range(logical_chunk_number)?
                } else {
                    None
                };
                match decide_event(
                    data,
                    info.event_number,
                    last_event_number,
                    range,
                    scavenge_point.effective_now,
                ) {
                    DiscardDecision::Discard => {
                        self.state
                            .increase_chunk_weight(logical_chunk_number, DISCARD_WEIGHT)?;
                        discard_point = DiscardPoint::discard_including(info.event_number);
                    }
                    DiscardDecision::MaybeDiscard => {
                        self.state
                            .increase_chunk_weight(logical_chunk_number, MAYBE_DISCARD_WEIGHT)?;
                        maybe_discard_point = DiscardPoint::discard_including(info.event_number);
                    }
                    DiscardDecision::Keep => {
                        return Ok((discard_point, maybe_discard_point.or(discard_point)));
                    }
                }
            }

            match slice.last() {
                Some(info) if slice.len() == SLICE_SIZE => from = info.event_number + 1,
                _ => break,
            }
        }

        if first {
            return Ok((DiscardPoint::KEEP_ALL, DiscardPoint::KEEP_ALL));
        }
        Err(ScavengeError::Internal(format!(
            "Every event of stream {} was found discardable",
            stream_id
        )))
    }
}
