use log::info;
use model::scavenge::{CalculationStatus, OriginalStreamData, ScavengeCheckpoint, ScavengePoint};
use tokio_util::sync::CancellationToken;

use crate::{error::ScavengeError, state::ScavengeState};

/// Whether the discard range of a stream is fully realised once its chunks are executed.
///
/// Age and count limits keep moving as the stream grows, so only tombstones and
/// truncate-before limits ever complete.
fn is_spent(data: &OriginalStreamData) -> bool {
    data.status == CalculationStatus::Active
        && (data.is_tombstoned
            || (data.truncate_before.is_some()
                && data.max_age.is_none()
                && data.max_count.is_none()))
}

/// Removes state that no later pass needs.
pub(crate) struct Cleaner<'a> {
    pub(crate) state: &'a ScavengeState,
    pub(crate) delete_archived: bool,

    /// Carried over into the checkpoint.
    pub(crate) chunks_failed: u32,
}

impl<'a> Cleaner<'a> {
    pub(crate) fn clean(
        &self,
        scavenge_point: &ScavengePoint,
        token: &CancellationToken,
    ) -> Result<(), ScavengeError> {
        if token.is_cancelled() {
            return Err(ScavengeError::Cancelled);
        }
        if !self.state.all_chunks_executed()? {
            info!("Skip cleaning: some chunks are not executed yet");
            return Ok(());
        }

        let (spent, streams, metastreams) = self.state.transaction(|| {
            let mut spent = 0;
            for (handle, data) in self.state.all_original_streams()? {
                if is_spent(&data) {
                    self.state
                        .set_original_stream_status(&handle, CalculationStatus::Spent)?;
                    spent += 1;
                }
            }
            let streams = self.state.delete_original_stream_data(self.delete_archived)?;
            let metastreams = self.state.delete_metastream_data()?;
            let checkpoint = ScavengeCheckpoint::Cleaning {
                scavenge_point: scavenge_point.clone(),
                chunks_failed: self.chunks_failed,
            };
            Ok::<_, ScavengeError>(((spent, streams, metastreams), checkpoint))
        })?;
        info!(
            "Cleaned: {} streams spent, {} stream states and {} metastream states deleted",
            spent, streams, metastreams
        );
        Ok(())
    }
}
