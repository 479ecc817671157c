use std::sync::Arc;

use chunk::{Chunk, ChunkBuilder, ChunkManager};
use log::{error, info};
use model::scavenge::ScavengePoint;
use tokio_util::sync::CancellationToken;

use crate::{error::ScavengeError, notification::ScavengerLog};

/// Combines runs of adjacent small chunks into single chunks.
pub(crate) struct ChunkMerger<'a> {
    pub(crate) chunk_manager: &'a dyn ChunkManager,
    pub(crate) log: &'a ScavengerLog,
    pub(crate) max_chunk_data_size: u64,
}

impl<'a> ChunkMerger<'a> {
    /// Merge until no group of chunks fits into one.
    pub(crate) fn merge(
        &self,
        scavenge_point: &ScavengePoint,
        token: &CancellationToken,
    ) -> Result<(), ScavengeError> {
        loop {
            let mut merged = false;
            for group in self.groups(scavenge_point) {
                if token.is_cancelled() {
                    return Err(ScavengeError::Cancelled);
                }
                let (start, end) = match (group.first(), group.last()) {
                    (Some(first), Some(last)) => (first.start_number(), last.end_number()),
                    _ => continue,
                };
                match self.merge_group(&group) {
                    Ok(space_saved) => {
                        merged = true;
                        self.log.chunks_merged(start, end, space_saved);
                    }
                    Err(e) => {
                        error!("Failed to merge chunks #{}-{}: {}", start, end, e);
                        self.log.chunks_not_merged(start, end, e.to_string());
                    }
                }
            }
            if !merged {
                return Ok(());
            }
        }
    }

    /// Runs of at least two adjacent chunks below the scavenge point whose data fits
    /// into one chunk.
    fn groups(&self, scavenge_point: &ScavengePoint) -> Vec<Vec<Arc<Chunk>>> {
        let mut groups = vec![];
        let mut group: Vec<Arc<Chunk>> = vec![];
        let mut total = 0;
        for chunk in self
            .chunk_manager
            .completed_chunks()
            .into_iter()
            .filter(|chunk| chunk.header().end_position() <= scavenge_point.position)
        {
            let size = chunk.physical_data_size();
            let adjacent = group
                .last()
                .map_or(false, |last| last.end_number() + 1 == chunk.start_number());
            if adjacent && total + size <= self.max_chunk_data_size {
                total += size;
                group.push(chunk);
                continue;
            }
            if group.len() > 1 {
                groups.push(std::mem::take(&mut group));
            }
            total = size;
            group = vec![chunk];
        }
        if group.len() > 1 {
            groups.push(group);
        }
        groups
    }

    fn merge_group(&self, group: &[Arc<Chunk>]) -> Result<i64, ScavengeError> {
        let (first, last) = match (group.first(), group.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(0),
        };
        let mut builder = ChunkBuilder::new(
            first.start_number(),
            last.end_number(),
            first.header().chunk_size,
            true,
        );
        let mut old_size = 0;
        for chunk in group {
            old_size += chunk.physical_data_size() as i64;
            for record in chunk.records() {
                let record = record?;
                builder.append_raw(record.record.log_position(), &record.raw)?;
            }
        }
        let new_size = builder.physical_data_size() as i64;
        self.chunk_manager.switch_in(builder.complete())?;
        info!(
            "Merged {} chunks into #{}-{}, {} bytes",
            group.len(),
            first.start_number(),
            last.end_number(),
            new_size
        );
        Ok(old_size - new_size)
    }
}
