use std::collections::BTreeMap;

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub event_number: i64,

    /// Log position of the event.
    pub log_position: i64,
}

/// In-memory table index: stream id -> event number -> log position.
#[derive(Debug, Default)]
pub struct StreamIndex {
    streams: RwLock<BTreeMap<String, BTreeMap<i64, i64>>>,
}

impl StreamIndex {
    pub fn add(&self, stream_id: &str, event_number: i64, log_position: i64) {
        let mut streams = self.streams.write();
        match streams.get_mut(stream_id) {
            Some(entries) => {
                entries.insert(event_number, log_position);
            }
            None => {
                let entries = BTreeMap::from([(event_number, log_position)]);
                streams.insert(stream_id.to_owned(), entries);
            }
        }
    }

    /// Number of the last event of `stream_id` written before `before_position`.
    pub fn last_event_number(&self, stream_id: &str, before_position: i64) -> Option<i64> {
        let streams = self.streams.read();
        streams.get(stream_id).and_then(|entries| {
            entries
                .iter()
                .rev()
                .find(|(_, position)| **position < before_position)
                .map(|(event_number, _)| *event_number)
        })
    }

    /// Entries of `stream_id` from `from_event_number` onwards, written before `before_position`.
    pub fn read_forward(
        &self,
        stream_id: &str,
        from_event_number: i64,
        max_count: usize,
        before_position: i64,
    ) -> Vec<IndexEntry> {
        let streams = self.streams.read();
        streams
            .get(stream_id)
            .map(|entries| {
                entries
                    .range(from_event_number..)
                    .filter(|(_, position)| **position < before_position)
                    .take(max_count)
                    .map(|(event_number, log_position)| IndexEntry {
                        event_number: *event_number,
                        log_position: *log_position,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.streams.read().keys().cloned().collect()
    }

    /// Keep only entries for which `keep` returns true. Returns the number of entries removed.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&str, &IndexEntry) -> bool,
    {
        let mut removed = 0;
        let mut streams = self.streams.write();
        for (stream_id, entries) in streams.iter_mut() {
            let before = entries.len();
            entries.retain(|event_number, log_position| {
                keep(
                    stream_id,
                    &IndexEntry {
                        event_number: *event_number,
                        log_position: *log_position,
                    },
                )
            });
            removed += before - entries.len();
        }
        streams.retain(|_, entries| !entries.is_empty());
        removed
    }

    pub fn len(&self) -> usize {
        self.streams.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
