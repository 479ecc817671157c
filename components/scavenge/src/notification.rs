use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicI64, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{error, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use uuid::Uuid;

use crate::error::ScavengeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScavengeResult {
    Success,
    Stopped,
    Failed,
}

impl fmt::Display for ScavengeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScavengeEvent {
    Started {
        scavenge_id: Uuid,
    },
    ChunkScavenged {
        chunk_start: u32,
        chunk_end: u32,
        scavenged: bool,
        space_saved: i64,
        error: Option<String>,
    },
    Merged {
        chunk_start: u32,
        chunk_end: u32,
        merged: bool,
        space_saved: i64,
        error: Option<String>,
    },
    IndexScavenged {
        entries_deleted: u64,
        error: Option<String>,
    },
    Completed {
        result: ScavengeResult,
        error: Option<String>,
        elapsed: Duration,
        space_saved: i64,
    },
}

/// Receives progress of a scavenge as it happens.
///
/// Failures of a listener, including panics, never affect the scavenge.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait ScavengeListener: Send + Sync {
    fn on_event(&self, event: &ScavengeEvent) -> Result<(), ScavengeError>;
}

/// Listener that only logs.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl ScavengeListener for LoggingListener {
    fn on_event(&self, event: &ScavengeEvent) -> Result<(), ScavengeError> {
        info!("{:?}", event);
        Ok(())
    }
}

/// Statistics of one scavenge, forwarded to the listener as they change.
pub(crate) struct ScavengerLog {
    scavenge_id: Uuid,
    listener: Arc<dyn ScavengeListener>,
    space_saved: AtomicI64,
    chunks_scavenged: AtomicU32,
    chunks_failed: AtomicU32,
}

impl ScavengerLog {
    pub(crate) fn new(listener: Arc<dyn ScavengeListener>) -> Self {
        Self {
            scavenge_id: Uuid::new_v4(),
            listener,
            space_saved: AtomicI64::new(0),
            chunks_scavenged: AtomicU32::new(0),
            chunks_failed: AtomicU32::new(0),
        }
    }

    pub(crate) fn scavenge_id(&self) -> Uuid {
        self.scavenge_id
    }

    pub(crate) fn space_saved(&self) -> i64 {
        self.space_saved.load(Ordering::Relaxed)
    }

    pub(crate) fn chunks_scavenged(&self) -> u32 {
        self.chunks_scavenged.load(Ordering::Relaxed)
    }

    pub(crate) fn chunks_failed(&self) -> u32 {
        self.chunks_failed.load(Ordering::Relaxed)
    }

    /// Carry over failures of the pass recorded before it was resumed.
    pub(crate) fn restore_failures(&self, chunks_failed: u32) {
        self.chunks_failed.store(chunks_failed, Ordering::Relaxed);
    }

    pub(crate) fn started(&self) {
        info!("Scavenge {} started", self.scavenge_id);
        self.notify(ScavengeEvent::Started {
            scavenge_id: self.scavenge_id,
        });
    }

    pub(crate) fn chunk_scavenged(&self, chunk_start: u32, chunk_end: u32, space_saved: i64) {
        self.space_saved.fetch_add(space_saved, Ordering::Relaxed);
        self.chunks_scavenged.fetch_add(1, Ordering::Relaxed);
        self.notify(ScavengeEvent::ChunkScavenged {
            chunk_start,
            chunk_end,
            scavenged: true,
            space_saved,
            error: None,
        });
    }

    pub(crate) fn chunk_not_scavenged(
        &self,
        chunk_start: u32,
        chunk_end: u32,
        error: Option<String>,
    ) {
        if error.is_some() {
            self.chunks_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.notify(ScavengeEvent::ChunkScavenged {
            chunk_start,
            chunk_end,
            scavenged: false,
            space_saved: 0,
            error,
        });
    }

    pub(crate) fn chunks_merged(&self, chunk_start: u32, chunk_end: u32, space_saved: i64) {
        self.space_saved.fetch_add(space_saved, Ordering::Relaxed);
        self.notify(ScavengeEvent::Merged {
            chunk_start,
            chunk_end,
            merged: true,
            space_saved,
            error: None,
        });
    }

    pub(crate) fn chunks_not_merged(&self, chunk_start: u32, chunk_end: u32, error: String) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
        self.notify(ScavengeEvent::Merged {
            chunk_start,
            chunk_end,
            merged: false,
            space_saved: 0,
            error: Some(error),
        });
    }

    pub(crate) fn index_scavenged(&self, entries_deleted: u64, error: Option<String>) {
        self.notify(ScavengeEvent::IndexScavenged {
            entries_deleted,
            error,
        });
    }

    pub(crate) fn completed(
        &self,
        result: ScavengeResult,
        error: Option<String>,
        elapsed: Duration,
    ) {
        info!(
            "Scavenge {} completed with {}. Chunks scavenged: {}, failed: {}, \
             space saved: {} bytes, elapsed: {:?}",
            self.scavenge_id,
            result,
            self.chunks_scavenged(),
            self.chunks_failed(),
            self.space_saved(),
            elapsed
        );
        self.notify(ScavengeEvent::Completed {
            result,
            error,
            elapsed,
            space_saved: self.space_saved(),
        });
    }

    fn notify(&self, event: ScavengeEvent) {
        let listener = &self.listener;
        match catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Scavenge listener failed on {:?}: {}", event, e);
            }
            Err(_) => {
                error!("Scavenge listener panicked on {:?}", event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{
        MockScavengeListener, ScavengeEvent, ScavengeListener, ScavengeResult, ScavengerLog,
    };
    use crate::error::ScavengeError;

    #[test]
    fn test_statistics() {
        let mut listener = MockScavengeListener::new();
        listener.expect_on_event().times(5).returning(|_| Ok(()));
        let log = ScavengerLog::new(Arc::new(listener));
        log.started();
        log.chunk_scavenged(0, 0, 100);
        log.chunk_not_scavenged(1, 1, None);
        log.chunk_not_scavenged(2, 2, Some("broken".to_owned()));
        log.chunks_merged(0, 1, 20);
        assert_eq!(120, log.space_saved());
        assert_eq!(1, log.chunks_scavenged());
        assert_eq!(1, log.chunks_failed());
    }

    struct FaultyListener;

    impl ScavengeListener for FaultyListener {
        fn on_event(&self, event: &ScavengeEvent) -> Result<(), ScavengeError> {
            match event {
                ScavengeEvent::Started { .. } => {
                    Err(ScavengeError::Listener("rejected".to_owned()))
                }
                ScavengeEvent::Completed { .. } => panic!("listener bug"),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_listener_failures_are_swallowed() {
        ulog::try_init_log();
        let log = ScavengerLog::new(Arc::new(FaultyListener));
        log.started();
        log.chunk_scavenged(0, 0, 1);
        log.completed(ScavengeResult::Success, None, Duration::from_millis(5));
        assert_eq!(1, log.chunks_scavenged());
    }
}
