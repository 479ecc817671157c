use std::fmt;

use log::debug;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScavengeStatus {
    #[default]
    Idle,
    Accumulating,
    Calculating,
    Executing,
    Merging,
    ExecutingIndex,
    Cleaning,
    Done,
    Stopped,
    Failed,
}

impl fmt::Display for ScavengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Observes the status of the scavenger.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait StatusTracker: Send + Sync {
    fn set_status(&self, status: ScavengeStatus);
}

/// Keeps the current status and every status reported so far.
#[derive(Debug, Default)]
pub struct MemoryStatusTracker {
    history: Mutex<Vec<ScavengeStatus>>,
}

impl MemoryStatusTracker {
    pub fn status(&self) -> ScavengeStatus {
        self.history.lock().last().copied().unwrap_or_default()
    }

    pub fn history(&self) -> Vec<ScavengeStatus> {
        self.history.lock().clone()
    }
}

impl StatusTracker for MemoryStatusTracker {
    fn set_status(&self, status: ScavengeStatus) {
        debug!("Scavenge status: {}", status);
        self.history.lock().push(status);
    }
}
