use std::fmt;

/// Events numbered below the discard point may be removed from the log.
///
/// Stored as the number of the first event to keep, so `KEEP_ALL` is `DiscardBefore(0)`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiscardPoint(i64);

impl DiscardPoint {
    pub const KEEP_ALL: DiscardPoint = DiscardPoint(0);

    pub fn discard_before(event_number: i64) -> Self {
        Self(event_number.max(0))
    }

    pub fn discard_including(event_number: i64) -> Self {
        Self::discard_before(event_number.saturating_add(1))
    }

    pub fn first_event_number_to_keep(&self) -> i64 {
        self.0
    }

    pub fn is_keep_all(&self) -> bool {
        self.0 == 0
    }

    pub fn should_discard(&self, event_number: i64) -> bool {
        event_number < self.0
    }

    /// The stricter of the two points.
    pub fn or(self, other: DiscardPoint) -> DiscardPoint {
        self.max(other)
    }
}

impl fmt::Debug for DiscardPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_keep_all() {
            write!(f, "KeepAll")
        } else {
            write!(f, "DiscardBefore({})", self.0)
        }
    }
}
