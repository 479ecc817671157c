use std::fmt;

/// Key of per-stream scavenge state.
///
/// A stream is keyed by the hash of its id unless that hash is known to be shared
/// with another stream, in which case it is keyed by its full id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamHandle {
    Hash(u64),
    Exact(String),
}

impl StreamHandle {
    pub fn is_hash(&self) -> bool {
        matches!(self, StreamHandle::Hash(_))
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamHandle::Hash(hash) => write!(f, "Hash: {:#018x}", hash),
            StreamHandle::Exact(stream_id) => write!(f, "Id: {}", stream_id),
        }
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
