use xxhash_rust::xxh3::xxh3_64;

/// 64-bit hash of stream ids. State of a stream is keyed by this hash unless it collides.
pub trait LongHasher: Send + Sync {
    fn hash(&self, stream_id: &str) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct XxHasher;

impl LongHasher for XxHasher {
    fn hash(&self, stream_id: &str) -> u64 {
        xxh3_64(stream_id.as_bytes())
    }
}
