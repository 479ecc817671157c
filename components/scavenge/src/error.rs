use chunk::error::ChunkError;
use store::error::MapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScavengeError {
    #[error("Scavenge state error: {0}")]
    State(#[from] MapError),

    #[error("Chunk error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Scavenge is cancelled")]
    Cancelled,

    #[error("A scavenge is already running")]
    AlreadyRunning,

    #[error("Scavenge driver has shut down")]
    Shutdown,

    #[error("Listener failed: {0}")]
    Listener(String),

    #[error("Internal error: `{0}`")]
    Internal(String),
}
