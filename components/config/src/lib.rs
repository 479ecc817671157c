use error::ConfigurationError;
use log::info;
use serde::{Deserialize, Serialize};
pub mod error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scavenge {
    /// Number of newest metadata events retained in each metastream.
    #[serde(rename = "metastream-max-count")]
    pub metastream_max_count: i64,

    /// Chunks whose weight does not exceed this value are left as they are.
    /// A negative value forces every sealed chunk to be rewritten.
    #[serde(rename = "chunk-execution-threshold")]
    pub chunk_execution_threshold: f32,

    /// Number of streams whose discard points are committed in one transaction.
    #[serde(rename = "calculation-batch-size")]
    pub calculation_batch_size: usize,

    #[serde(rename = "hash-users-cache-capacity")]
    pub hash_users_cache_capacity: usize,

    /// Drop tombstones together with the rest of a hard deleted stream.
    #[serde(rename = "unsafe-ignore-hard-deletes", default)]
    pub unsafe_ignore_hard_deletes: bool,

    /// Whether cleaning also removes state of archived streams.
    #[serde(rename = "delete-archived", default)]
    pub delete_archived: bool,
}

impl Default for Scavenge {
    fn default() -> Self {
        Self {
            metastream_max_count: 1,
            chunk_execution_threshold: 0.0,
            calculation_batch_size: 128,
            hash_users_cache_capacity: 100_000,
            unsafe_ignore_hard_deletes: false,
            delete_archived: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Logical size of a chunk in bytes.
    #[serde(rename = "chunk-size")]
    pub chunk_size: u64,

    /// Upper bound of physical data held by a merged chunk. Defaults to `chunk-size`.
    #[serde(rename = "max-chunk-data-size", default)]
    pub max_chunk_data_size: Option<u64>,
}

impl Chunk {
    pub fn max_chunk_data_size(&self) -> u64 {
        self.max_chunk_data_size.unwrap_or(self.chunk_size)
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024 * 1024,
            max_chunk_data_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    #[serde(rename = "memory")]
    Memory,

    #[serde(rename = "rocksdb")]
    RocksDB,
}

/// Where scavenge state lives between passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub backend: Backend,

    /// Directory of the RocksDB backend. Ignored by the memory backend.
    pub path: String,

    #[serde(rename = "mkdirs-if-missing")]
    pub mkdirs_if_missing: bool,
}

impl State {
    pub fn path(&self) -> &std::path::Path {
        std::path::Path::new(&self.path)
    }
}

impl Default for State {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            path: "/tmp/scavenge/state".to_owned(),
            mkdirs_if_missing: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub scavenge: Scavenge,

    #[serde(default)]
    pub chunk: Chunk,

    #[serde(default)]
    pub state: State,
}

impl Configuration {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigurationError> {
        let mut config: Configuration = serde_yaml::from_str(content)?;
        config.check_and_apply()?;
        Ok(config)
    }

    /// Check and apply the configuration.
    ///
    /// While applying configuration, the directory of the RocksDB backend is potentially created.
    pub fn check_and_apply(&mut self) -> Result<(), ConfigurationError> {
        if self.scavenge.metastream_max_count <= 0 {
            return Err(ConfigurationError::NotPositive("metastream-max-count"));
        }

        if self.scavenge.calculation_batch_size == 0 {
            return Err(ConfigurationError::NotPositive("calculation-batch-size"));
        }

        if self.scavenge.hash_users_cache_capacity == 0 {
            return Err(ConfigurationError::NotPositive("hash-users-cache-capacity"));
        }

        if self.chunk.chunk_size == 0 {
            return Err(ConfigurationError::NotPositive("chunk-size"));
        }

        if self.scavenge.chunk_execution_threshold.is_nan() {
            return Err(ConfigurationError::InvalidValue {
                key: "chunk-execution-threshold",
                reason: "NaN".to_owned(),
            });
        }

        match self.chunk.max_chunk_data_size {
            Some(0) => return Err(ConfigurationError::NotPositive("max-chunk-data-size")),
            Some(size) if size > self.chunk.chunk_size => {
                return Err(ConfigurationError::InvalidValue {
                    key: "max-chunk-data-size",
                    reason: format!("{} exceeds chunk-size {}", size, self.chunk.chunk_size),
                });
            }
            Some(_) => {}
            None => self.chunk.max_chunk_data_size = Some(self.chunk.chunk_size),
        }

        if self.state.backend == Backend::RocksDB {
            let path = self.state.path();
            if !path.exists() {
                if !self.state.mkdirs_if_missing {
                    return Err(ConfigurationError::DirectoryNotExists(self.state.path.clone()));
                }
                info!("Create directory: {:?}", path);
                std::fs::create_dir_all(path)?;
            }
        }
        Ok(())
    }
}
