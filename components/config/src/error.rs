use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("`{0}` must be positive")]
    NotPositive(&'static str),

    #[error("`{key}` is invalid: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("Directory `{0}` does not exist")]
    DirectoryNotExists(String),

    #[error("An IO error raised")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration")]
    Parse(#[from] serde_yaml::Error),
}
