//! Error types for expsim-core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExpsimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Run no longer accepts records")]
    ChannelClosed,

    #[error("Missing numeric config value: {0}")]
    MissingConfig(String),

    #[error("Run directory not found: {0}")]
    RunNotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ExpsimError>;
