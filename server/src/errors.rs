//! Error types for the monitoring pipeline

use thiserror::Error;

/// Main error type for the monitoring pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The backing job store is unreachable. Callers must treat this as
    /// "job state unknown", never as "job failed".
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid scan options: {0}")]
    InvalidOptions(String),

    #[error("Upstream metrics source error: {0}")]
    Upstream(String),

    #[error("Scan job failed: {0}")]
    JobFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Scan already finished")]
    AlreadyFinished,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

impl From<redis::RedisError> for PipelineError {
    fn from(err: redis::RedisError) -> Self {
        PipelineError::StoreUnavailable(err.to_string())
    }
}
