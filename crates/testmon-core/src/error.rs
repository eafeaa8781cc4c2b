//! Error types for the monitoring core.
//!
//! Only configuration conflicts and local-store failures are fatal. Remote
//! failures never surface here: the remote sink degrades itself instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("local store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type MonitorResult<T> = Result<T, MonitorError>;
