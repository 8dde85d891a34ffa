//! Error types for Syncwright

use thiserror::Error;

/// Result type alias for Syncwright operations
pub type Result<T> = std::result::Result<T, SyncwrightError>;

/// Main error type for Syncwright
#[derive(Error, Debug)]
pub enum SyncwrightError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Capability not supported: {0}")]
    Capability(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Job cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncwrightError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncwrightError::Adapter(_)
                | SyncwrightError::AdapterUnavailable(_)
                | SyncwrightError::Sync(_)
                | SyncwrightError::Queue(_)
        )
    }

    /// Stable numeric code, used in CLI output and audit records
    pub fn code(&self) -> i64 {
        match self {
            SyncwrightError::NotFound(_) => -32001,
            SyncwrightError::InvalidInput(_) => -32602,
            SyncwrightError::AdapterUnavailable(_) => -32003,
            SyncwrightError::Capability(_) => -32004,
            SyncwrightError::Conflict(_) => -32005,
            SyncwrightError::Cancelled(_) => -32006,
            SyncwrightError::Config(_) | SyncwrightError::ConfigFile(_) => -32007,
            _ => -32000,
        }
    }
}
