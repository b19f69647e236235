use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Error type for the write engine, the query translator and the storage backends.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Query end precedes query start (both in seconds).
    #[error("Invalid time range: start={start}, end={end}")]
    InvalidRange { start: i64, end: i64 },

    /// A configuration value makes an operation impossible (e.g. zero max samples).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    /// Malformed remote write/read payload.
    #[error("Decode Error: {0}")]
    Decode(String),

    #[error("Encode Error: {0}")]
    Encode(String),

    /// The storage backend rejected a begin/insert/commit/query call.
    #[error("Backend error during {step}: {message}")]
    Backend { step: &'static str, message: String },

    /// A single result row could not be scanned.
    #[error("Row decode error: {0}")]
    RowDecode(String),

    /// `submit` was called after the write engine was closed.
    #[error("Write engine is closed")]
    WriterClosed,

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP Error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub(crate) fn backend(step: &'static str, message: impl Into<String>) -> Self {
        BridgeError::Backend {
            step,
            message: message.into(),
        }
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for BridgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BridgeError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
