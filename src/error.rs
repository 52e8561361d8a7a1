//! Error types for the telemetry history subsystem

use thiserror::Error;

/// Result type alias using HistoryError
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Maximum number of characters of an upstream response body kept for diagnostics
const BODY_SNIPPET_LIMIT: usize = 500;

/// Errors that can occur during history ingestion, storage and query
#[derive(Error, Debug)]
pub enum HistoryError {
    /// Site has no usable credentials in the directory
    #[error("Credential error: {0}")]
    Credentials(String),

    /// Upstream returned a non-success status
    #[error("Upstream request failed with status {status}: {body}")]
    Transport {
        /// HTTP status code returned by the upstream
        status: u16,
        /// Response body, truncated for diagnostics
        body: String,
    },

    /// Malformed JSON encountered inside a response stream
    #[error("Parse error: {0}")]
    Parse(String),

    /// A dispatched task exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Dispatcher queue for a key is at capacity
    #[error("Dispatch queue full for key '{key}' (capacity {capacity})")]
    QueueFull {
        /// Dispatch key whose queue rejected the submission
        key: String,
        /// Configured queue capacity
        capacity: usize,
    },

    /// Network or channel failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Partition or index file I/O failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),

    /// Invalid caller-supplied input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HistoryError {
    /// Create a credential error
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    /// Create a transport error, truncating the body for diagnostics
    pub fn transport(status: u16, body: &str) -> Self {
        let body = if body.chars().count() > BODY_SNIPPET_LIMIT {
            let mut snippet: String = body.chars().take(BODY_SNIPPET_LIMIT).collect();
            snippet.push_str("...");
            snippet
        } else {
            body.to_string()
        };
        Self::Transport { status, body }
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a queue-full error
    pub fn queue_full(key: impl Into<String>, capacity: usize) -> Self {
        Self::QueueFull {
            key: key.into(),
            capacity,
        }
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Generic(anyhow::anyhow!(msg.into()))
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether a caller-level retry of the whole run could plausibly succeed.
    /// The subsystem itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) | Self::QueueFull { .. } => true,
            Self::Transport { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Whether this error indicates bad or missing credentials
    pub fn is_auth_error(&self) -> bool {
        match self {
            Self::Credentials(_) => true,
            Self::Transport { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }
}

impl From<std::io::Error> for HistoryError {
    fn from(err: std::io::Error) -> Self {
        HistoryError::Storage(format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(err: serde_json::Error) -> Self {
        HistoryError::Parse(format!("JSON error: {err}"))
    }
}

impl From<reqwest::Error> for HistoryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HistoryError::Timeout(format!("Request timed out: {err}"))
        } else if err.is_connect() {
            HistoryError::Connection(format!("Connection failed: {err}"))
        } else {
            HistoryError::Connection(format!("HTTP error: {err}"))
        }
    }
}

impl From<chrono::ParseError> for HistoryError {
    fn from(err: chrono::ParseError) -> Self {
        HistoryError::InvalidInput(format!("Invalid timestamp: {err}"))
    }
}
