//! Error types for the diffsync agent processes
//!
//! ## Error Categories
//!
//! ### Fatal
//! - `Configuration`: the producer was never reachable, or settings are invalid
//! - `Migration`: the one-time schema migration failed
//!
//! ### Handled By Retry
//! - `Fetch`: a transport failure, categorised by [`FetchError::reason`]
//! - `PartialBatch`: some requested artifacts did not publish
//! - `ApplyTool`: the external apply tool exited non-zero
//! - `Storage`: an artifact failed verification or the disk misbehaved
//!
//! ### Cooperative
//! - `Shutdown`: a termination request; loop entry points turn it into `Ok(())`

use std::path::PathBuf;

use diffsync_core::Batch;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] diffsync_storage::Error),

    #[error("Core error: {0}")]
    Core(#[from] diffsync_core::Error),

    #[error("Batch {batch} incomplete: {failed} of {requested} artifacts not published")]
    PartialBatch {
        batch: Batch,
        requested: u64,
        failed: u64,
    },

    #[error("Apply tool failed: {0}")]
    ApplyTool(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Shutdown requested")]
    Shutdown,
}

impl AgentError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, AgentError::Shutdown)
    }
}

/// A failed HTTP transfer.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Timed out fetching {url}")]
    Timeout { url: String },

    #[error("Could not connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Failed reading body of {url}: {message}")]
    Body { url: String, message: String },

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Failed writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer of {url} cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    /// Short category used in log fields.
    pub fn reason(&self) -> &'static str {
        match self {
            FetchError::Timeout { .. } => "timeout",
            FetchError::Connect { .. } => "connect",
            FetchError::Status { .. } => "status",
            FetchError::Body { .. } => "body",
            FetchError::Request { .. } => "request",
            FetchError::Io { .. } => "io",
            FetchError::Cancelled { .. } => "cancelled",
        }
    }

    /// Transient failures worth another attempt. Client errors (4xx) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout { .. }
            | FetchError::Connect { .. }
            | FetchError::Body { .. } => true,
            FetchError::Status { status, .. } => *status >= 500,
            FetchError::Request { .. } | FetchError::Io { .. } | FetchError::Cancelled { .. } => {
                false
            }
        }
    }

    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        let url = url.to_string();
        if err.is_timeout() {
            FetchError::Timeout { url }
        } else if err.is_connect() {
            FetchError::Connect {
                url,
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            FetchError::Status {
                url,
                status: status.as_u16(),
            }
        } else if err.is_body() || err.is_decode() {
            FetchError::Body {
                url,
                message: err.to_string(),
            }
        } else {
            FetchError::Request {
                url,
                message: err.to_string(),
            }
        }
    }
}
