//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### Integrity Errors
//! - `Integrity`: an artifact file exists but fails verification; callers
//!   treat it as absent
//!
//! ### Cursor Errors
//! - `CorruptCursor`: the persisted value is not a sequence number
//! - `CursorMissing`: a cursor that must exist (retention) does not
//!
//! ### Process Errors
//! - `LockHeld`: another live process owns the role's lock file
//!
//! ### I/O
//! - `Io`: any other filesystem failure
//! - `Join`: a blocking filesystem task panicked

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Integrity check failed for {path}: {reason}")]
    Integrity { path: PathBuf, reason: String },

    #[error("Cursor file {path} holds invalid value '{value}'")]
    CorruptCursor { path: PathBuf, value: String },

    #[error("Cursor file {0} does not exist")]
    CursorMissing(PathBuf),

    #[error("Lock {path} is held by running process {pid}")]
    LockHeld { path: PathBuf, pid: u32 },

    #[error("Core error: {0}")]
    Core(#[from] diffsync_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn integrity(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Integrity {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
