//! Error Types for diffsync Core
//!
//! ## Error Categories
//!
//! ### Identity Errors
//! - `SequenceOutOfRange`: a number does not fit the three-level shard layout
//! - `InvalidShardPath`: a path is not of the form `ddd/ddd/ddd`
//!
//! ### State File Errors
//! - `MissingStateKey`: a required key (`sequenceNumber`, `timestamp`) is absent
//! - `InvalidStateValue`: a key is present but its value does not parse

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Sequence number {0} is outside the shardable range")]
    SequenceOutOfRange(u64),

    #[error("Invalid shard path: {0}")]
    InvalidShardPath(String),

    #[error("State file is missing required key '{0}'")]
    MissingStateKey(&'static str),

    #[error("State file key '{key}' has invalid value '{value}'")]
    InvalidStateValue { key: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;
