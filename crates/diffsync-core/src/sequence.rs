//! Sequence Identity and Sharding
//!
//! A [`SequenceId`] names one diff in the producer's stream. On disk and on
//! the remote server every diff lives under a [`ShardPath`]: the ID split in
//! base 1000 into three zero-padded components, most significant first.
//!
//! ```text
//! 1234567  →  001 / 234 / 567
//!             └┬┘   └┬┘   └┬┘
//!      id / 1_000_000 │     id % 1000
//!            (id / 1000) % 1000
//! ```
//!
//! Each directory level therefore holds at most 1000 entries, and the layout
//! supports IDs `0 ..= 999_999_999`. [`SequenceId`] enforces that range on
//! construction, which keeps [`ShardPath::of`] total.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest sequence number representable in the shard layout.
pub const MAX_SEQUENCE_ID: u64 = 999_999_999;

const SHARD_BASE: u64 = 1000;

/// A dense, strictly ordered position in the replication stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct SequenceId(u64);

impl SequenceId {
    /// The "nothing processed yet" position.
    pub const ZERO: SequenceId = SequenceId(0);

    /// The last ID the shard layout can address.
    pub const MAX: SequenceId = SequenceId(MAX_SEQUENCE_ID);

    pub fn new(value: u64) -> Result<Self> {
        if value > MAX_SEQUENCE_ID {
            return Err(Error::SequenceOutOfRange(value));
        }
        Ok(Self(value))
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The following ID, or `None` at the end of the range.
    pub fn next(self) -> Option<Self> {
        if self.0 >= MAX_SEQUENCE_ID {
            None
        } else {
            Some(Self(self.0 + 1))
        }
    }

    /// Adds `n`, clamping at [`SequenceId::MAX`].
    pub fn saturating_add(self, n: u64) -> Self {
        Self(self.0.saturating_add(n).min(MAX_SEQUENCE_ID))
    }

    /// Subtracts `n`, returning `None` when the result would be zero or negative.
    pub fn positive_sub(self, n: u64) -> Option<Self> {
        match self.0.checked_sub(n) {
            Some(v) if v > 0 => Some(Self(v)),
            _ => None,
        }
    }

    /// Number of IDs in `(self, other]`, zero if `other <= self`.
    pub fn distance_to(self, other: SequenceId) -> u64 {
        other.0.saturating_sub(self.0)
    }

    pub fn shard_path(self) -> ShardPath {
        ShardPath::of(self)
    }
}

impl TryFrom<u64> for SequenceId {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SequenceId> for u64 {
    fn from(id: SequenceId) -> u64 {
        id.0
    }
}

impl FromStr for SequenceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidStateValue {
                key: crate::state_file::SEQUENCE_NUMBER_KEY,
                value: s.to_string(),
            });
        }
        let value: u64 = trimmed.parse().map_err(|_| Error::SequenceOutOfRange(u64::MAX))?;
        Self::new(value)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `top/mid/leaf` location of a sequence ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardPath {
    top: u16,
    mid: u16,
    leaf: u16,
}

impl ShardPath {
    pub fn of(id: SequenceId) -> Self {
        let v = id.get();
        Self {
            top: (v / (SHARD_BASE * SHARD_BASE)) as u16,
            mid: ((v / SHARD_BASE) % SHARD_BASE) as u16,
            leaf: (v % SHARD_BASE) as u16,
        }
    }

    /// Builds a path from its three components, each in `0..1000`.
    pub fn from_components(top: u16, mid: u16, leaf: u16) -> Result<Self> {
        if [top, mid, leaf].iter().any(|&c| u64::from(c) >= SHARD_BASE) {
            return Err(Error::InvalidShardPath(format!("{top}/{mid}/{leaf}")));
        }
        Ok(Self { top, mid, leaf })
    }

    /// Inverse of [`ShardPath::of`].
    pub fn id(&self) -> SequenceId {
        SequenceId(
            u64::from(self.top) * SHARD_BASE * SHARD_BASE
                + u64::from(self.mid) * SHARD_BASE
                + u64::from(self.leaf),
        )
    }

    pub fn top(&self) -> u16 {
        self.top
    }

    pub fn mid(&self) -> u16 {
        self.mid
    }

    pub fn leaf(&self) -> u16 {
        self.leaf
    }

    /// Directory holding this ID's files, relative to the store root (`001/234`).
    pub fn dir(&self) -> PathBuf {
        PathBuf::from(format!("{:03}", self.top)).join(format!("{:03}", self.mid))
    }

    /// The leaf component used as the file stem (`567`).
    pub fn file_stem(&self) -> String {
        format!("{:03}", self.leaf)
    }

    /// Parses `ddd/ddd/ddd`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let (Some(top), Some(mid), Some(leaf), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidShardPath(s.to_string()));
        };
        match (
            parse_component(top),
            parse_component(mid),
            parse_component(leaf),
        ) {
            (Some(top), Some(mid), Some(leaf)) => Ok(Self { top, mid, leaf }),
            _ => Err(Error::InvalidShardPath(s.to_string())),
        }
    }
}

impl fmt::Display for ShardPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}/{:03}/{:03}", self.top, self.mid, self.leaf)
    }
}

/// Parses one shard component: exactly three ASCII digits.
pub fn parse_component(s: &str) -> Option<u16> {
    if s.len() != 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
