//! Producer State Files
//!
//! Every diff is published together with a small text file of `key=value`
//! lines describing it, and the producer's root `state.txt` uses the same
//! format to announce its latest sequence number:
//!
//! ```text
//! #Sat Mar 02 10:15:04 UTC 2024
//! sequenceNumber=5934012
//! timestamp=2024-03-02T10\:14\:58Z
//! ```
//!
//! Lines starting with `#` are comments. Values escape `:` as `\:` (the
//! producer writes Java properties files); [`StateFile::parse`] unescapes
//! them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::sequence::SequenceId;

pub const SEQUENCE_NUMBER_KEY: &str = "sequenceNumber";
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Keys a diff's metadata file must carry to be considered valid.
pub const REQUIRED_KEYS: [&str; 2] = [SEQUENCE_NUMBER_KEY, TIMESTAMP_KEY];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateFile {
    entries: BTreeMap<String, String>,
}

impl StateFile {
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), unescape(value.trim())))
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// True when every key in [`REQUIRED_KEYS`] is present and non-empty.
    pub fn has_required_keys(&self) -> bool {
        REQUIRED_KEYS
            .iter()
            .all(|key| self.get(key).is_some_and(|v| !v.is_empty()))
    }

    pub fn sequence_number(&self) -> Result<SequenceId> {
        let raw = self
            .get(SEQUENCE_NUMBER_KEY)
            .ok_or(Error::MissingStateKey(SEQUENCE_NUMBER_KEY))?;
        raw.parse().map_err(|_| Error::InvalidStateValue {
            key: SEQUENCE_NUMBER_KEY,
            value: raw.to_string(),
        })
    }

    /// The unescaped `timestamp` value, used verbatim as the apply version.
    pub fn timestamp_raw(&self) -> Result<&str> {
        match self.get(TIMESTAMP_KEY) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(Error::MissingStateKey(TIMESTAMP_KEY)),
        }
    }

    pub fn timestamp(&self) -> Result<DateTime<Utc>> {
        let raw = self.timestamp_raw()?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| Error::InvalidStateValue {
                key: TIMESTAMP_KEY,
                value: raw.to_string(),
            })
    }
}

/// Properties-style escapes: `\t`, `\n`, `\r` and `\f` map to their control
/// characters, any other `\<c>` to `<c>`.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('t') => out.push('\t'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('f') => out.push('\u{c}'),
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
