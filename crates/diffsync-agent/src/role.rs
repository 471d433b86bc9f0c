//! Role descriptors
//!
//! The two long-running processes, and where each keeps its lock and cursor.
//!
//! ```text
//! <diff_dir>/fetcher.lock     <diff_dir>/replication.seq    fetch cursor
//! <db_dir>/applier.lock       <db_dir>/applied.seq          apply cursor
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use diffsync_storage::Cursor;

use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Fetcher,
    Applier,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Fetcher, Role::Applier];

    pub fn name(&self) -> &'static str {
        match self {
            Role::Fetcher => "fetcher",
            Role::Applier => "applier",
        }
    }

    pub fn cursor_file_name(&self) -> &'static str {
        match self {
            Role::Fetcher => "replication.seq",
            Role::Applier => "applied.seq",
        }
    }

    pub fn lock_file_name(&self) -> String {
        format!("{}.lock", self.name())
    }

    /// Directory holding this role's cursor and lock.
    pub fn home<'a>(&self, config: &'a SyncConfig) -> &'a Path {
        match self {
            Role::Fetcher => &config.diff_dir,
            Role::Applier => &config.db_dir,
        }
    }

    pub fn cursor_path(&self, config: &SyncConfig) -> PathBuf {
        self.home(config).join(self.cursor_file_name())
    }

    pub fn lock_path(&self, config: &SyncConfig) -> PathBuf {
        self.home(config).join(self.lock_file_name())
    }

    pub fn cursor(&self, config: &SyncConfig) -> Cursor {
        Cursor::new(self.cursor_path(config))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
