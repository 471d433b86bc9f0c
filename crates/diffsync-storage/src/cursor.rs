//! Persisted Cursors
//!
//! A cursor is a single text integer on disk meaning "highest sequence ID
//! fully processed by this role". There are two: the fetch cursor beside the
//! diffs and the apply cursor beside the database.
//!
//! Writes go to `<path>.tmp`, are fsynced, then renamed over `<path>`, so a
//! reader (the other role, the supervisor, this process after a crash) sees
//! either the previous complete value or the new one, never a partial write.
//! A stray `.tmp` left by a crash is simply overwritten next time.
//!
//! A present-but-unparseable cursor is reported as [`Error::CorruptCursor`];
//! the cursor never silently turns garbage into zero. Callers decide whether
//! that aborts (retention) or not.

use std::io;
use std::path::{Path, PathBuf};

use diffsync_core::SequenceId;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Cursor {
    path: PathBuf,
}

impl Cursor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    /// The persisted value, `None` if the file does not exist.
    pub async fn load(&self) -> Result<Option<SequenceId>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(self.corrupt("<binary>"));
            }
            Err(e) => return Err(e.into()),
        };
        text.trim()
            .parse::<SequenceId>()
            .map(Some)
            .map_err(|_| self.corrupt(text.trim()))
    }

    /// The persisted value, or zero when no cursor has been written yet.
    pub async fn read(&self) -> Result<SequenceId> {
        Ok(self.load().await?.unwrap_or(SequenceId::ZERO))
    }

    /// Atomically replaces the persisted value.
    pub async fn write(&self, value: SequenceId) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(format!("{value}\n").as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), value = %value, "Cursor written");
        Ok(())
    }

    /// Deletes the cursor. Returns whether a file was removed.
    pub async fn remove(&self) -> Result<bool> {
        let _ = tokio::fs::remove_file(self.tmp_path()).await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Highest of the candidate positions; used to resume from whichever
    /// role got furthest.
    pub fn merge(candidates: &[SequenceId]) -> SequenceId {
        candidates.iter().copied().max().unwrap_or(SequenceId::ZERO)
    }

    fn corrupt(&self, value: &str) -> Error {
        Error::CorruptCursor {
            path: self.path.clone(),
            value: value.to_string(),
        }
    }
}
