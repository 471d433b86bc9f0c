//! Retention
//!
//! Reclaims disk space taken by diffs the applier has already consumed.
//!
//! ## Modes
//!
//! - **Windowed** ([`Retention::windowed`]): with apply cursor `C` and
//!   keep-count `K`, deletes every artifact whose ID is `<= C - K`. When
//!   `C - K <= 0` nothing is deleted. An apply cursor that is missing or
//!   corrupt aborts the sweep; guessing a value could delete diffs that were
//!   never applied.
//! - **Full reset** ([`Retention::full_reset`]): deletes every artifact and
//!   the fetch cursor. Used for recovery, not routine operation.
//!
//! The shard tree is walked in ascending order and directories left empty
//! are pruned bottom-up. Files whose names are not artifact names are left
//! in place (and keep their directory alive).

use std::fs;
use std::path::Path;

use diffsync_core::{SequenceId, ShardPath};
use tracing::{debug, info};

use crate::artifact::{remove_if_exists, ArtifactStore};
use crate::cursor::Cursor;
use crate::error::{Error, Result};

const IDS_PER_TOP: u64 = 1_000_000;
const IDS_PER_MID: u64 = 1_000;

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Highest ID eligible for deletion, `None` for a full reset or a no-op.
    pub threshold: Option<SequenceId>,
    pub files_deleted: u64,
    pub dirs_pruned: u64,
}

/// `C - K`, or `None` if that is not positive.
pub fn retention_threshold(applied: SequenceId, keep: u64) -> Option<SequenceId> {
    applied.positive_sub(keep)
}

#[derive(Debug, Clone)]
pub struct Retention {
    store: ArtifactStore,
}

impl Retention {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    /// Deletes artifacts more than `keep` IDs behind the apply cursor.
    pub async fn windowed(&self, apply_cursor: &Cursor, keep: u64) -> Result<RetentionReport> {
        let applied = apply_cursor
            .load()
            .await?
            .ok_or_else(|| Error::CursorMissing(apply_cursor.path().to_path_buf()))?;

        let Some(threshold) = retention_threshold(applied, keep) else {
            info!(
                applied = %applied,
                keep,
                "Not enough history accumulated, nothing to delete"
            );
            return Ok(RetentionReport::default());
        };

        let store = self.store.clone();
        let report =
            tokio::task::spawn_blocking(move || sweep(&store, Some(threshold))).await??;
        info!(
            applied = %applied,
            keep,
            threshold = %threshold,
            files_deleted = report.files_deleted,
            dirs_pruned = report.dirs_pruned,
            "Windowed retention complete"
        );
        Ok(report)
    }

    /// Deletes every artifact and the fetch cursor.
    pub async fn full_reset(&self, fetch_cursor: &Cursor) -> Result<RetentionReport> {
        let store = self.store.clone();
        let report = tokio::task::spawn_blocking(move || sweep(&store, None)).await??;
        let cursor_removed = fetch_cursor.remove().await?;
        info!(
            files_deleted = report.files_deleted,
            dirs_pruned = report.dirs_pruned,
            cursor_removed,
            "Full reset complete"
        );
        Ok(report)
    }

    /// Synchronous windowed sweep for an already-known threshold.
    pub fn delete_through(&self, threshold: SequenceId) -> Result<RetentionReport> {
        sweep(&self.store, Some(threshold))
    }
}

/// Walks the shard tree; `threshold == None` deletes everything.
fn sweep(store: &ArtifactStore, threshold: Option<SequenceId>) -> Result<RetentionReport> {
    let mut report = RetentionReport {
        threshold,
        ..Default::default()
    };
    let root = store.root();
    if !root.exists() {
        return Ok(report);
    }
    let limit = threshold.map(SequenceId::get);

    for (top, top_dir) in shard_dirs(root)? {
        let top_base = u64::from(top) * IDS_PER_TOP;
        if limit.is_some_and(|limit| top_base > limit) {
            break;
        }

        for (mid, mid_dir) in shard_dirs(&top_dir)? {
            let mid_base = top_base + u64::from(mid) * IDS_PER_MID;
            if limit.is_some_and(|limit| mid_base > limit) {
                break;
            }

            for entry in fs::read_dir(&mid_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let Some((leaf, file, _temp)) =
                    name.to_str().and_then(|n| store.classify_file_name(n))
                else {
                    continue;
                };
                let id = ShardPath::from_components(top, mid, leaf)?.id();
                if limit.map_or(true, |limit| id.get() <= limit) {
                    remove_if_exists(&entry.path())?;
                    report.files_deleted += 1;
                    debug!(sequence_id = %id, file = %file, "Deleted artifact file");
                }
            }

            if prune_if_empty(&mid_dir)? {
                report.dirs_pruned += 1;
            }
        }

        if prune_if_empty(&top_dir)? {
            report.dirs_pruned += 1;
        }
    }

    Ok(report)
}

/// Three-digit subdirectories of `dir`, sorted ascending.
fn shard_dirs(dir: &Path) -> Result<Vec<(u16, std::path::PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(component) = entry
            .file_name()
            .to_str()
            .and_then(diffsync_core::sequence::parse_component)
        {
            dirs.push((component, entry.path()));
        }
    }
    dirs.sort_by_key(|(component, _)| *component);
    Ok(dirs)
}

fn prune_if_empty(dir: &Path) -> Result<bool> {
    if fs::read_dir(dir)?.next().is_some() {
        return Ok(false);
    }
    fs::remove_dir(dir)?;
    Ok(true)
}
