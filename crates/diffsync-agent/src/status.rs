//! Replication status report
//!
//! A point-in-time view of both roles, read from the same files the
//! processes write: cursors, lock files and the last applied state file.
//! The supervisor uses it as a health check.
//!
//! ```json
//! {
//!   "fetch_cursor": 5012345,
//!   "apply_cursor": 5012100,
//!   "remote_latest": 5012346,
//!   "fetch_lag": 1,
//!   "apply_lag": 245,
//!   "last_applied_timestamp": "2024-03-02T12:00:00Z",
//!   "fetcher": { "pid": 4121, "alive": true },
//!   "applier": { "pid": 4188, "alive": true }
//! }
//! ```

use chrono::{DateTime, Utc};
use diffsync_core::SequenceId;
use diffsync_storage::lock::is_pid_alive;
use diffsync_storage::{Cursor, PidLock};
use serde::Serialize;
use tracing::warn;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::remote::RemoteStateClient;
use crate::role::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub pid: Option<u32>,
    pub alive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationStatus {
    pub fetch_cursor: Option<SequenceId>,
    pub apply_cursor: Option<SequenceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_latest: Option<SequenceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_error: Option<String>,
    /// Diffs published by the producer but not yet fetched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_lag: Option<u64>,
    /// Diffs fetched but not yet applied.
    pub apply_lag: Option<u64>,
    pub last_applied_timestamp: Option<DateTime<Utc>>,
    pub fetcher: ProcessStatus,
    pub applier: ProcessStatus,
}

impl ReplicationStatus {
    /// Reads local state, plus the producer's latest if `remote` is given.
    /// Nothing here fails on missing or corrupt files; those show as `null`.
    pub async fn collect(
        config: &SyncConfig,
        remote: Option<&RemoteStateClient>,
    ) -> Result<Self> {
        let fetch_cursor = load_cursor(&Role::Fetcher.cursor(config)).await;
        let apply_cursor = load_cursor(&Role::Applier.cursor(config)).await;

        let (remote_latest, remote_error) = match remote {
            Some(client) => match client.poll_once().await {
                Ok(latest) => (Some(latest), None),
                Err(e) => (None, Some(e.to_string())),
            },
            None => (None, None),
        };

        let last_applied_timestamp = match apply_cursor {
            Some(id) if id > SequenceId::ZERO => {
                let store = config.artifact_store();
                tokio::task::spawn_blocking(move || {
                    store.read_state(id).ok().and_then(|state| state.timestamp().ok())
                })
                .await?
            }
            _ => None,
        };

        Ok(Self {
            fetch_cursor,
            apply_cursor,
            remote_latest,
            remote_error,
            fetch_lag: remote_latest
                .map(|latest| fetch_cursor.unwrap_or(SequenceId::ZERO).distance_to(latest)),
            apply_lag: fetch_cursor
                .map(|fetched| apply_cursor.unwrap_or(SequenceId::ZERO).distance_to(fetched)),
            last_applied_timestamp,
            fetcher: process_status(config, Role::Fetcher)?,
            applier: process_status(config, Role::Applier)?,
        })
    }
}

async fn load_cursor(cursor: &Cursor) -> Option<SequenceId> {
    match cursor.load().await {
        Ok(value) => value,
        Err(e) => {
            warn!(path = %cursor.path().display(), error = %e, "Unreadable cursor");
            None
        }
    }
}

fn process_status(config: &SyncConfig, role: Role) -> Result<ProcessStatus> {
    let pid = PidLock::holder(&role.lock_path(config))?;
    Ok(ProcessStatus {
        pid,
        alive: pid.is_some_and(is_pid_alive),
    })
}
