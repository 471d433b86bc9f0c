//! Fetcher
//!
//! Pulls new artifacts from the producer in bounded batches and advances the
//! fetch cursor once a whole batch is published.
//!
//! ## Loop
//!
//! ```text
//! ┌─→ latest = remote.latest_available()
//! │     │
//! │     ├─ latest <= current ──→ adaptive idle wait ──────────────┐
//! │     │                                                         │
//! │     └─ batch = (current, min(latest, current + max)]          │
//! │           │                                                   │
//! │           ├─ plan: skip files already available (cache hits)  │
//! │           ├─ download missing files → *.part (bounded parallel)│
//! │           ├─ publish every requested ID (verify + rename)     │
//! │           │                                                   │
//! │           ├─ all published ─→ cursor = batch.end              │
//! │           └─ otherwise ─────→ keep cursor, batch_retry_delay  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Published files stay in place when a batch fails, so the retry only
//! transfers what is still missing. The cursor is written only after a fully
//! successful batch.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use diffsync_core::{Batch, SequenceId};
use diffsync_storage::{ArtifactFile, ArtifactStore, Cursor};
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::config::{StartMode, SyncConfig};
use crate::error::{AgentError, FetchError, Result};
use crate::remote::{join_url, HttpFetcher, RemoteStateClient};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::role::Role;
use crate::schedule::WaitPolicy;
use crate::shutdown::ShutdownHandle;

/// What one iteration of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A batch was fully published and the cursor advanced.
    Advanced(Batch),
    /// Nothing newer than the cursor is available.
    Idle { latest: SequenceId },
}

pub struct Fetcher {
    store: ArtifactStore,
    cursor: Cursor,
    apply_cursor: Cursor,
    remote: RemoteStateClient,
    http: Arc<dyn HttpFetcher>,
    source_url: String,
    start: StartMode,
    max_batch_size: u64,
    parallelism: usize,
    waits: WaitPolicy,
    download_policy: RetryPolicy,
    batch_retry_delay: std::time::Duration,
    shutdown: ShutdownHandle,
    current: SequenceId,
}

impl Fetcher {
    pub fn new(config: &SyncConfig, http: Arc<dyn HttpFetcher>, shutdown: ShutdownHandle) -> Self {
        Self {
            store: config.artifact_store(),
            cursor: Role::Fetcher.cursor(config),
            apply_cursor: Role::Applier.cursor(config),
            remote: RemoteStateClient::new(
                config.source_url.clone(),
                http.clone(),
                config.timing.state_retry_delay(),
            ),
            http,
            source_url: config.source_url.clone(),
            start: config.start,
            max_batch_size: config.max_batch_size,
            parallelism: config.download_parallelism.max(1),
            waits: WaitPolicy::from_timing(&config.timing),
            download_policy: RetryPolicy::for_downloads(&config.timing),
            batch_retry_delay: config.timing.batch_retry_delay(),
            shutdown,
            current: SequenceId::ZERO,
        }
    }

    /// Last ID this fetcher has fully published.
    pub fn current(&self) -> SequenceId {
        self.current
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Where to resume: the explicit start, or in auto mode the furthest of
    /// the fetch and apply cursors. A corrupt cursor counts as zero here;
    /// re-fetching cached artifacts costs no transfers.
    pub async fn resolve_start(&self) -> Result<SequenceId> {
        match self.start {
            StartMode::Explicit(id) => Ok(id),
            StartMode::Auto => {
                let mut candidates = Vec::with_capacity(2);
                for cursor in [&self.cursor, &self.apply_cursor] {
                    match cursor.read().await {
                        Ok(value) => candidates.push(value),
                        Err(e) => warn!(
                            path = %cursor.path().display(),
                            error = %e,
                            "Ignoring unreadable cursor"
                        ),
                    }
                }
                Ok(Cursor::merge(&candidates))
            }
        }
    }

    /// Sweeps stale temp files and positions the fetcher at its start.
    pub async fn start(&mut self) -> Result<SequenceId> {
        let store = self.store.clone();
        let swept = tokio::task::spawn_blocking(move || store.sweep_temp_files()).await??;
        if swept > 0 {
            info!(files = swept, "Removed stale partial downloads");
        }

        self.current = self.resolve_start().await?;
        info!(
            start = %self.current,
            mode = %self.start,
            source = %self.source_url,
            "Fetcher positioned"
        );
        Ok(self.current)
    }

    /// Polls the producer and fetches at most one batch.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        let latest = self.remote.latest_available(&self.shutdown).await?;
        let Some(batch) = Batch::after(self.current, latest, self.max_batch_size) else {
            return Ok(StepOutcome::Idle { latest });
        };

        self.fetch_batch(batch).await?;
        self.cursor.write(batch.end()).await?;
        self.current = batch.end();
        info!(
            batch_start = %batch.start(),
            batch_end = %batch.end(),
            latest = %latest,
            "Fetch cursor advanced"
        );
        Ok(StepOutcome::Advanced(batch))
    }

    /// Downloads and publishes every missing artifact of `batch`.
    ///
    /// Returns [`AgentError::PartialBatch`] if any requested ID could not be
    /// published; what did publish stays cached.
    pub async fn fetch_batch(&self, batch: Batch) -> Result<()> {
        let store = self.store.clone();
        let plan = tokio::task::spawn_blocking(move || plan_downloads(&store, batch)).await?;
        let requested: BTreeSet<SequenceId> = plan.iter().map(|(id, _)| *id).collect();

        debug!(
            batch = %batch,
            cached = batch.len() - requested.len() as u64,
            files = plan.len(),
            "Planned batch downloads"
        );
        if plan.is_empty() {
            return Ok(());
        }

        let downloads = stream::iter(plan)
            .map(|(id, file)| self.download_file(id, file))
            .buffer_unordered(self.parallelism)
            .collect::<Vec<_>>();

        let results = tokio::select! {
            results = downloads => results,
            _ = self.shutdown.cancelled() => {
                let store = self.store.clone();
                tokio::task::spawn_blocking(move || store.discard_temp_batch(batch)).await?;
                info!(batch = %batch, "Shutdown during download, partial files discarded");
                return Err(AgentError::Shutdown);
            }
        };

        let mut transferred = 0u64;
        for result in &results {
            match result {
                Ok(bytes) => transferred += bytes,
                Err(FetchError::Cancelled { .. }) => {}
                Err(e) => warn!(reason = e.reason(), error = %e, "Download failed"),
            }
        }

        if self.shutdown.is_shutdown() {
            let store = self.store.clone();
            tokio::task::spawn_blocking(move || store.discard_temp_batch(batch)).await?;
            return Err(AgentError::Shutdown);
        }

        let store = self.store.clone();
        let ids: Vec<SequenceId> = requested.iter().copied().collect();
        let failed = tokio::task::spawn_blocking(move || publish_all(&store, &ids)).await??;

        info!(
            batch = %batch,
            requested = requested.len(),
            failed,
            bytes = transferred,
            "Batch downloaded"
        );
        if failed > 0 {
            return Err(AgentError::PartialBatch {
                batch,
                requested: requested.len() as u64,
                failed,
            });
        }
        Ok(())
    }

    async fn download_file(
        &self,
        id: SequenceId,
        file: ArtifactFile,
    ) -> std::result::Result<u64, FetchError> {
        let url = join_url(&self.source_url, &self.store.relative_name(id, file));
        let temp = self.store.temp_path_of(id, file);
        if let Some(parent) = temp.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FetchError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let result = retry_with_backoff(&self.download_policy, &self.shutdown, || {
            self.http.download(&url, &temp)
        })
        .await;

        match &result {
            Ok(bytes) => debug!(sequence_id = %id, file = %file, bytes, "Downloaded"),
            Err(_) => {
                let _ = tokio::fs::remove_file(&temp).await;
            }
        }
        result
    }

    /// Runs until shutdown. Only configuration errors end the loop early.
    pub async fn run(mut self) -> Result<()> {
        match self.run_loop().await {
            Err(AgentError::Shutdown) | Ok(()) => {
                info!(cursor = %self.current, "Fetcher stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.start().await?;

        let mut last_batch: Option<Instant> = None;
        let mut first_wait_done = false;
        let mut overdue_polls = 0u32;

        while !self.shutdown.is_shutdown() {
            match self.step().await {
                Ok(StepOutcome::Advanced(_)) => {
                    last_batch = Some(Instant::now());
                    overdue_polls = 0;
                }
                Ok(StepOutcome::Idle { latest }) => {
                    let wait = self.waits.fetcher_wait(
                        last_batch.map(|at| at.elapsed()),
                        first_wait_done,
                        overdue_polls,
                    );
                    first_wait_done = true;
                    if wait.kind.is_overdue() {
                        overdue_polls += 1;
                    }
                    debug!(
                        current = %self.current,
                        latest = %latest,
                        wait = %wait.kind,
                        wait_ms = wait.duration.as_millis() as u64,
                        "No new diffs"
                    );
                    if !self.shutdown.sleep(wait.duration).await {
                        break;
                    }
                }
                Err(AgentError::Shutdown) => break,
                Err(e @ AgentError::Configuration(_)) => {
                    error!(error = %e, "Fetcher cannot continue");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        current = %self.current,
                        error = %e,
                        retry_in_ms = self.batch_retry_delay.as_millis() as u64,
                        "Batch failed, will retry"
                    );
                    if !self.shutdown.sleep(self.batch_retry_delay).await {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Files of `batch` not yet available locally, in ascending ID order.
fn plan_downloads(store: &ArtifactStore, batch: Batch) -> Vec<(SequenceId, ArtifactFile)> {
    batch
        .ids()
        .flat_map(|id| ArtifactFile::BOTH.into_iter().map(move |file| (id, file)))
        .filter(|&(id, file)| !store.is_file_available(id, file))
        .collect()
}

/// Publishes each ID, returning how many are still incomplete.
fn publish_all(store: &ArtifactStore, ids: &[SequenceId]) -> diffsync_storage::Result<u64> {
    let mut failed = 0;
    for &id in ids {
        let outcome = store.publish(id)?;
        if !outcome.is_complete() {
            warn!(
                sequence_id = %id,
                change = outcome.change,
                state = outcome.state,
                "Artifact not published"
            );
            store.discard_temp(id);
            failed += 1;
        }
    }
    Ok(failed)
}
