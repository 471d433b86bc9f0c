//! Applier
//!
//! Consumes contiguous runs of available artifacts, in order, through the
//! external apply tool, and advances the apply cursor after each success.
//!
//! ## Batch lifecycle
//!
//! ```text
//! collect_batch(current) ── run of 0 ──→ idle wait
//!        │
//!        ▼ (current, end]
//! scratch dir ← decompress each change file as {:09}.osc
//!        │
//! version ← timestamp of end's state file (bounded retry)
//!        │
//! apply tool ── failed ──→ retry up to apply_retries ──→ batch pending,
//!        │                                              retry after delay
//!        ├── shutdown code ──→ stop, cursor untouched
//!        ▼
//! cursor = end, scratch removed
//! ```
//!
//! Every artifact is re-verified here before use; the applier never trusts
//! the fetcher's word that a file is complete.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use diffsync_core::{Batch, SequenceId};
use diffsync_storage::{ArtifactStore, Cursor};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::apply_tool::{ApplyOutcome, ApplyRequest, ApplyTool, MigrationTool};
use crate::config::{MetadataMode, StartMode, SyncConfig, TimingConfig};
use crate::error::{AgentError, Result};
use crate::role::Role;
use crate::schedule::WaitPolicy;
use crate::shutdown::{ShutdownHandle, ShutdownSignal};

const SCRATCH_PREFIX: &str = "batch-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStep {
    Applied(Batch),
    /// The next artifact is not available yet.
    Idle,
}

pub struct Applier {
    store: ArtifactStore,
    cursor: Cursor,
    tool: Arc<dyn ApplyTool>,
    migration: Arc<dyn MigrationTool>,
    start: StartMode,
    metadata_mode: MetadataMode,
    max_batch_size: u64,
    scratch_root: PathBuf,
    waits: WaitPolicy,
    timing: TimingConfig,
    shutdown: ShutdownHandle,
    current: SequenceId,
}

impl Applier {
    pub fn new(
        config: &SyncConfig,
        tool: Arc<dyn ApplyTool>,
        migration: Arc<dyn MigrationTool>,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            store: config.artifact_store(),
            cursor: Role::Applier.cursor(config),
            tool,
            migration,
            start: config.start,
            metadata_mode: config.metadata_mode,
            max_batch_size: config.max_batch_size,
            scratch_root: config.scratch_root(),
            waits: WaitPolicy::from_timing(&config.timing),
            timing: config.timing.clone(),
            shutdown,
            current: SequenceId::ZERO,
        }
    }

    pub fn current(&self) -> SequenceId {
        self.current
    }

    /// The explicit start, or the persisted apply cursor. Unlike the fetcher,
    /// a corrupt apply cursor is fatal: guessing would re-apply or skip diffs.
    pub async fn resolve_start(&self) -> Result<SequenceId> {
        match self.start {
            StartMode::Explicit(id) => Ok(id),
            StartMode::Auto => Ok(self.cursor.read().await?),
        }
    }

    /// Removes scratch directories left behind by a crash and positions the
    /// applier at its start.
    pub async fn start(&mut self) -> Result<SequenceId> {
        let removed = sweep_scratch(&self.scratch_root).await?;
        if removed > 0 {
            info!(dirs = removed, "Removed stale scratch directories");
        }
        self.current = self.resolve_start().await?;
        info!(start = %self.current, mode = %self.start, "Applier positioned");
        Ok(self.current)
    }

    /// The longest run of available artifacts after `after`, if any.
    pub async fn collect_batch(&self, after: SequenceId) -> Result<Option<Batch>> {
        let store = self.store.clone();
        let max = self.max_batch_size;
        Ok(tokio::task::spawn_blocking(move || store.contiguous_run(after, max)).await?)
    }

    /// Decompresses every change file of `batch` into a fresh scratch
    /// directory, named by zero-padded sequence number.
    pub async fn prepare_scratch(&self, batch: Batch) -> Result<TempDir> {
        tokio::fs::create_dir_all(&self.scratch_root).await?;
        let store = self.store.clone();
        let root = self.scratch_root.clone();
        let scratch = tokio::task::spawn_blocking(move || -> Result<TempDir> {
            let dir = tempfile::Builder::new()
                .prefix(SCRATCH_PREFIX)
                .tempdir_in(&root)?;
            let extension = store.plain_extension().to_string();
            for id in batch.ids() {
                let output = dir.path().join(format!("{:09}.{extension}", id.get()));
                store.decompress_change(id, &output)?;
            }
            Ok(dir)
        })
        .await??;
        debug!(batch = %batch, dir = %scratch.path().display(), "Batch decompressed");
        Ok(scratch)
    }

    /// The `timestamp` of `id`'s state file, retried briefly in case the
    /// file is still being finalized.
    pub async fn extract_version(&self, id: SequenceId) -> Result<String> {
        let attempts = self.timing.metadata_attempts.max(1);
        let mut attempt = 1;
        loop {
            let store = self.store.clone();
            let result = tokio::task::spawn_blocking(move || -> Result<String> {
                let state = store.read_state(id)?;
                Ok(state.timestamp_raw()?.to_string())
            })
            .await?;

            match result {
                Ok(version) => return Ok(version),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!(sequence_id = %id, attempt, error = %e, "State file not readable yet");
                    if !self.shutdown.sleep(self.timing.metadata_wait()).await {
                        return Err(AgentError::Shutdown);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Runs the apply tool, retrying failures up to `apply_retries` times.
    /// A shutdown request from the tool stops immediately.
    pub async fn invoke_tool(&self, request: &ApplyRequest) -> Result<()> {
        let attempts = self.timing.apply_retries.max(1);
        for attempt in 1..=attempts {
            if self.shutdown.is_shutdown() {
                return Err(AgentError::Shutdown);
            }

            match self.tool.apply(request, &self.shutdown).await? {
                ApplyOutcome::Applied => {
                    if attempt > 1 {
                        info!(batch = %request.batch, attempt, "Apply succeeded after retry");
                    }
                    return Ok(());
                }
                ApplyOutcome::ShutdownRequested => {
                    info!(batch = %request.batch, "Apply tool requested shutdown");
                    self.shutdown.trigger(ShutdownSignal::ToolRequested);
                    return Err(AgentError::Shutdown);
                }
                ApplyOutcome::Failed { code, detail } => {
                    warn!(
                        batch = %request.batch,
                        attempt,
                        max_attempts = attempts,
                        code = ?code,
                        detail = %detail,
                        "Apply tool failed"
                    );
                    if attempt < attempts
                        && !self.shutdown.sleep(self.timing.apply_retry_delay()).await
                    {
                        return Err(AgentError::Shutdown);
                    }
                }
            }
        }

        Err(AgentError::ApplyTool(format!(
            "batch {} not applied after {attempts} attempts",
            request.batch
        )))
    }

    /// Applies one batch. The scratch directory is removed on every path.
    pub async fn apply_batch(&self, batch: Batch) -> Result<()> {
        let scratch = self.prepare_scratch(batch).await?;
        let version = self.extract_version(batch.end()).await?;
        let request = ApplyRequest {
            batch,
            input_dir: scratch.path().to_path_buf(),
            version,
            metadata_mode: self.metadata_mode,
        };

        let started = Instant::now();
        let result = self.invoke_tool(&request).await;
        if let Err(e) = scratch.close() {
            warn!(error = %e, "Failed to remove scratch directory");
        }
        result?;

        info!(
            batch = %batch,
            diffs = batch.len(),
            version = %request.version,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch applied"
        );
        Ok(())
    }

    /// Applies at most one batch.
    pub async fn step(&mut self) -> Result<ApplyStep> {
        let Some(batch) = self.collect_batch(self.current).await? else {
            return Ok(ApplyStep::Idle);
        };

        self.apply_batch(batch).await?;
        self.cursor.write(batch.end()).await?;
        self.current = batch.end();
        info!(cursor = %self.current, "Apply cursor advanced");
        Ok(ApplyStep::Applied(batch))
    }

    /// Migrates, then applies batches until shutdown. Migration failure and
    /// an unreadable apply cursor end the process; apply failures never do.
    pub async fn run(mut self) -> Result<()> {
        match self.run_loop().await {
            Err(AgentError::Shutdown) | Ok(()) => {
                info!(cursor = %self.current, "Applier stopped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Applier cannot continue");
                Err(e)
            }
        }
    }

    async fn run_loop(&mut self) -> Result<()> {
        info!("Running migration");
        self.migration.migrate(&self.shutdown).await?;
        self.start().await?;

        let mut last_batch: Option<Instant> = None;
        let mut first_wait_done = false;

        while !self.shutdown.is_shutdown() {
            match self.step().await {
                Ok(ApplyStep::Applied(_)) => last_batch = Some(Instant::now()),
                Ok(ApplyStep::Idle) => {
                    let wait = self
                        .waits
                        .applier_wait(last_batch.map(|at| at.elapsed()), first_wait_done);
                    first_wait_done = true;
                    debug!(
                        cursor = %self.current,
                        wait_ms = wait.duration.as_millis() as u64,
                        "No batch ready"
                    );
                    if !self.shutdown.sleep(wait.duration).await {
                        break;
                    }
                }
                Err(AgentError::Shutdown) => break,
                Err(e) => {
                    error!(
                        cursor = %self.current,
                        error = %e,
                        retry_in_ms = self.timing.batch_retry_delay_ms,
                        "Batch not applied, will retry the same range"
                    );
                    if !self.shutdown.sleep(self.timing.batch_retry_delay()).await {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn sweep_scratch(root: &Path) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let is_scratch = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(SCRATCH_PREFIX));
        if is_scratch && entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}
