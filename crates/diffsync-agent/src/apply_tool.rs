//! External tool capabilities
//!
//! The database engine is not part of this crate. The applier hands it a
//! directory of ordered, decompressed change files through [`ApplyTool`],
//! and runs the one-time schema step through [`MigrationTool`]. The command
//! implementations spawn a configured program with `tokio::process`.
//!
//! ## Command placeholders
//!
//! | Placeholder  | Replaced with                           |
//! |--------------|-----------------------------------------|
//! | `{dir}`      | scratch directory holding the batch     |
//! | `{version}`  | timestamp of the batch's last diff      |
//! | `{metadata}` | `attic`, `yes` or `no`                  |
//! | `{start}`    | first sequence ID in the batch          |
//! | `{end}`      | last sequence ID in the batch           |
//!
//! ## Exit codes
//!
//! - `0`: applied
//! - the configured shutdown code (default 75), or death by SIGTERM/SIGINT:
//!   the tool asks the pipeline to stop; never retried
//! - anything else: failure, retried by the applier

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use diffsync_core::Batch;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::MetadataMode;
use crate::error::{AgentError, Result};
use crate::shutdown::ShutdownHandle;

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub batch: Batch,
    /// Directory of `{:09}.<ext>` files, one per ID, in apply order.
    pub input_dir: PathBuf,
    pub version: String,
    pub metadata_mode: MetadataMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The tool, or the operator, asked the pipeline to stop.
    ShutdownRequested,
    Failed { code: Option<i32>, detail: String },
}

#[async_trait]
pub trait ApplyTool: Send + Sync {
    async fn apply(&self, request: &ApplyRequest, shutdown: &ShutdownHandle)
        -> Result<ApplyOutcome>;
}

#[async_trait]
pub trait MigrationTool: Send + Sync {
    /// Runs to completion before any batch is applied.
    async fn migrate(&self, shutdown: &ShutdownHandle) -> Result<()>;
}

/// Migration step for deployments without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMigration;

#[async_trait]
impl MigrationTool for NoMigration {
    async fn migrate(&self, _shutdown: &ShutdownHandle) -> Result<()> {
        debug!("No migration command configured");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CommandApplyTool {
    argv: Vec<String>,
    shutdown_exit_code: i32,
    grace: Duration,
}

impl CommandApplyTool {
    pub fn new(argv: Vec<String>, shutdown_exit_code: i32, grace: Duration) -> Self {
        Self {
            argv,
            shutdown_exit_code,
            grace,
        }
    }

    /// The command line for `request`, placeholders expanded.
    pub fn command_line(&self, request: &ApplyRequest) -> Vec<String> {
        let dir = request.input_dir.display().to_string();
        let start = request.batch.start().next().unwrap_or(request.batch.end());
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{dir}", &dir)
                    .replace("{version}", &request.version)
                    .replace("{metadata}", request.metadata_mode.as_str())
                    .replace("{start}", &start.to_string())
                    .replace("{end}", &request.batch.end().to_string())
            })
            .collect()
    }

    fn classify(&self, status: ExitStatus) -> ApplyOutcome {
        if status.success() {
            return ApplyOutcome::Applied;
        }
        if status.code() == Some(self.shutdown_exit_code) {
            return ApplyOutcome::ShutdownRequested;
        }
        match status.signal() {
            Some(sig) if sig == Signal::SIGTERM as i32 || sig == Signal::SIGINT as i32 => {
                ApplyOutcome::ShutdownRequested
            }
            _ => ApplyOutcome::Failed {
                code: status.code(),
                detail: status.to_string(),
            },
        }
    }
}

#[async_trait]
impl ApplyTool for CommandApplyTool {
    async fn apply(
        &self,
        request: &ApplyRequest,
        shutdown: &ShutdownHandle,
    ) -> Result<ApplyOutcome> {
        let argv = self.command_line(request);
        let child = match spawn(&argv) {
            Ok(child) => child,
            Err(e) => {
                return Ok(ApplyOutcome::Failed {
                    code: None,
                    detail: e.to_string(),
                })
            }
        };

        match wait_or_terminate(child, shutdown, self.grace).await? {
            Some(status) => Ok(self.classify(status)),
            None => Ok(ApplyOutcome::ShutdownRequested),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandMigrationTool {
    argv: Vec<String>,
    grace: Duration,
}

impl CommandMigrationTool {
    pub fn new(argv: Vec<String>, grace: Duration) -> Self {
        Self { argv, grace }
    }
}

#[async_trait]
impl MigrationTool for CommandMigrationTool {
    async fn migrate(&self, shutdown: &ShutdownHandle) -> Result<()> {
        let child = spawn(&self.argv).map_err(|e| AgentError::Migration(e.to_string()))?;
        match wait_or_terminate(child, shutdown, self.grace).await? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(AgentError::Migration(format!(
                "{} exited with {status}",
                self.argv.join(" ")
            ))),
            None => Err(AgentError::Shutdown),
        }
    }
}

fn spawn(argv: &[String]) -> Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| AgentError::Configuration("empty tool command".into()))?;
    debug!(command = %argv.join(" "), "Spawning tool");
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::ApplyTool(format!("failed to start {program}: {e}")))
}

/// Waits for `child`; on shutdown sends SIGTERM, then kills it after `grace`.
/// Returns `None` if the wait was cut short by shutdown.
async fn wait_or_terminate(
    mut child: Child,
    shutdown: &ShutdownHandle,
    grace: Duration,
) -> Result<Option<ExitStatus>> {
    tokio::select! {
        status = child.wait() => return Ok(Some(status?)),
        _ = shutdown.cancelled() => {}
    }

    if let Some(pid) = child.id() {
        info!(pid, "Terminating tool for shutdown");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid, error = %e, "Failed to send SIGTERM to tool");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            debug!(status = %status?, "Tool exited after SIGTERM");
        }
        Err(_) => {
            warn!(grace_ms = grace.as_millis() as u64, "Tool ignored SIGTERM, killing");
            child.kill().await?;
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use diffsync_core::SequenceId;

    fn request(dir: &str) -> ApplyRequest {
        ApplyRequest {
            batch: Batch::new(SequenceId::new(2).unwrap(), SequenceId::new(5).unwrap()).unwrap(),
            input_dir: PathBuf::from(dir),
            version: "2024-03-02T12:00:00Z".into(),
            metadata_mode: MetadataMode::Attic,
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn test_placeholders_expanded() {
        let tool = CommandApplyTool::new(
            vec![
                "osm2db".into(),
                "--append".into(),
                "--history={metadata}".into(),
                "--version={version}".into(),
                "{dir}".into(),
                "{start}-{end}".into(),
            ],
            75,
            Duration::from_secs(1),
        );
        assert_eq!(
            tool.command_line(&request("/tmp/batch")),
            vec![
                "osm2db",
                "--append",
                "--history=attic",
                "--version=2024-03-02T12:00:00Z",
                "/tmp/batch",
                "3-5",
            ]
        );
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let shutdown = ShutdownHandle::new();
        let grace = Duration::from_millis(200);

        let ok = CommandApplyTool::new(sh("exit 0"), 75, grace);
        assert_eq!(
            ok.apply(&request("/tmp"), &shutdown).await.unwrap(),
            ApplyOutcome::Applied
        );

        let stop = CommandApplyTool::new(sh("exit 75"), 75, grace);
        assert_eq!(
            stop.apply(&request("/tmp"), &shutdown).await.unwrap(),
            ApplyOutcome::ShutdownRequested
        );

        let failed = CommandApplyTool::new(sh("exit 3"), 75, grace);
        assert!(matches!(
            failed.apply(&request("/tmp"), &shutdown).await.unwrap(),
            ApplyOutcome::Failed { code: Some(3), .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_a_failure() {
        let tool = CommandApplyTool::new(
            vec!["/nonexistent/diffsync-apply-tool".into()],
            75,
            Duration::from_millis(100),
        );
        let outcome = tool
            .apply(&request("/tmp"), &ShutdownHandle::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Failed { code: None, .. }));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_running_tool() {
        let shutdown = ShutdownHandle::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.shutdown();
        });

        let tool = CommandApplyTool::new(sh("sleep 30"), 75, Duration::from_secs(2));
        let started = std::time::Instant::now();
        let outcome = tool.apply(&request("/tmp"), &shutdown).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::ShutdownRequested);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_migration_failure() {
        let shutdown = ShutdownHandle::new();
        let ok = CommandMigrationTool::new(sh("true"), Duration::from_millis(100));
        assert!(ok.migrate(&shutdown).await.is_ok());

        let bad = CommandMigrationTool::new(sh("exit 1"), Duration::from_millis(100));
        assert!(matches!(
            bad.migrate(&shutdown).await,
            Err(AgentError::Migration(_))
        ));
    }
}
