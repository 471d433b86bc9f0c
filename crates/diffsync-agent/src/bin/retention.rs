//! diffsync Retention
//!
//! One-shot cleanup of the artifact tree, meant to run from a timer.
//!
//! ```bash
//! diffsync-retention --keep 360      # delete diffs more than 360 behind the apply cursor
//! diffsync-retention --full-reset    # delete every diff and the fetch cursor
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use diffsync_agent::logging::init_tracing;
use diffsync_agent::{acquire_role_lock, Role, SyncConfig};
use diffsync_storage::Retention;
use tracing::info;

#[derive(Parser)]
#[command(name = "diffsync-retention")]
#[command(about = "Reclaim disk space used by applied diffs", long_about = None)]
struct Cli {
    /// Diffs to keep behind the apply cursor (default: config keep_count)
    #[arg(long)]
    keep: Option<u64>,

    /// Delete every diff and the fetch cursor instead
    #[arg(long, conflicts_with = "keep")]
    full_reset: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::load().context("Failed to load configuration")?;
    let retention = Retention::new(config.artifact_store());

    let report = if cli.full_reset {
        // The fetcher must not be writing while its tree is wiped.
        let _lock = acquire_role_lock(&config, Role::Fetcher)
            .context("Fetcher is running; stop it before a full reset")?;
        retention
            .full_reset(&Role::Fetcher.cursor(&config))
            .await
            .context("Full reset failed")?
    } else {
        let keep = cli.keep.unwrap_or(config.keep_count);
        retention
            .windowed(&Role::Applier.cursor(&config), keep)
            .await
            .context("Windowed retention aborted")?
    };

    info!(
        files_deleted = report.files_deleted,
        dirs_pruned = report.dirs_pruned,
        threshold = ?report.threshold.map(|t| t.get()),
        "Retention finished"
    );
    Ok(())
}
