//! diffsync Status
//!
//! Prints a JSON replication status report to stdout.
//!
//! ```bash
//! diffsync-status            # local cursors and process liveness
//! diffsync-status --remote   # also poll the producer for fetch lag
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use diffsync_agent::logging::init_tracing;
use diffsync_agent::{RemoteStateClient, ReplicationStatus, ReqwestFetcher, SyncConfig};

#[derive(Parser)]
#[command(name = "diffsync-status")]
#[command(about = "Report replication cursors, lag and process liveness", long_about = None)]
struct Cli {
    /// Poll the producer's latest sequence number
    #[arg(long)]
    remote: bool,

    /// Pretty-print the JSON
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::load().context("Failed to load configuration")?;

    let remote = if cli.remote && !config.source_url.is_empty() {
        let http = Arc::new(
            ReqwestFetcher::new(&config.timing, 1).context("Failed to build HTTP client")?,
        );
        Some(RemoteStateClient::new(
            config.source_url.clone(),
            http,
            config.timing.state_retry_delay(),
        ))
    } else {
        None
    };

    let status = ReplicationStatus::collect(&config, remote.as_ref())
        .await
        .context("Failed to collect status")?;
    let json = if cli.pretty {
        serde_json::to_string_pretty(&status)?
    } else {
        serde_json::to_string(&status)?
    };
    println!("{json}");
    Ok(())
}
