//! diffsync Fetcher
//!
//! Downloads new diffs from the producer into the local artifact tree.
//!
//! ## Configuration
//! See `diffsync_agent::config`. Required: `DIFFSYNC_SOURCE_URL`.
//!
//! ```bash
//! export DIFFSYNC_SOURCE_URL=https://planet.example.org/replication/minute
//! export DIFFSYNC_DIFF_DIR=/srv/diffsync/diffs
//! diffsync-fetcher
//! ```
//!
//! Exits 0 on SIGINT/SIGTERM and non-zero on a configuration error (for
//! example a producer that was never reachable).

use std::sync::Arc;

use diffsync_agent::logging::init_tracing;
use diffsync_agent::{acquire_role_lock, Fetcher, ReqwestFetcher, Role, ShutdownHandle, SyncConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = SyncConfig::load()?;
    config.validate_for(Role::Fetcher)?;

    info!(
        source = %config.source_url,
        diff_dir = %config.diff_dir.display(),
        batch_size = config.max_batch_size,
        parallelism = config.download_parallelism,
        "Starting fetcher"
    );

    let _lock = acquire_role_lock(&config, Role::Fetcher)?;
    let shutdown = ShutdownHandle::new();
    shutdown.listen_for_signals();

    let http = Arc::new(ReqwestFetcher::new(
        &config.timing,
        config.download_parallelism,
    )?);
    Fetcher::new(&config, http, shutdown).run().await?;
    Ok(())
}
