//! Tracing setup shared by the binaries.
//!
//! Logs go to stderr so `diffsync-status` can keep stdout for JSON.
//! `RUST_LOG` controls verbosity (default: `info`):
//!
//! ```bash
//! RUST_LOG=debug diffsync-fetcher                    # cache hits, waits
//! RUST_LOG=diffsync_agent=debug,info diffsync-applier
//! ```

use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
