//! diffsync Agent
//!
//! The long-running processes of the replication pipeline and the pieces
//! they are built from.
//!
//! ## Architecture
//!
//! ```text
//!  producer (HTTP)
//!      │ state.txt, ddd/ddd/ddd.osc.gz, ddd/ddd/ddd.state.txt
//!      ▼
//! ┌──────────┐  *.part → verify → rename   ┌──────────────┐
//! │ Fetcher  │ ──────────────────────────→ │ diff_dir     │
//! └──────────┘   replication.seq           │ (artifacts)  │
//!                                          └──────┬───────┘
//!                                                 │ contiguous run
//!                                                 ▼
//! ┌──────────┐  scratch dir, version      ┌──────────────┐
//! │ ApplyTool│ ←───────────────────────── │ Applier      │
//! └──────────┘                            └──────────────┘
//!                                           applied.seq
//! ```
//!
//! The fetcher and applier never talk to each other. The artifact tree and
//! their own cursors are the only shared state; atomic renames are the
//! only synchronisation.
//!
//! ## Capabilities
//!
//! External programs are reached through narrow traits so the loops can be
//! tested with in-memory fakes:
//!
//! - [`HttpFetcher`]: producer access ([`ReqwestFetcher`])
//! - [`ApplyTool`] / [`MigrationTool`]: database engine ([`CommandApplyTool`])
//! - `Decompressor`: change-file codec (in `diffsync-storage`)

pub mod applier;
pub mod apply_tool;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod remote;
pub mod retry;
pub mod role;
pub mod schedule;
pub mod shutdown;
pub mod status;

pub use applier::{ApplyStep, Applier};
pub use apply_tool::{
    ApplyOutcome, ApplyRequest, ApplyTool, CommandApplyTool, CommandMigrationTool, MigrationTool,
    NoMigration,
};
pub use config::{MetadataMode, StartMode, SyncConfig, TimingConfig};
pub use error::{AgentError, FetchError, Result};
pub use fetcher::{Fetcher, StepOutcome};
pub use remote::{HttpFetcher, RemoteStateClient, ReqwestFetcher};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use role::Role;
pub use schedule::{Wait, WaitKind, WaitPolicy};
pub use shutdown::{ShutdownHandle, ShutdownSignal};
pub use status::ReplicationStatus;

use diffsync_storage::PidLock;

/// Takes the role's single-instance lock, creating its directory.
pub fn acquire_role_lock(config: &SyncConfig, role: Role) -> Result<PidLock> {
    Ok(PidLock::acquire(role.lock_path(config))?)
}
