//! diffsync Applier
//!
//! Applies fetched diffs to the database through the configured apply tool.
//!
//! ## Configuration
//! See `diffsync_agent::config`. Required: `DIFFSYNC_APPLY_COMMAND`.
//!
//! ```bash
//! export DIFFSYNC_DIFF_DIR=/srv/diffsync/diffs
//! export DIFFSYNC_DB_DIR=/srv/diffsync/db
//! export DIFFSYNC_APPLY_COMMAND="osm2db --append --history={metadata} --version={version} {dir}"
//! export DIFFSYNC_MIGRATE_COMMAND="osm2db --migrate"
//! diffsync-applier
//! ```

use std::sync::Arc;

use diffsync_agent::logging::init_tracing;
use diffsync_agent::{
    acquire_role_lock, Applier, CommandApplyTool, CommandMigrationTool, MigrationTool, NoMigration,
    Role, ShutdownHandle, SyncConfig,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = SyncConfig::load()?;
    config.validate_for(Role::Applier)?;

    info!(
        diff_dir = %config.diff_dir.display(),
        db_dir = %config.db_dir.display(),
        metadata = %config.metadata_mode,
        batch_size = config.max_batch_size,
        "Starting applier"
    );

    let _lock = acquire_role_lock(&config, Role::Applier)?;
    let shutdown = ShutdownHandle::new();
    shutdown.listen_for_signals();

    let grace = config.timing.tool_grace();
    let tool = Arc::new(CommandApplyTool::new(
        config.apply_command.clone(),
        config.shutdown_exit_code,
        grace,
    ));
    let migration: Arc<dyn MigrationTool> = if config.migrate_command.is_empty() {
        Arc::new(NoMigration)
    } else {
        Arc::new(CommandMigrationTool::new(config.migrate_command.clone(), grace))
    };

    Applier::new(&config, tool, migration, shutdown).run().await?;
    Ok(())
}
