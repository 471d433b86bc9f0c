//! Agent Configuration
//!
//! ## SyncConfig
//!
//! Everything the fetcher, applier and retention processes need:
//!
//! - **source_url**: base URL of the producer; `state.txt` and the shard
//!   paths are resolved relative to it
//! - **diff_dir**: local artifact tree, also home of the fetch cursor
//! - **db_dir**: database directory, home of the apply cursor
//! - **start**: `auto` (resume from cursors) or an explicit sequence number
//! - **metadata_mode**: `attic`, `yes` or `no`, passed to the apply tool
//! - **max_batch_size**: IDs per fetch and apply batch (default: 360)
//! - **keep_count**: IDs retention keeps behind the apply cursor (default: 360)
//! - **timing**: every wait and retry constant, see [`TimingConfig`]
//!
//! ## Loading
//!
//! [`SyncConfig::load`] reads a JSON file when `DIFFSYNC_CONFIG` is set and
//! otherwise builds the config from `DIFFSYNC_*` environment variables:
//!
//! | Variable                        | Field                  |
//! |---------------------------------|------------------------|
//! | `DIFFSYNC_SOURCE_URL`           | `source_url`           |
//! | `DIFFSYNC_DIFF_DIR`             | `diff_dir`             |
//! | `DIFFSYNC_DB_DIR`               | `db_dir`               |
//! | `DIFFSYNC_SCRATCH_DIR`          | `scratch_dir`          |
//! | `DIFFSYNC_START`                | `start`                |
//! | `DIFFSYNC_METADATA`             | `metadata_mode`        |
//! | `DIFFSYNC_MAX_BATCH_SIZE`       | `max_batch_size`       |
//! | `DIFFSYNC_KEEP_COUNT`           | `keep_count`           |
//! | `DIFFSYNC_PARALLELISM`          | `download_parallelism` |
//! | `DIFFSYNC_CHANGE_EXTENSION`     | `change_extension`     |
//! | `DIFFSYNC_APPLY_COMMAND`        | `apply_command`        |
//! | `DIFFSYNC_MIGRATE_COMMAND`      | `migrate_command`      |
//! | `DIFFSYNC_SHUTDOWN_EXIT_CODE`   | `shutdown_exit_code`   |
//! | `DIFFSYNC_CADENCE_SECS`         | `timing.cadence_ms`    |
//! | `DIFFSYNC_BATCH_RETRY_SECS`     | `timing.batch_retry_delay_ms` |
//! | `DIFFSYNC_STATE_RETRY_SECS`     | `timing.state_retry_delay_ms` |
//!
//! Commands are whitespace-separated argument lists; see
//! [`crate::apply_tool`] for the placeholders they may contain.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use diffsync_core::SequenceId;
use diffsync_storage::{ArtifactStore, DEFAULT_CHANGE_EXTENSION};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::role::Role;

/// Where a role starts when its process comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StartMode {
    /// Resume from the persisted cursors.
    Auto,
    /// Start right after this ID, ignoring cursors.
    Explicit(SequenceId),
}

impl FromStr for StartMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(StartMode::Auto);
        }
        s.parse::<SequenceId>()
            .map(StartMode::Explicit)
            .map_err(|_| {
                AgentError::Configuration(format!(
                    "start must be 'auto' or a sequence number, got '{s}'"
                ))
            })
    }
}

impl fmt::Display for StartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartMode::Auto => f.write_str("auto"),
            StartMode::Explicit(id) => write!(f, "{id}"),
        }
    }
}

impl TryFrom<String> for StartMode {
    type Error = AgentError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StartMode> for String {
    fn from(mode: StartMode) -> Self {
        mode.to_string()
    }
}

/// How much history the apply tool keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetadataMode {
    /// Full history.
    Attic,
    /// Object metadata only.
    Yes,
    No,
}

impl MetadataMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataMode::Attic => "attic",
            MetadataMode::Yes => "yes",
            MetadataMode::No => "no",
        }
    }
}

impl FromStr for MetadataMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attic" => Ok(MetadataMode::Attic),
            "yes" => Ok(MetadataMode::Yes),
            "no" => Ok(MetadataMode::No),
            other => Err(AgentError::Configuration(format!(
                "metadata mode must be attic, yes or no, got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for MetadataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MetadataMode {
    type Error = AgentError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MetadataMode> for String {
    fn from(mode: MetadataMode) -> Self {
        mode.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Producer base URL (required by the fetcher and status report)
    #[serde(default)]
    pub source_url: String,

    /// Local artifact tree (default: ./data/diffs)
    #[serde(default = "default_diff_dir")]
    pub diff_dir: PathBuf,

    /// Database directory (default: ./data/db)
    #[serde(default = "default_db_dir")]
    pub db_dir: PathBuf,

    /// Parent of per-batch scratch directories (default: `<db_dir>/scratch`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,

    #[serde(default = "default_start")]
    pub start: StartMode,

    #[serde(default = "default_metadata_mode")]
    pub metadata_mode: MetadataMode,

    /// Maximum IDs per batch (default: 360)
    #[serde(default = "default_batch_size")]
    pub max_batch_size: u64,

    /// IDs retained behind the apply cursor (default: 360)
    #[serde(default = "default_keep_count")]
    pub keep_count: u64,

    /// Concurrent file transfers per batch (default: 4)
    #[serde(default = "default_parallelism")]
    pub download_parallelism: usize,

    /// Extension of compressed change files (default: osc.gz)
    #[serde(default = "default_change_extension")]
    pub change_extension: String,

    /// Apply tool argv, with placeholders
    #[serde(default)]
    pub apply_command: Vec<String>,

    /// Migration tool argv; empty means no migration step
    #[serde(default)]
    pub migrate_command: Vec<String>,

    /// Apply tool exit code that requests a cooperative shutdown (default: 75)
    #[serde(default = "default_shutdown_exit_code")]
    pub shutdown_exit_code: i32,

    #[serde(default)]
    pub timing: TimingConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_url: String::new(),
            diff_dir: default_diff_dir(),
            db_dir: default_db_dir(),
            scratch_dir: None,
            start: default_start(),
            metadata_mode: default_metadata_mode(),
            max_batch_size: default_batch_size(),
            keep_count: default_keep_count(),
            download_parallelism: default_parallelism(),
            change_extension: default_change_extension(),
            apply_command: Vec::new(),
            migrate_command: Vec::new(),
            shutdown_exit_code: default_shutdown_exit_code(),
            timing: TimingConfig::default(),
        }
    }
}

fn default_diff_dir() -> PathBuf {
    PathBuf::from("./data/diffs")
}

fn default_db_dir() -> PathBuf {
    PathBuf::from("./data/db")
}

fn default_start() -> StartMode {
    StartMode::Auto
}

fn default_metadata_mode() -> MetadataMode {
    MetadataMode::No
}

fn default_batch_size() -> u64 {
    360 // six hours of minutely diffs
}

fn default_keep_count() -> u64 {
    360
}

fn default_parallelism() -> usize {
    4
}

fn default_change_extension() -> String {
    DEFAULT_CHANGE_EXTENSION.to_string()
}

fn default_shutdown_exit_code() -> i32 {
    75
}

impl SyncConfig {
    /// Loads from the JSON file named by `DIFFSYNC_CONFIG`, or else from
    /// `DIFFSYNC_*` variables.
    pub fn load() -> Result<Self> {
        match std::env::var("DIFFSYNC_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => Self::from_env(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: SyncConfig = serde_json::from_str(&text).map_err(|e| {
            AgentError::Configuration(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let mut config = SyncConfig::default();

        if let Ok(url) = std::env::var("DIFFSYNC_SOURCE_URL") {
            config.source_url = url;
        }
        if let Ok(dir) = std::env::var("DIFFSYNC_DIFF_DIR") {
            config.diff_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("DIFFSYNC_DB_DIR") {
            config.db_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("DIFFSYNC_SCRATCH_DIR") {
            config.scratch_dir = Some(PathBuf::from(dir));
        }
        if let Some(start) = env_parse("DIFFSYNC_START")? {
            config.start = start;
        }
        if let Some(mode) = env_parse("DIFFSYNC_METADATA")? {
            config.metadata_mode = mode;
        }
        if let Some(size) = env_parse("DIFFSYNC_MAX_BATCH_SIZE")? {
            config.max_batch_size = size;
        }
        if let Some(keep) = env_parse("DIFFSYNC_KEEP_COUNT")? {
            config.keep_count = keep;
        }
        if let Some(parallelism) = env_parse("DIFFSYNC_PARALLELISM")? {
            config.download_parallelism = parallelism;
        }
        if let Ok(ext) = std::env::var("DIFFSYNC_CHANGE_EXTENSION") {
            config.change_extension = ext;
        }
        if let Ok(command) = std::env::var("DIFFSYNC_APPLY_COMMAND") {
            config.apply_command = split_command(&command);
        }
        if let Ok(command) = std::env::var("DIFFSYNC_MIGRATE_COMMAND") {
            config.migrate_command = split_command(&command);
        }
        if let Some(code) = env_parse("DIFFSYNC_SHUTDOWN_EXIT_CODE")? {
            config.shutdown_exit_code = code;
        }
        if let Some(ms) = env_secs_as_ms("DIFFSYNC_CADENCE_SECS")? {
            config.timing.cadence_ms = ms;
        }
        if let Some(ms) = env_secs_as_ms("DIFFSYNC_BATCH_RETRY_SECS")? {
            config.timing.batch_retry_delay_ms = ms;
        }
        if let Some(ms) = env_secs_as_ms("DIFFSYNC_STATE_RETRY_SECS")? {
            config.timing.state_retry_delay_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }

    /// Role-independent sanity checks.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(AgentError::Configuration(
                "max_batch_size must be at least 1".into(),
            ));
        }
        if self.download_parallelism == 0 {
            return Err(AgentError::Configuration(
                "download_parallelism must be at least 1".into(),
            ));
        }
        if self.change_extension.trim_matches('.').is_empty() {
            return Err(AgentError::Configuration(
                "change_extension must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Checks the settings a specific role cannot run without.
    pub fn validate_for(&self, role: Role) -> Result<()> {
        self.validate()?;
        match role {
            Role::Fetcher if self.source_url.trim().is_empty() => Err(
                AgentError::Configuration("DIFFSYNC_SOURCE_URL is required".into()),
            ),
            Role::Applier if self.apply_command.is_empty() => Err(
                AgentError::Configuration("DIFFSYNC_APPLY_COMMAND is required".into()),
            ),
            _ => Ok(()),
        }
    }

    pub fn artifact_store(&self) -> ArtifactStore {
        ArtifactStore::new(
            &self.diff_dir,
            self.change_extension.as_str(),
            std::sync::Arc::new(diffsync_storage::GzipDecompressor),
        )
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.db_dir.join("scratch"))
    }
}

/// Wait and retry constants, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Expected interval between producer diffs (default: 60s)
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,

    /// First idle sleep after startup (default: 5s)
    #[serde(default = "default_first_sleep_ms")]
    pub first_sleep_ms: u64,

    /// Interval of the quick retries once a diff is overdue (default: 10s)
    #[serde(default = "default_quick_retry_ms")]
    pub quick_retry_ms: u64,

    /// Number of quick retries before slowing down (default: 6)
    #[serde(default = "default_quick_retries")]
    pub quick_retries: u32,

    /// Interval once quick retries are spent (default: 60s)
    #[serde(default = "default_slow_retry_ms")]
    pub slow_retry_ms: u64,

    /// Pause before retrying a failed batch (default: 30s)
    #[serde(default = "default_batch_retry_delay_ms")]
    pub batch_retry_delay_ms: u64,

    /// Pause between state polls during an outage (default: 60s)
    #[serde(default = "default_state_retry_delay_ms")]
    pub state_retry_delay_ms: u64,

    /// Apply tool attempts per batch (default: 3)
    #[serde(default = "default_apply_retries")]
    pub apply_retries: u32,

    /// Pause between apply tool attempts (default: 10s)
    #[serde(default = "default_apply_retry_delay_ms")]
    pub apply_retry_delay_ms: u64,

    /// Attempts to read the last state file of a batch (default: 5)
    #[serde(default = "default_metadata_attempts")]
    pub metadata_attempts: u32,

    /// Pause between those attempts (default: 1s)
    #[serde(default = "default_metadata_wait_ms")]
    pub metadata_wait_ms: u64,

    /// Shortest applier idle sleep (default: 10s)
    #[serde(default = "default_applier_floor_ms")]
    pub applier_floor_ms: u64,

    /// HTTP connect timeout (default: 10s)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// HTTP request timeout, including the body (default: 120s)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Retries per file download (default: 3)
    #[serde(default = "default_download_retries")]
    pub download_retries: usize,

    /// First backoff between download retries (default: 1s)
    #[serde(default = "default_download_backoff_ms")]
    pub download_backoff_ms: u64,

    /// Time the apply tool gets between SIGTERM and SIGKILL (default: 30s)
    #[serde(default = "default_tool_grace_ms")]
    pub tool_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            cadence_ms: default_cadence_ms(),
            first_sleep_ms: default_first_sleep_ms(),
            quick_retry_ms: default_quick_retry_ms(),
            quick_retries: default_quick_retries(),
            slow_retry_ms: default_slow_retry_ms(),
            batch_retry_delay_ms: default_batch_retry_delay_ms(),
            state_retry_delay_ms: default_state_retry_delay_ms(),
            apply_retries: default_apply_retries(),
            apply_retry_delay_ms: default_apply_retry_delay_ms(),
            metadata_attempts: default_metadata_attempts(),
            metadata_wait_ms: default_metadata_wait_ms(),
            applier_floor_ms: default_applier_floor_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            download_retries: default_download_retries(),
            download_backoff_ms: default_download_backoff_ms(),
            tool_grace_ms: default_tool_grace_ms(),
        }
    }
}

fn default_cadence_ms() -> u64 {
    60_000
}

fn default_first_sleep_ms() -> u64 {
    5_000
}

fn default_quick_retry_ms() -> u64 {
    10_000
}

fn default_quick_retries() -> u32 {
    6
}

fn default_slow_retry_ms() -> u64 {
    60_000
}

fn default_batch_retry_delay_ms() -> u64 {
    30_000
}

fn default_state_retry_delay_ms() -> u64 {
    60_000
}

fn default_apply_retries() -> u32 {
    3
}

fn default_apply_retry_delay_ms() -> u64 {
    10_000
}

fn default_metadata_attempts() -> u32 {
    5
}

fn default_metadata_wait_ms() -> u64 {
    1_000
}

fn default_applier_floor_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_download_retries() -> usize {
    3
}

fn default_download_backoff_ms() -> u64 {
    1_000
}

fn default_tool_grace_ms() -> u64 {
    30_000
}

impl TimingConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms)
    }

    pub fn first_sleep(&self) -> Duration {
        Duration::from_millis(self.first_sleep_ms)
    }

    pub fn quick_retry(&self) -> Duration {
        Duration::from_millis(self.quick_retry_ms)
    }

    pub fn slow_retry(&self) -> Duration {
        Duration::from_millis(self.slow_retry_ms)
    }

    pub fn batch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.batch_retry_delay_ms)
    }

    pub fn state_retry_delay(&self) -> Duration {
        Duration::from_millis(self.state_retry_delay_ms)
    }

    pub fn apply_retry_delay(&self) -> Duration {
        Duration::from_millis(self.apply_retry_delay_ms)
    }

    pub fn metadata_wait(&self) -> Duration {
        Duration::from_millis(self.metadata_wait_ms)
    }

    pub fn applier_floor(&self) -> Duration {
        Duration::from_millis(self.applier_floor_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn download_backoff(&self) -> Duration {
        Duration::from_millis(self.download_backoff_ms)
    }

    pub fn tool_grace(&self) -> Duration {
        Duration::from_millis(self.tool_grace_ms)
    }

    /// Every wait shortened to a few milliseconds, for tests.
    pub fn immediate() -> Self {
        Self {
            cadence_ms: 20,
            first_sleep_ms: 5,
            quick_retry_ms: 5,
            quick_retries: 2,
            slow_retry_ms: 10,
            batch_retry_delay_ms: 5,
            state_retry_delay_ms: 5,
            apply_retries: 3,
            apply_retry_delay_ms: 1,
            metadata_attempts: 3,
            metadata_wait_ms: 1,
            applier_floor_ms: 5,
            connect_timeout_ms: 2_000,
            request_timeout_ms: 5_000,
            download_retries: 2,
            download_backoff_ms: 1,
            tool_grace_ms: 500,
        }
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| AgentError::Configuration(format!("{key}='{raw}': {e}"))),
        Err(_) => Ok(None),
    }
}

/// A whole-seconds variable converted to milliseconds, saturating.
fn env_secs_as_ms(key: &str) -> Result<Option<u64>> {
    Ok(env_parse::<u64>(key)?.map(|secs| secs.saturating_mul(1000)))
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
