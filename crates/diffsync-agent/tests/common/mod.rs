//! Shared fixtures for agent integration tests: an in-memory producer, a
//! recording apply tool and gzip helpers.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use diffsync_agent::{
    ApplyOutcome, ApplyRequest, ApplyTool, FetchError, HttpFetcher, MigrationTool, ShutdownHandle,
    SyncConfig, TimingConfig,
};
use diffsync_core::{Batch, SequenceId};
use diffsync_storage::{ArtifactFile, ArtifactStore};
use flate2::write::GzEncoder;
use flate2::Compression;

pub const SOURCE: &str = "http://producer.test/replication/minute";

pub fn id(v: u64) -> SequenceId {
    SequenceId::new(v).unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn change_body(seq: u64) -> String {
    format!("<osmChange version=\"0.6\"><modify seq=\"{seq}\"/></osmChange>\n")
}

pub fn timestamp(seq: u64) -> String {
    format!("2024-03-02T{:02}:{:02}:00Z", (seq / 60) % 24, seq % 60)
}

pub fn state_text(seq: u64) -> String {
    format!(
        "#Sat Mar 02 12:00:00 UTC 2024\nsequenceNumber={seq}\ntimestamp={}\n",
        timestamp(seq).replace(':', "\\:")
    )
}

/// Test configuration rooted in `dir`, with millisecond timings.
pub fn config(dir: &Path) -> SyncConfig {
    SyncConfig {
        source_url: SOURCE.to_string(),
        diff_dir: dir.join("diffs"),
        db_dir: dir.join("db"),
        apply_command: vec!["unused".into()],
        timing: TimingConfig::immediate(),
        ..Default::default()
    }
}

/// Publishes a valid artifact straight into the local store.
pub fn seed_artifact(store: &ArtifactStore, seq: u64) {
    let change = store.prepare_temp(id(seq), ArtifactFile::Change).unwrap();
    std::fs::write(change, gzip(change_body(seq).as_bytes())).unwrap();
    let state = store.prepare_temp(id(seq), ArtifactFile::State).unwrap();
    std::fs::write(state, state_text(seq)).unwrap();
    assert!(store.publish(id(seq)).unwrap().is_complete());
}

/// In-memory producer keyed by path relative to [`SOURCE`].
pub struct FakeProducer {
    files: Mutex<HashMap<String, Vec<u8>>>,
    reachable: AtomicBool,
    failing_state_polls: AtomicUsize,
    state_requests: AtomicUsize,
    downloads: AtomicUsize,
}

impl FakeProducer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            failing_state_polls: AtomicUsize::new(0),
            state_requests: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
        })
    }

    /// Serves diffs `1..=latest` and a state document announcing `latest`.
    pub fn with_diffs(latest: u64) -> Arc<Self> {
        let producer = Self::new();
        for seq in 1..=latest {
            producer.add_diff(seq);
        }
        producer.set_latest(latest);
        producer
    }

    pub fn add_diff(&self, seq: u64) {
        let store = ArtifactStore::with_gzip("/unused");
        self.put(
            &store.relative_name(id(seq), ArtifactFile::Change),
            gzip(change_body(seq).as_bytes()),
        );
        self.put(
            &store.relative_name(id(seq), ArtifactFile::State),
            state_text(seq).into_bytes(),
        );
    }

    pub fn set_latest(&self, seq: u64) {
        self.put("state.txt", state_text(seq).into_bytes());
    }

    pub fn put(&self, relative: &str, body: Vec<u8>) {
        self.files.lock().unwrap().insert(relative.to_string(), body);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// The next `n` state polls fail with a connection error.
    pub fn fail_state_polls(&self, n: usize) {
        self.failing_state_polls.store(n, Ordering::SeqCst);
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn state_requests(&self) -> usize {
        self.state_requests.load(Ordering::SeqCst)
    }

    fn lookup(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(FetchError::Connect {
                url: url.to_string(),
                message: "connection refused".into(),
            });
        }
        let relative = url
            .strip_prefix(SOURCE)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(url);
        self.files
            .lock()
            .unwrap()
            .get(relative)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

#[async_trait]
impl HttpFetcher for FakeProducer {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        self.state_requests.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_state_polls.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_state_polls.store(failing - 1, Ordering::SeqCst);
            return Err(FetchError::Connect {
                url: url.to_string(),
                message: "connection reset".into(),
            });
        }
        let body = self.lookup(url)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let body = self.lookup(url)?;
        tokio::fs::write(dest, &body)
            .await
            .map_err(|source| FetchError::Io {
                path: dest.to_path_buf(),
                source,
            })?;
        Ok(body.len() as u64)
    }
}

/// Producer whose downloads write a partial body and then never finish.
pub struct StallingProducer {
    inner: Arc<FakeProducer>,
    started: AtomicUsize,
}

impl StallingProducer {
    pub fn with_diffs(latest: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: FakeProducer::with_diffs(latest),
            started: AtomicUsize::new(0),
        })
    }

    /// Downloads that have written their partial body.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpFetcher for StallingProducer {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        self.inner.fetch_text(url).await
    }

    async fn download(&self, _url: &str, dest: &Path) -> Result<u64, FetchError> {
        tokio::fs::write(dest, &gzip(b"partial")[..8])
            .await
            .map_err(|source| FetchError::Io {
                path: dest.to_path_buf(),
                source,
            })?;
        self.started.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Every `.part` file under `root`.
pub fn temp_files(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        return found;
    };
    for entry in entries {
        let path = entry.unwrap().path();
        if path.is_dir() {
            found.extend(temp_files(&path));
        } else if path.extension().is_some_and(|ext| ext == "part") {
            found.push(path);
        }
    }
    found
}

/// What the apply tool saw for one invocation.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub batch: Batch,
    pub files: Vec<String>,
    pub version: String,
    pub first_body: String,
}

/// Apply tool that records its input and replays scripted outcomes
/// (defaulting to success).
#[derive(Default)]
pub struct RecordingTool {
    outcomes: Mutex<VecDeque<ApplyOutcome>>,
    calls: Mutex<Vec<ToolCall>>,
    migrated: Arc<AtomicBool>,
    applied_before_migration: AtomicBool,
}

impl RecordingTool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, outcomes: Vec<ApplyOutcome>) {
        self.outcomes.lock().unwrap().extend(outcomes);
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn migration(&self) -> Arc<FlagMigration> {
        Arc::new(FlagMigration {
            migrated: self.migrated.clone(),
        })
    }

    pub fn applied_before_migration(&self) -> bool {
        self.applied_before_migration.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApplyTool for RecordingTool {
    async fn apply(
        &self,
        request: &ApplyRequest,
        _shutdown: &ShutdownHandle,
    ) -> diffsync_agent::Result<ApplyOutcome> {
        if !self.migrated.load(Ordering::SeqCst) {
            self.applied_before_migration.store(true, Ordering::SeqCst);
        }

        let mut files: Vec<String> = std::fs::read_dir(&request.input_dir)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<_, _>>()?;
        files.sort();
        let first_body = match files.first() {
            Some(name) => std::fs::read_to_string(request.input_dir.join(name))?,
            None => String::new(),
        };

        self.calls.lock().unwrap().push(ToolCall {
            batch: request.batch,
            files,
            version: request.version.clone(),
            first_body,
        });
        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ApplyOutcome::Applied))
    }
}

/// Migration step that flips a flag shared with [`RecordingTool`].
pub struct FlagMigration {
    migrated: Arc<AtomicBool>,
}

#[async_trait]
impl MigrationTool for FlagMigration {
    async fn migrate(&self, _shutdown: &ShutdownHandle) -> diffsync_agent::Result<()> {
        self.migrated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Apply tool that only returns once shutdown is requested, like a long
/// import interrupted by SIGTERM.
#[derive(Default)]
pub struct BlockingTool {
    input_dirs: Mutex<Vec<PathBuf>>,
}

impl BlockingTool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn input_dirs(&self) -> Vec<PathBuf> {
        self.input_dirs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ApplyTool for BlockingTool {
    async fn apply(
        &self,
        request: &ApplyRequest,
        shutdown: &ShutdownHandle,
    ) -> diffsync_agent::Result<ApplyOutcome> {
        assert!(request.input_dir.is_dir());
        self.input_dirs
            .lock()
            .unwrap()
            .push(request.input_dir.clone());
        shutdown.cancelled().await;
        Ok(ApplyOutcome::ShutdownRequested)
    }
}
