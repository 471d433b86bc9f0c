//! Artifact Store
//!
//! Verification and atomic publication of diff artifacts. An artifact is the
//! pair (change file, state file) stored under the sequence ID's shard path:
//!
//! ```text
//! <root>/001/234/567.osc.gz       change file
//! <root>/001/234/567.state.txt    state file
//! ```
//!
//! ## Verify Before Trust
//!
//! ```text
//! download ──→ 567.osc.gz.part ──verify──┬─ ok ──→ rename → 567.osc.gz
//!                                        └─ bad ─→ delete
//! ```
//!
//! An artifact is *available* only when both final files exist and each
//! passes verification: the change file must fully decompress, the state
//! file must carry `sequenceNumber` and `timestamp`. A file that exists but
//! fails verification is treated exactly like a missing one. Readers never
//! look at `.part` files, so the rename is the only publish barrier between
//! the fetcher and the applier.
//!
//! All methods are blocking filesystem calls; async callers run them on
//! `tokio::task::spawn_blocking`. The store is cheap to clone.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use diffsync_core::{Batch, SequenceId, ShardPath, StateFile};
use tracing::{debug, warn};

use crate::decompress::{Decompressor, GzipDecompressor};
use crate::error::{Error, Result};

/// Extension of compressed change files when none is configured.
pub const DEFAULT_CHANGE_EXTENSION: &str = "osc.gz";

const STATE_EXTENSION: &str = "state.txt";
const TEMP_SUFFIX: &str = "part";

/// One half of an artifact pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactFile {
    Change,
    State,
}

impl ArtifactFile {
    pub const BOTH: [ArtifactFile; 2] = [ArtifactFile::Change, ArtifactFile::State];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactFile::Change => "change",
            ArtifactFile::State => "state",
        }
    }
}

impl fmt::Display for ArtifactFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of publishing one artifact's downloaded files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub change: bool,
    pub state: bool,
}

impl PublishOutcome {
    /// True when both files are now available under their final names.
    pub fn is_complete(&self) -> bool {
        self.change && self.state
    }
}

#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    change_extension: String,
    decompressor: Arc<dyn Decompressor>,
}

impl fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("root", &self.root)
            .field("change_extension", &self.change_extension)
            .finish()
    }
}

impl ArtifactStore {
    pub fn new(
        root: impl Into<PathBuf>,
        change_extension: impl Into<String>,
        decompressor: Arc<dyn Decompressor>,
    ) -> Self {
        let change_extension = change_extension.into();
        Self {
            root: root.into(),
            change_extension: change_extension.trim_start_matches('.').to_string(),
            decompressor,
        }
    }

    /// Store for gzip-compressed `.osc.gz` change files.
    pub fn with_gzip(root: impl Into<PathBuf>) -> Self {
        Self::new(root, DEFAULT_CHANGE_EXTENSION, Arc::new(GzipDecompressor))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn change_extension(&self) -> &str {
        &self.change_extension
    }

    pub fn decompressor(&self) -> &Arc<dyn Decompressor> {
        &self.decompressor
    }

    /// Extension of a change file once decompressed (`osc.gz` → `osc`).
    pub fn plain_extension(&self) -> &str {
        self.change_extension
            .rsplit_once('.')
            .map(|(plain, _codec)| plain)
            .unwrap_or(&self.change_extension)
    }

    fn extension(&self, file: ArtifactFile) -> &str {
        match file {
            ArtifactFile::Change => &self.change_extension,
            ArtifactFile::State => STATE_EXTENSION,
        }
    }

    /// `001/234/567.osc.gz`, with forward slashes, for building remote URLs.
    pub fn relative_name(&self, id: SequenceId, file: ArtifactFile) -> String {
        format!("{}.{}", ShardPath::of(id), self.extension(file))
    }

    pub fn path_of(&self, id: SequenceId, file: ArtifactFile) -> PathBuf {
        let shard = ShardPath::of(id);
        self.root.join(shard.dir()).join(format!(
            "{}.{}",
            shard.file_stem(),
            self.extension(file)
        ))
    }

    pub fn temp_path_of(&self, id: SequenceId, file: ArtifactFile) -> PathBuf {
        let mut path = self.path_of(id, file).into_os_string();
        path.push(".");
        path.push(TEMP_SUFFIX);
        PathBuf::from(path)
    }

    /// Creates the shard directory for `id` and returns the temp path a
    /// download of `file` should write to.
    pub fn prepare_temp(&self, id: SequenceId, file: ArtifactFile) -> Result<PathBuf> {
        let temp = self.temp_path_of(id, file);
        if let Some(parent) = temp.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(temp)
    }

    /// Checks one file's content as it would be checked at its final name.
    pub fn verify_file(&self, file: ArtifactFile, path: &Path) -> Result<()> {
        match file {
            ArtifactFile::Change => self.decompressor.verify(path),
            ArtifactFile::State => {
                let text = fs::read_to_string(path).map_err(|e| match e.kind() {
                    io::ErrorKind::InvalidData => Error::integrity(path, "not UTF-8 text"),
                    _ => Error::Io(e),
                })?;
                if StateFile::parse(&text).has_required_keys() {
                    Ok(())
                } else {
                    Err(Error::integrity(path, "missing sequenceNumber or timestamp"))
                }
            }
        }
    }

    /// True when `file` of `id` exists at its final name and verifies.
    pub fn is_file_available(&self, id: SequenceId, file: ArtifactFile) -> bool {
        let path = self.path_of(id, file);
        match self.verify_file(file, &path) {
            Ok(()) => true,
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                debug!(
                    sequence_id = %id,
                    file = %file,
                    error = %e,
                    "Artifact file present but not valid"
                );
                false
            }
        }
    }

    /// True only if both files exist at final names and each verifies.
    pub fn is_available(&self, id: SequenceId) -> bool {
        ArtifactFile::BOTH
            .iter()
            .all(|&file| self.is_file_available(id, file))
    }

    /// Moves verified temp files of `id` into their final names.
    ///
    /// A temp file that fails verification is deleted rather than published.
    /// A file with no temp counterpart (it was not downloaded this round)
    /// counts as published only if its final file is already available.
    pub fn publish(&self, id: SequenceId) -> Result<PublishOutcome> {
        let change = self.publish_file(id, ArtifactFile::Change)?;
        let state = self.publish_file(id, ArtifactFile::State)?;
        Ok(PublishOutcome { change, state })
    }

    fn publish_file(&self, id: SequenceId, file: ArtifactFile) -> Result<bool> {
        let temp = self.temp_path_of(id, file);
        if !temp.exists() {
            return Ok(self.is_file_available(id, file));
        }

        match self.verify_file(file, &temp) {
            Ok(()) => {
                fs::rename(&temp, self.path_of(id, file))?;
                debug!(sequence_id = %id, file = %file, "Published artifact file");
                Ok(true)
            }
            Err(e) => {
                warn!(
                    sequence_id = %id,
                    file = %file,
                    error = %e,
                    "Downloaded file failed verification, discarding"
                );
                remove_if_exists(&temp)?;
                Ok(false)
            }
        }
    }

    /// Best-effort removal of stray temp files for `id`.
    pub fn discard_temp(&self, id: SequenceId) {
        for file in ArtifactFile::BOTH {
            let temp = self.temp_path_of(id, file);
            if let Err(e) = remove_if_exists(&temp) {
                warn!(
                    sequence_id = %id,
                    path = %temp.display(),
                    error = %e,
                    "Failed to remove temporary file"
                );
            }
        }
    }

    pub fn discard_temp_batch(&self, batch: Batch) {
        for id in batch.ids() {
            self.discard_temp(id);
        }
    }

    /// Removes every `.part` file under the store root. Only safe while no
    /// download is in flight, i.e. at fetcher startup under its lock.
    pub fn sweep_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        if !self.root.exists() {
            return Ok(0);
        }
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == TEMP_SUFFIX) {
                    remove_if_exists(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// The longest run of available artifacts starting right after `after`,
    /// capped at `max_len` IDs. Stops at the first unavailable ID.
    pub fn contiguous_run(&self, after: SequenceId, max_len: u64) -> Option<Batch> {
        let mut end = after;
        let mut len = 0;
        while len < max_len {
            let Some(candidate) = end.next() else {
                break;
            };
            if !self.is_available(candidate) {
                break;
            }
            end = candidate;
            len += 1;
        }
        Batch::new(after, end)
    }

    pub fn read_state(&self, id: SequenceId) -> Result<StateFile> {
        let text = fs::read_to_string(self.path_of(id, ArtifactFile::State))?;
        Ok(StateFile::parse(&text))
    }

    /// Decompresses the change file of `id` into `dst`.
    pub fn decompress_change(&self, id: SequenceId, dst: &Path) -> Result<u64> {
        self.decompressor
            .decompress(&self.path_of(id, ArtifactFile::Change), dst)
    }

    /// Decodes a file name inside a leaf shard directory into its leaf
    /// component and kind, e.g. `567.osc.gz.part` → `(567, Change, temp)`.
    /// Unknown names return `None` and are left alone by sweeps.
    pub fn classify_file_name(&self, name: &str) -> Option<(u16, ArtifactFile, bool)> {
        let (stem, rest) = name.split_once('.')?;
        let leaf = diffsync_core::sequence::parse_component(stem)?;
        let (rest, temp) = match rest.strip_suffix(&format!(".{TEMP_SUFFIX}")) {
            Some(inner) => (inner, true),
            None => (rest, false),
        };
        let file = if rest == self.change_extension {
            ArtifactFile::Change
        } else if rest == STATE_EXTENSION {
            ArtifactFile::State
        } else {
            return None;
        };
        Some((leaf, file, temp))
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
