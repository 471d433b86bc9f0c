//! diffsync Storage Layer
//!
//! Everything the pipeline keeps on local disk: verified diff artifacts,
//! the per-role cursors, single-instance lock files, and the retention
//! sweep that reclaims consumed diffs.
//!
//! ## Layout
//!
//! ```text
//! <diff_dir>/
//! ├── replication.seq          fetch cursor
//! ├── fetcher.lock
//! └── 005/
//!     └── 934/
//!         ├── 012.osc.gz        change file
//!         ├── 012.state.txt     metadata file
//!         └── 013.osc.gz.part   download in progress (never trusted)
//!
//! <db_dir>/
//! ├── applied.seq              apply cursor
//! └── applier.lock
//! ```
//!
//! ## Guarantees
//!
//! - A reader only ever sees fully verified final files, or nothing.
//!   Downloads land under a `.part` name and are renamed into place only
//!   after they pass verification ([`ArtifactStore::publish`]).
//! - Cursors are replaced with write-to-temp + fsync + rename, so a crash
//!   leaves either the previous value or the new one ([`Cursor::write`]).
//! - Retention never guesses: an unreadable apply cursor aborts the sweep
//!   ([`Retention::windowed`]).

pub mod artifact;
pub mod cursor;
pub mod decompress;
pub mod error;
pub mod lock;
pub mod retention;

pub use artifact::{ArtifactFile, ArtifactStore, PublishOutcome, DEFAULT_CHANGE_EXTENSION};
pub use cursor::Cursor;
pub use decompress::{Decompressor, GzipDecompressor};
pub use error::{Error, Result};
pub use lock::PidLock;
pub use retention::{retention_threshold, Retention, RetentionReport};
