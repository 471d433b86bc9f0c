//! diffsync Core Types
//!
//! Shared identity types for the replication pipeline. Every other crate
//! (the artifact store, the fetcher, the applier, retention) addresses diffs
//! through the types defined here, so the sequence → path mapping is
//! identical everywhere.
//!
//! ## Contents
//!
//! - [`SequenceId`]: a dense, strictly ordered diff number in `[0, 1_000_000_000)`
//! - [`ShardPath`]: the three-level `ddd/ddd/ddd` directory path of a sequence ID
//! - [`Batch`]: a contiguous `(start, end]` range processed as one unit
//! - [`StateFile`]: the `key=value` metadata file published next to every diff
//!
//! ## Example
//!
//! ```
//! use diffsync_core::{SequenceId, ShardPath};
//!
//! let id = SequenceId::new(1_234_567).unwrap();
//! let path = ShardPath::of(id);
//! assert_eq!(path.to_string(), "001/234/567");
//! assert_eq!(path.id(), id);
//! ```

pub mod batch;
pub mod error;
pub mod sequence;
pub mod state_file;

pub use batch::Batch;
pub use error::{Error, Result};
pub use sequence::{SequenceId, ShardPath, MAX_SEQUENCE_ID};
pub use state_file::{StateFile, SEQUENCE_NUMBER_KEY, TIMESTAMP_KEY};
