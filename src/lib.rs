//! # Counts Store
//!
//! A durable, transactional store of aggregate entity counts for a graph
//! database: nodes per label and relationships per
//! `(start label, type, end label)` triple, with wildcards on every position.
//!
//! ## Core Concepts
//!
//! - **Snapshot**: Immutable, sorted, checksummed artifact of absolute counts
//! - **Diff**: In-memory deltas of transactions applied after the snapshot
//! - **Watermark**: Highest transaction id whose effects are visible; replays
//!   at or below it are no-ops
//! - **Rotation**: Folding the diff into a new snapshot, in the background or
//!   on checkpoint
//!
//! ## Example
//!
//! ```ignore
//! use countstore::{CountsStore, StoreConfig, TxId, CountsSink, ANY_LABEL};
//!
//! let store = CountsStore::open_or_create(StoreConfig {
//!     path: "./counts".into(),
//!     ..Default::default()
//! })?;
//!
//! store.with_updater(TxId(2), |updater| {
//!     updater.increment_node_count(ANY_LABEL, 1);
//!     updater.increment_node_count(7, 1);
//!     Ok(())
//! })?;
//!
//! assert_eq!(store.node_count(7)?, 1);
//! store.checkpoint()?;
//! ```

pub mod commands;
pub mod diff;
pub mod error;
pub mod rebuild;
pub mod rotation;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod updater;

// Re-exports
pub use commands::{translate, ApplicationMode, Command, CommittedTransaction};
pub use diff::DiffLayer;
pub use error::{CountsError, Result};
pub use rebuild::{BuildMode, CountsBuilder, EmptyRebuild, Rebuilder};
pub use rotation::{merge_sorted, RotationSummary};
pub use snapshot::{Manifest, Snapshot};
pub use store::{dump, CountsStore, DumpFormat, Scan, StoreConfig};
pub use types::*;
pub use updater::{ApplyOutcome, CountsSink, Updater};
