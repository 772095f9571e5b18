//! Durable snapshot artifacts.
//!
//! A snapshot is an immutable, sorted array of counts valid as of a
//! watermark. Artifacts are written once under a fresh generation number and
//! become authoritative only when the `CURRENT` manifest is renamed over.

pub mod codec;
mod file;
mod manifest;

pub use file::Snapshot;
pub use manifest::Manifest;
pub(crate) use manifest::{parse_artifact_name, sync_dir, MANIFEST_FILE};
