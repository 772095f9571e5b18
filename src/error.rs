//! Error types for the counts store.

use crate::types::{CountsKey, TxId};
use thiserror::Error;

/// Main error type for counts store operations.
#[derive(Debug, Error)]
pub enum CountsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of order apply: transaction {tx_id} cannot follow watermark {watermark}")]
    OutOfOrderApply { tx_id: TxId, watermark: TxId },

    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("Rotation failed to write snapshot: {0}")]
    RotationIo(std::io::Error),

    #[error("The count value for key '{key}' is invalid, typically caused by a store corruption")]
    InvalidCount { key: CountsKey },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Store has not been started")]
    NotStarted,

    #[error("Store is read-only: {0}")]
    ReadOnly(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Rebuild failed: {0}")]
    RebuildFailed(String),
}

impl From<serde_json::Error> for CountsError {
    fn from(e: serde_json::Error) -> Self {
        CountsError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CountsError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CountsError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CountsError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CountsError::Deserialization(e.to_string())
    }
}

/// Result type for counts store operations.
pub type Result<T> = std::result::Result<T, CountsError>;
