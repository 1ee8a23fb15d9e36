//! Typed error hierarchy for slotwarden.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — reading and atomically replacing per-slot documents
//! - `SupervisorError` — reconciliation, spawning and signalling workers
//! - `WorkerError` — capture worker failures that end a run

use slotwarden_common::SlotId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the per-slot state store and ledger.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Slot {0} is not provisioned")]
    SlotNotFound(SlotId),

    #[error("Slot {0} is already provisioned")]
    AlreadyProvisioned(SlotId),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed document at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize document for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error means a document exists but cannot be parsed.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}

/// Errors from the supervisor subsystem.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker for slot {slot}: {source}")]
    SpawnFailed {
        slot: SlotId,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open log file at {path}: {source}")]
    LogCaptureFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal pid {pid}: {source}")]
    SignalFailed {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Another supervisor already owns {0}")]
    AlreadyRunning(PathBuf),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors that end a capture worker run.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Feed fetch failed: {0}")]
    Feed(String),

    #[error("Browser operation failed: {0}")]
    Browser(String),

    #[error("Slot configuration is unusable: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
