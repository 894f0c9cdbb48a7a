//! Error types used across provisioning and session startup.

use std::path::PathBuf;

use thiserror::Error;

use crate::provision::download::DownloadFailureReason;

/// Result type for provisioning and supervisor operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A download in the active batch failed.
    #[error("download failed: {0}")]
    NetworkFailure(DownloadFailureReason),

    /// Downloaded content did not match the published checksum.
    #[error("checksum mismatch for {}", file.display())]
    IntegrityFailure { file: PathBuf },

    #[error("not enough free space: {required} bytes required, {available} available")]
    StorageInsufficient { required: u64, available: u64 },

    /// The sandbox launcher or one of its helper scripts failed.
    #[error("process launch failed: {0}")]
    ProcessLaunchFailure(String),

    /// The requested action is not valid in the current state.
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// Archive filename does not follow `<repo>-<archive>-<version>`.
    #[error("malformed archive name: {0}")]
    MalformedArchiveName(String),

    #[error("unsupported archive format: {}", .0.display())]
    UnsupportedArchive(PathBuf),

    #[error("filesystem {filesystem_id} already has an active session")]
    SessionAlreadyActive { filesystem_id: u64 },

    #[error("server did not become ready within {0:?}")]
    StartTimedOut(std::time::Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("asset list error: {0}")]
    AssetList(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
