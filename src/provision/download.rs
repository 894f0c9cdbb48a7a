//! Download coordinator: one batch of downloads per provisioning pass.
//!
//! The enqueued id set is persisted before [`DownloadCoordinator::submit_batch`]
//! returns and cleared only once the batch resolves, so a process killed
//! mid-download can re-attach to the same ids on the next start instead of
//! enqueuing everything again. A batch that cannot be persisted is cancelled
//! on the spot.
//!
//! Any single failure aborts the whole batch: a partial filesystem image is
//! useless, so every other enqueued transfer is cancelled.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::prefs::AssetPreferences;
use crate::provision::integrity::{self, DigestAlgorithm};
use crate::provision::transport::{DownloadId, DownloadTransport, TransferStatus};
use crate::provision::{DownloadRequirement, ROOTFS_ARCHIVE_MARKER};

// ---------------------------------------------------------------------------
// Failure reasons
// ---------------------------------------------------------------------------

/// Why a download (or the batch as a whole) failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadFailureReason {
    HttpError(u16),
    CannotResume,
    NoExternalDevices,
    DestinationExists,
    FileError,
    HttpProcessing,
    InsufficientStorage,
    TooManyRedirects,
    UnhandledHttpResponse,
    Unknown,
    /// The download system reported a reason code we do not know.
    MissingError(i64),
    /// The download system has no record of the id.
    ReasonNotFound,
    ChecksumMismatch,
    /// The completed set differs from the enqueued set.
    FinishedWrongItems,
    Cancelled,
}

impl DownloadFailureReason {
    /// Map a platform download-manager reason code.
    pub fn from_code(code: i64) -> Self {
        match code {
            100..=500 => Self::HttpError(code as u16),
            1000 => Self::Unknown,
            1001 => Self::FileError,
            1002 => Self::UnhandledHttpResponse,
            1004 => Self::HttpProcessing,
            1005 => Self::TooManyRedirects,
            1006 => Self::InsufficientStorage,
            1007 => Self::NoExternalDevices,
            1008 => Self::CannotResume,
            1009 => Self::DestinationExists,
            other => Self::MissingError(other),
        }
    }
}

impl fmt::Display for DownloadFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpError(code) => write!(f, "HTTP error {code} while downloading"),
            Self::CannotResume => f.write_str("a download could not be resumed"),
            Self::NoExternalDevices => f.write_str("no external storage device was found"),
            Self::DestinationExists => f.write_str("the download destination already exists"),
            Self::FileError => f.write_str("a storage error occurred while writing a download"),
            Self::HttpProcessing => f.write_str("an error occurred while receiving data"),
            Self::InsufficientStorage => f.write_str("insufficient storage for the download"),
            Self::TooManyRedirects => f.write_str("too many redirects"),
            Self::UnhandledHttpResponse => f.write_str("unhandled HTTP response"),
            Self::Unknown => f.write_str("an unknown download error occurred"),
            Self::MissingError(code) => write!(f, "unrecognised download error code {code}"),
            Self::ReasonNotFound => f.write_str("the failure reason could not be determined"),
            Self::ChecksumMismatch => f.write_str("the filesystem download is corrupt (checksum mismatch)"),
            Self::FinishedWrongItems => f.write_str("downloads finished that were not requested"),
            Self::Cancelled => f.write_str("the download was cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The id does not belong to the active batch.
    NotOurs,
    Failed(DownloadFailureReason),
    Progress { completed: usize, total: usize },
    AllComplete,
}

/// Identifiers of a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHandle {
    pub ids: BTreeSet<DownloadId>,
}

impl BatchHandle {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// How completed batches are checked before being accepted.
#[derive(Debug, Clone)]
pub struct ChecksumPolicy {
    pub enabled: bool,
    pub algorithm: DigestAlgorithm,
    /// Substring identifying the checksum manifest among the downloads.
    pub manifest_marker: String,
    /// Architecture prefix selecting the manifest entry.
    pub arch: String,
}

impl Default for ChecksumPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: DigestAlgorithm::Md5,
            manifest_marker: "MD5SUMS".to_string(),
            arch: integrity::host_arch().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct DownloadCoordinator {
    transport: Arc<dyn DownloadTransport>,
    prefs: AssetPreferences,
    download_dir: PathBuf,
    checksum: ChecksumPolicy,
    enqueued: BTreeSet<DownloadId>,
    completed: BTreeSet<DownloadId>,
}

impl DownloadCoordinator {
    pub fn new(
        transport: Arc<dyn DownloadTransport>,
        prefs: AssetPreferences,
        download_dir: impl Into<PathBuf>,
        checksum: ChecksumPolicy,
    ) -> Self {
        Self {
            transport,
            prefs,
            download_dir: download_dir.into(),
            checksum,
            enqueued: BTreeSet::new(),
            completed: BTreeSet::new(),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn transport(&self) -> &Arc<dyn DownloadTransport> {
        &self.transport
    }

    pub fn enqueued_ids(&self) -> &BTreeSet<DownloadId> {
        &self.enqueued
    }

    pub fn completed_ids(&self) -> &BTreeSet<DownloadId> {
        &self.completed
    }

    /// Start a fresh batch, discarding any earlier one.
    pub fn submit_batch(&mut self, requirements: &[DownloadRequirement]) -> ProvisionResult<BatchHandle> {
        self.prefs.clear_enqueued_downloads()?;
        self.enqueued.clear();
        self.completed.clear();
        self.clear_download_dir()?;

        for requirement in requirements {
            let destination = self.download_dir.join(&requirement.destination_title);
            let id = self.transport.enqueue(&requirement.url, &destination);
            debug!(target: "downloads", id = %id, title = %requirement.destination_title, "enqueued");
            self.enqueued.insert(id);
        }

        if let Err(e) = self.prefs.set_enqueued_downloads(&self.enqueued) {
            warn!(target: "downloads", error = %e, "cannot persist batch, cancelling it");
            let ids: Vec<DownloadId> = self.enqueued.iter().copied().collect();
            self.transport.cancel(&ids);
            self.enqueued.clear();
            self.completed.clear();
            return Err(e);
        }
        info!(target: "downloads", count = self.enqueued.len(), "download batch submitted");
        Ok(BatchHandle {
            ids: self.enqueued.clone(),
        })
    }

    /// Handle one finished (succeeded or failed) download notification.
    pub fn on_item_finished(&mut self, id: DownloadId) -> ProvisionResult<DownloadOutcome> {
        if !self.enqueued.contains(&id) {
            return Ok(DownloadOutcome::NotOurs);
        }

        match self.transport.status(id) {
            TransferStatus::Failed(reason) => {
                warn!(target: "downloads", id = %id, %reason, "download failed, cancelling batch");
                self.abort_batch()?;
                return Ok(DownloadOutcome::Failed(reason));
            }
            TransferStatus::Pending => {
                debug!(target: "downloads", id = %id, "finish notification for pending download ignored");
                return Ok(self.progress());
            }
            TransferStatus::Succeeded => {
                self.completed.insert(id);
            }
        }

        if self.completed.len() != self.enqueued.len() {
            return Ok(self.progress());
        }

        if self.completed != self.enqueued {
            warn!(target: "downloads", "completed set differs from enqueued set");
            self.abort_batch()?;
            return Ok(DownloadOutcome::Failed(DownloadFailureReason::FinishedWrongItems));
        }

        if self.checksum.enabled {
            if let Err(e) = self.verify_rootfs_checksums() {
                warn!(target: "downloads", error = %e, "batch rejected");
                self.finish_batch()?;
                return Ok(DownloadOutcome::Failed(DownloadFailureReason::ChecksumMismatch));
            }
        }

        self.finish_batch()?;
        info!(target: "downloads", "all downloads completed");
        Ok(DownloadOutcome::AllComplete)
    }

    pub fn has_persisted_batch(&self) -> bool {
        self.prefs.downloads_in_progress()
    }

    /// Re-attach to a batch persisted by an earlier process.
    ///
    /// Returns `None` when nothing was persisted. Transfers still pending
    /// are left alone; finished ones are replayed through
    /// [`Self::on_item_finished`].
    pub fn resume_from_persisted_state(&mut self) -> ProvisionResult<Option<DownloadOutcome>> {
        if !self.has_persisted_batch() {
            return Ok(None);
        }

        self.enqueued = self.prefs.enqueued_downloads();
        self.completed.clear();
        info!(target: "downloads", count = self.enqueued.len(), "resuming persisted download batch");

        let ids: Vec<DownloadId> = self.enqueued.iter().copied().collect();
        for id in ids {
            if self.transport.status(id) == TransferStatus::Pending {
                continue;
            }
            let outcome = self.on_item_finished(id)?;
            if !matches!(outcome, DownloadOutcome::Progress { .. }) {
                return Ok(Some(outcome));
            }
        }
        Ok(Some(self.progress()))
    }

    /// Cancel every outstanding transfer of the active batch.
    pub fn cancel_all(&mut self) -> ProvisionResult<()> {
        if self.enqueued.is_empty() && !self.has_persisted_batch() {
            return Ok(());
        }
        info!(target: "downloads", count = self.enqueued.len(), "cancelling download batch");
        self.abort_batch()
    }

    fn progress(&self) -> DownloadOutcome {
        DownloadOutcome::Progress {
            completed: self.completed.len(),
            total: self.enqueued.len(),
        }
    }

    fn abort_batch(&mut self) -> ProvisionResult<()> {
        let ids: Vec<DownloadId> = self.enqueued.iter().copied().collect();
        self.transport.cancel(&ids);
        self.finish_batch()
    }

    fn finish_batch(&mut self) -> ProvisionResult<()> {
        self.enqueued.clear();
        self.completed.clear();
        self.prefs.clear_enqueued_downloads()
    }

    fn clear_download_dir(&self) -> ProvisionResult<()> {
        fs::create_dir_all(&self.download_dir)?;
        for entry in fs::read_dir(&self.download_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Check every downloaded rootfs archive against the manifest entry for
    /// our architecture. No manifest means no expected digest, which fails.
    fn verify_rootfs_checksums(&self) -> ProvisionResult<()> {
        let files = list_files(&self.download_dir)?;

        let expected = files
            .iter()
            .filter(|path| file_name(path).contains(&self.checksum.manifest_marker))
            .filter_map(|path| fs::read_to_string(path).ok())
            .filter_map(|contents| integrity::parse_manifest_digest(&contents, &self.checksum.arch))
            .last()
            .unwrap_or_default();

        for path in files.iter().filter(|path| file_name(path).contains(ROOTFS_ARCHIVE_MARKER)) {
            if !integrity::verify(&expected, path, self.checksum.algorithm) {
                return Err(ProvisionError::IntegrityFailure { file: path.clone() });
            }
        }
        Ok(())
    }
}

pub(crate) fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
