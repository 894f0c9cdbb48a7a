//! Download transport: enqueue a URL → file transfer and later ask how it
//! went.
//!
//! The coordinator only sees the [`DownloadTransport`] trait. [`HttpTransport`]
//! streams each transfer to disk in its own tokio task, so the items of a
//! batch download concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::provision::download::DownloadFailureReason;

/// Opaque identifier handed out by a transport for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub u64);

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Succeeded,
    Failed(DownloadFailureReason),
}

#[async_trait]
pub trait DownloadTransport: Send + Sync {
    /// Start downloading `url` into `destination`.
    fn enqueue(&self, url: &str, destination: &Path) -> DownloadId;

    fn status(&self, id: DownloadId) -> TransferStatus;

    /// Abort the given transfers. Unknown ids are ignored.
    fn cancel(&self, ids: &[DownloadId]);

    /// Wait for the next transfer to succeed or fail.
    ///
    /// Returns `None` once the transport is shut down.
    async fn next_finished(&self) -> Option<DownloadId>;
}

// ---------------------------------------------------------------------------
// HTTP streaming transport
// ---------------------------------------------------------------------------

struct Transfer {
    status: TransferStatus,
    destination: PathBuf,
    abort: Option<AbortHandle>,
}

type Transfers = Arc<Mutex<HashMap<DownloadId, Transfer>>>;

/// Streams downloads straight to disk with `reqwest`.
///
/// Transfers live only as long as this value. Ids persisted by an earlier
/// process are unknown here and report as failed, which makes a resumed
/// batch fail cleanly instead of waiting forever.
pub struct HttpTransport {
    client: reqwest::Client,
    next_id: AtomicU64,
    transfers: Transfers,
    finished_tx: mpsc::UnboundedSender<DownloadId>,
    finished_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DownloadId>>,
}

impl HttpTransport {
    pub fn new() -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        // Seed from the clock so ids never collide with a previous run's.
        let seed = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self {
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(seed),
            transfers: Arc::new(Mutex::new(HashMap::new())),
            finished_tx,
            finished_rx: tokio::sync::Mutex::new(finished_rx),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownloadTransport for HttpTransport {
    /// Must be called from within a tokio runtime.
    fn enqueue(&self, url: &str, destination: &Path) -> DownloadId {
        let id = DownloadId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.transfers.lock().unwrap().insert(
            id,
            Transfer {
                status: TransferStatus::Pending,
                destination: destination.to_path_buf(),
                abort: None,
            },
        );

        let client = self.client.clone();
        let transfers = Arc::clone(&self.transfers);
        let finished_tx = self.finished_tx.clone();
        let url = url.to_string();
        let destination = destination.to_path_buf();

        let task = tokio::spawn(async move {
            let status = match stream_to_file(&client, &url, &destination).await {
                Ok(bytes) => {
                    info!(target: "transport", id = %id, url = %url, bytes, "download finished");
                    TransferStatus::Succeeded
                }
                Err(reason) => {
                    warn!(target: "transport", id = %id, url = %url, %reason, "download failed");
                    TransferStatus::Failed(reason)
                }
            };
            record_outcome(&transfers, id, status);
            let _ = finished_tx.send(id);
        });

        if let Some(transfer) = self.transfers.lock().unwrap().get_mut(&id) {
            transfer.abort = Some(task.abort_handle());
        }
        debug!(target: "transport", id = %id, "download enqueued");
        id
    }

    fn status(&self, id: DownloadId) -> TransferStatus {
        self.transfers
            .lock()
            .unwrap()
            .get(&id)
            .map(|t| t.status.clone())
            .unwrap_or(TransferStatus::Failed(DownloadFailureReason::ReasonNotFound))
    }

    fn cancel(&self, ids: &[DownloadId]) {
        let mut transfers = self.transfers.lock().unwrap();
        for id in ids {
            let Some(transfer) = transfers.get_mut(id) else {
                continue;
            };
            if transfer.status != TransferStatus::Pending {
                continue;
            }
            if let Some(abort) = transfer.abort.take() {
                abort.abort();
            }
            transfer.status = TransferStatus::Failed(DownloadFailureReason::Cancelled);
            let _ = std::fs::remove_file(&transfer.destination);
            debug!(target: "transport", id = %id, "download cancelled");
        }
    }

    async fn next_finished(&self) -> Option<DownloadId> {
        self.finished_rx.lock().await.recv().await
    }
}

/// A transfer cancelled while its task was finishing stays cancelled.
fn record_outcome(transfers: &Transfers, id: DownloadId, status: TransferStatus) {
    if let Some(transfer) = transfers.lock().unwrap().get_mut(&id) {
        if transfer.status == TransferStatus::Pending {
            transfer.status = status;
        }
    }
}

/// Only a file this transfer created is removed on failure.
async fn stream_to_file(
    client: &reqwest::Client,
    url: &str,
    destination: &Path,
) -> Result<u64, DownloadFailureReason> {
    let response = client.get(url).send().await.map_err(classify_reqwest)?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadFailureReason::HttpError(status.as_u16()));
    }

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(classify_io)?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
        .await
        .map_err(classify_io)?;

    let written = write_body(response, &mut file).await;
    if written.is_err() {
        drop(file);
        let _ = tokio::fs::remove_file(destination).await;
    }
    written
}

async fn write_body(response: reqwest::Response, file: &mut tokio::fs::File) -> Result<u64, DownloadFailureReason> {
    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(classify_reqwest)?;
        file.write_all(&chunk).await.map_err(classify_io)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(classify_io)?;
    Ok(written)
}

fn classify_reqwest(e: reqwest::Error) -> DownloadFailureReason {
    if e.is_redirect() {
        DownloadFailureReason::TooManyRedirects
    } else if let Some(status) = e.status() {
        DownloadFailureReason::HttpError(status.as_u16())
    } else if e.is_body() || e.is_decode() {
        DownloadFailureReason::HttpProcessing
    } else {
        DownloadFailureReason::Unknown
    }
}

fn classify_io(e: std::io::Error) -> DownloadFailureReason {
    match e.kind() {
        std::io::ErrorKind::AlreadyExists => DownloadFailureReason::DestinationExists,
        std::io::ErrorKind::StorageFull => DownloadFailureReason::InsufficientStorage,
        _ => DownloadFailureReason::FileError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_failure_reasons() {
        let exists = std::io::Error::from(std::io::ErrorKind::AlreadyExists);
        assert_eq!(classify_io(exists), DownloadFailureReason::DestinationExists);

        let full = std::io::Error::from(std::io::ErrorKind::StorageFull);
        assert_eq!(classify_io(full), DownloadFailureReason::InsufficientStorage);

        let other = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(classify_io(other), DownloadFailureReason::FileError);
    }

    #[tokio::test]
    async fn unknown_ids_report_failed() {
        let transport = HttpTransport::new();
        assert_eq!(
            transport.status(DownloadId(1)),
            TransferStatus::Failed(DownloadFailureReason::ReasonNotFound)
        );
    }

    #[test]
    fn late_outcome_does_not_overwrite_cancellation() {
        let transfers: Transfers = Arc::new(Mutex::new(HashMap::new()));
        transfers.lock().unwrap().insert(
            DownloadId(3),
            Transfer {
                status: TransferStatus::Failed(DownloadFailureReason::Cancelled),
                destination: PathBuf::from("unused"),
                abort: None,
            },
        );

        record_outcome(&transfers, DownloadId(3), TransferStatus::Succeeded);

        assert_eq!(
            transfers.lock().unwrap()[&DownloadId(3)].status,
            TransferStatus::Failed(DownloadFailureReason::Cancelled)
        );
    }

    #[tokio::test]
    async fn failed_transfer_keeps_a_file_it_did_not_create() {
        let transport = HttpTransport::new();
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("support-proot.tar.gz-3");
        std::fs::write(&existing, b"installed earlier").unwrap();

        // Nothing listens on the discard port, so the request fails.
        let id = transport.enqueue("http://127.0.0.1:9/proot.tar.gz", &existing);
        assert_eq!(transport.next_finished().await, Some(id));

        assert!(matches!(transport.status(id), TransferStatus::Failed(_)));
        assert_eq!(std::fs::read(&existing).unwrap(), b"installed earlier");
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let transport = HttpTransport::new();
        let dir = tempfile::tempdir().unwrap();
        // Unroutable URL; the transfer fails in the background.
        let a = transport.enqueue("http://127.0.0.1:9/a", &dir.path().join("a"));
        let b = transport.enqueue("http://127.0.0.1:9/b", &dir.path().join("b"));
        assert_ne!(a, b);
        transport.cancel(&[a, b]);
    }
}
