//! Durable key/value state that must survive process restarts.
//!
//! Holds the enqueued download identifiers of the active batch, the
//! "downloads in progress" flag and the per-repository asset versions. The
//! whole document is rewritten on every mutation through a temp file and a
//! rename, so a crash never leaves a half-written state file behind.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProvisionResult;
use crate::provision::transport::DownloadId;
use crate::provision::AssetBundle;

/// Remote and locally installed version of one asset key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPair {
    pub remote: u64,
    pub local: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedState {
    enqueued_downloads: BTreeSet<DownloadId>,
    downloads_in_progress: bool,
    versions: BTreeMap<String, VersionPair>,
    asset_lists_refreshed_at: Option<DateTime<Utc>>,
    asset_lists: BTreeMap<String, Vec<AssetBundle>>,
}

/// Shared handle to the persisted asset state.
///
/// Cloning is cheap; all clones see the same document.
#[derive(Clone)]
pub struct AssetPreferences {
    path: PathBuf,
    state: Arc<Mutex<PersistedState>>,
}

impl AssetPreferences {
    /// Load the state file at `path`, starting empty when it does not exist.
    ///
    /// A corrupt file is logged and replaced by empty state rather than
    /// refusing to start.
    pub fn open(path: impl Into<PathBuf>) -> ProvisionResult<Self> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(target: "prefs", path = %path.display(), error = %e, "state file unreadable, starting empty");
                PersistedState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn downloads_in_progress(&self) -> bool {
        self.lock().downloads_in_progress
    }

    pub fn enqueued_downloads(&self) -> BTreeSet<DownloadId> {
        self.lock().enqueued_downloads.clone()
    }

    /// Record a freshly submitted batch and mark downloads as in progress.
    pub fn set_enqueued_downloads(&self, ids: &BTreeSet<DownloadId>) -> ProvisionResult<()> {
        self.update(|state| {
            state.enqueued_downloads = ids.clone();
            state.downloads_in_progress = true;
        })
    }

    /// Forget the active batch.
    pub fn clear_enqueued_downloads(&self) -> ProvisionResult<()> {
        self.update(|state| {
            state.enqueued_downloads.clear();
            state.downloads_in_progress = false;
        })
    }

    pub fn version(&self, key: &str) -> VersionPair {
        self.lock().versions.get(key).copied().unwrap_or_default()
    }

    pub fn versions(&self) -> BTreeMap<String, VersionPair> {
        self.lock().versions.clone()
    }

    pub fn set_remote_version(&self, key: &str, version: u64) -> ProvisionResult<()> {
        self.update(|state| {
            state.versions.entry(key.to_string()).or_default().remote = version;
        })
    }

    pub fn set_local_version(&self, key: &str, version: u64) -> ProvisionResult<()> {
        self.update(|state| {
            state.versions.entry(key.to_string()).or_default().local = version;
        })
    }

    pub fn asset_lists_refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.lock().asset_lists_refreshed_at
    }

    pub fn set_asset_lists_refreshed_at(&self, at: DateTime<Utc>) -> ProvisionResult<()> {
        self.update(|state| state.asset_lists_refreshed_at = Some(at))
    }

    /// Last asset list fetched for `repository`.
    pub fn cached_asset_list(&self, repository: &str) -> Option<Vec<AssetBundle>> {
        self.lock().asset_lists.get(repository).cloned()
    }

    pub fn set_cached_asset_list(&self, repository: &str, bundles: &[AssetBundle]) -> ProvisionResult<()> {
        self.update(|state| {
            for bundle in bundles {
                state.versions.entry(bundle.version_key()).or_default().remote = bundle.remote_version;
            }
            state.asset_lists.insert(repository.to_string(), bundles.to_vec());
        })
    }

    /// Explicit cache clear: drops versions, refresh time and any batch.
    pub fn clear_all(&self) -> ProvisionResult<()> {
        self.update(|state| *state = PersistedState::default())
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Memory only changes once the new document is on disk.
    fn update(&self, mutate: impl FnOnce(&mut PersistedState)) -> ProvisionResult<()> {
        let mut state = self.lock();
        let mut next = state.clone();
        mutate(&mut next);
        write_atomically(&self.path, &serde_json::to_vec_pretty(&next)?)?;
        *state = next;
        debug!(target: "prefs", path = %self.path.display(), "state persisted");
        Ok(())
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}
