//! In-process fakes for the startup pipeline's collaborators.
//!
//! None of these touch the network or spawn processes; downloads are written
//! straight into the destination the coordinator asks for.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use rootfs_sessions::config::Config;
use rootfs_sessions::error::{ProvisionError, ProvisionResult};
use rootfs_sessions::paths::AppPaths;
use rootfs_sessions::prefs::AssetPreferences;
use rootfs_sessions::provision::download::{DownloadCoordinator, DownloadFailureReason};
use rootfs_sessions::provision::installer::ArchiveInstaller;
use rootfs_sessions::provision::integrity::{self, DigestAlgorithm};
use rootfs_sessions::provision::manifest::{App, AssetSource};
use rootfs_sessions::provision::storage::{FreeSpace, NetworkStatus};
use rootfs_sessions::provision::transport::{DownloadId, DownloadTransport, TransferStatus};
use rootfs_sessions::provision::AssetBundle;
use rootfs_sessions::server::env::ServerEnv;
use rootfs_sessions::server::{LocalServerSupervisor, SandboxHost};
use rootfs_sessions::session::{PipelineUpdate, StartupDeps};

pub const BASE_URL: &str = "https://assets.test";
pub const ARCH: &str = "arm64";
pub const ROOTFS: &str = "arm64-rootfs.tar.gz";

// ---------------------------------------------------------------------------
// Archives
// ---------------------------------------------------------------------------

pub fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn md5_hex(bytes: &[u8]) -> String {
    let file = tempfile::NamedTempFile::new().unwrap();
    fs::write(file.path(), bytes).unwrap();
    integrity::checksum(file.path(), DigestAlgorithm::Md5)
        .unwrap()
        .as_hex()
        .to_string()
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Vec<u8>),
    Fail(DownloadFailureReason),
    /// Stays pending until [`FakeTransport::complete`].
    Hold,
}

/// Completes every transfer synchronously inside `enqueue` unless told to
/// hold or fail it.
pub struct FakeTransport {
    next_id: AtomicU64,
    payloads: Mutex<HashMap<String, Payload>>,
    statuses: Mutex<HashMap<DownloadId, TransferStatus>>,
    destinations: Mutex<HashMap<DownloadId, PathBuf>>,
    enqueued: Mutex<Vec<(DownloadId, String)>>,
    cancelled: Mutex<Vec<DownloadId>>,
    finished_tx: mpsc::UnboundedSender<DownloadId>,
    finished_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DownloadId>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first_id: u64) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            next_id: AtomicU64::new(first_id),
            payloads: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            destinations: Mutex::new(HashMap::new()),
            enqueued: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            finished_tx,
            finished_rx: tokio::sync::Mutex::new(finished_rx),
        }
    }

    pub fn serve(&self, url: &str, payload: Payload) {
        self.payloads.lock().unwrap().insert(url.to_string(), payload);
    }

    /// Pretend a transfer from an earlier process is in `status`.
    pub fn set_status(&self, id: DownloadId, status: TransferStatus) {
        self.statuses.lock().unwrap().insert(id, status);
    }

    /// Finish a held transfer.
    pub fn complete(&self, id: DownloadId, bytes: &[u8]) {
        if let Some(dest) = self.destinations.lock().unwrap().get(&id) {
            write_file(dest, bytes);
        }
        self.set_status(id, TransferStatus::Succeeded);
        let _ = self.finished_tx.send(id);
    }

    pub fn notify(&self, id: DownloadId) {
        let _ = self.finished_tx.send(id);
    }

    pub fn enqueued(&self) -> Vec<(DownloadId, String)> {
        self.enqueued.lock().unwrap().clone()
    }

    pub fn enqueued_urls(&self) -> Vec<String> {
        self.enqueued().into_iter().map(|(_, url)| url).collect()
    }

    pub fn id_for(&self, url: &str) -> Option<DownloadId> {
        self.enqueued()
            .into_iter()
            .find(|(_, u)| u == url)
            .map(|(id, _)| id)
    }

    pub fn cancelled(&self) -> Vec<DownloadId> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl DownloadTransport for FakeTransport {
    fn enqueue(&self, url: &str, destination: &Path) -> DownloadId {
        let id = DownloadId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.enqueued.lock().unwrap().push((id, url.to_string()));
        self.destinations
            .lock()
            .unwrap()
            .insert(id, destination.to_path_buf());

        let payload = self
            .payloads
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(Payload::Bytes(Vec::new()));
        match payload {
            Payload::Bytes(bytes) => {
                write_file(destination, &bytes);
                self.set_status(id, TransferStatus::Succeeded);
                let _ = self.finished_tx.send(id);
            }
            Payload::Fail(reason) => {
                self.set_status(id, TransferStatus::Failed(reason));
                let _ = self.finished_tx.send(id);
            }
            Payload::Hold => self.set_status(id, TransferStatus::Pending),
        }
        id
    }

    fn status(&self, id: DownloadId) -> TransferStatus {
        self.statuses
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or(TransferStatus::Failed(DownloadFailureReason::ReasonNotFound))
    }

    fn cancel(&self, ids: &[DownloadId]) {
        let mut statuses = self.statuses.lock().unwrap();
        for id in ids {
            if statuses.get(id) == Some(&TransferStatus::Pending) {
                statuses.insert(*id, TransferStatus::Failed(DownloadFailureReason::Cancelled));
                self.cancelled.lock().unwrap().push(*id);
            }
        }
    }

    async fn next_finished(&self) -> Option<DownloadId> {
        self.finished_rx.lock().await.recv().await
    }
}

pub fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, bytes).unwrap();
}

// ---------------------------------------------------------------------------
// Asset source
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeSource {
    lists: Mutex<HashMap<String, Vec<AssetBundle>>>,
    offline: AtomicBool,
    fetches: AtomicUsize,
}

impl FakeSource {
    pub fn publish(&self, repository: &str, entries: &[(&str, u64, u64)]) {
        let bundles = entries
            .iter()
            .map(|(archive, version, size)| AssetBundle::new(repository, archive, *version, *size))
            .collect();
        self.lists.lock().unwrap().insert(repository.to_string(), bundles);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetSource for FakeSource {
    fn base_url(&self) -> &str {
        BASE_URL
    }

    async fn fetch_apps_list(&self) -> ProvisionResult<Vec<App>> {
        Ok(Vec::new())
    }

    async fn fetch_asset_list(&self, repository: &str) -> ProvisionResult<Vec<AssetBundle>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProvisionError::AssetList("offline".to_string()));
        }
        self.lists
            .lock()
            .unwrap()
            .get(repository)
            .cloned()
            .ok_or_else(|| ProvisionError::AssetList(format!("no list for {repository}")))
    }
}

// ---------------------------------------------------------------------------
// Sandbox host
// ---------------------------------------------------------------------------

/// Writes the SSH pid file on launch and reports the server alive after
/// `dead_polls` liveness checks.
pub struct FakeHost {
    next_pid: AtomicU32,
    dead_polls: AtomicUsize,
    pub launches: Mutex<Vec<(PathBuf, String, ServerEnv)>>,
    pub kills: Mutex<Vec<(u32, Option<u32>)>>,
}

pub const SERVER_PID: u32 = 77;

impl FakeHost {
    pub fn new(dead_polls: usize) -> Self {
        Self {
            next_pid: AtomicU32::new(4000),
            dead_polls: AtomicUsize::new(dead_polls),
            launches: Mutex::new(Vec::new()),
            kills: Mutex::new(Vec::new()),
        }
    }

    pub fn never_alive() -> Self {
        Self::new(usize::MAX)
    }
}

#[async_trait]
impl SandboxHost for FakeHost {
    async fn launch(&self, filesystem_dir: &Path, script: &str, env: &ServerEnv) -> ProvisionResult<u32> {
        let pid_file = if script.contains("VNC") {
            let user = env.get("INITIAL_USERNAME").cloned().unwrap_or_default();
            filesystem_dir.join(format!("home/{user}/.vnc/localhost:51.pid"))
        } else {
            filesystem_dir.join("run/dropbear.pid")
        };
        write_file(&pid_file, format!("{SERVER_PID}\n").as_bytes());
        self.launches
            .lock()
            .unwrap()
            .push((filesystem_dir.to_path_buf(), script.to_string(), env.clone()));
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn kill_tree(&self, launcher_pid: u32, server_pid: Option<u32>) -> ProvisionResult<()> {
        self.kills.lock().unwrap().push((launcher_pid, server_pid));
        Ok(())
    }

    async fn is_alive(&self, _server_pid: u32) -> ProvisionResult<bool> {
        let remaining = self.dead_polls.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(true);
        }
        if remaining != usize::MAX {
            self.dead_polls.store(remaining - 1, Ordering::SeqCst);
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Storage and network
// ---------------------------------------------------------------------------

pub struct FixedFreeSpace(pub u64);

impl FreeSpace for FixedFreeSpace {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

pub struct FixedNetwork(pub bool);

impl NetworkStatus for FixedNetwork {
    fn is_metered(&self) -> bool {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A temporary install root with a published `support` repository and a
/// `debian` distribution whose rootfs checksum matches its manifest.
pub struct Harness {
    pub root: tempfile::TempDir,
    pub paths: AppPaths,
    pub config: Config,
    pub prefs: AssetPreferences,
    pub source: Arc<FakeSource>,
    pub transport: Arc<FakeTransport>,
    pub host: Arc<FakeHost>,
    pub supervisor: Arc<LocalServerSupervisor>,
    pub free_space: u64,
    pub metered: bool,
    pub rootfs_bytes: Vec<u8>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_host(FakeHost::new(2))
    }

    pub fn with_host(host: FakeHost) -> Self {
        let root = tempfile::tempdir().unwrap();
        let paths = AppPaths::under(root.path());
        paths.ensure().unwrap();

        let mut config = Config::default();
        config.assets.base_url = BASE_URL.to_string();
        config.assets.architecture = Some(ARCH.to_string());
        config.startup.poll_interval_ms = 10;
        config.startup.start_timeout_secs = 5;
        config.startup.extraction_overhead_bytes = 0;

        let prefs = AssetPreferences::open(paths.state_file()).unwrap();
        let host = Arc::new(host);
        let supervisor = Arc::new(LocalServerSupervisor::new(
            host.clone(),
            &paths.data,
            config.server.clone(),
        ));

        let harness = Self {
            root,
            paths,
            config,
            prefs,
            source: Arc::new(FakeSource::default()),
            transport: Arc::new(FakeTransport::new()),
            host,
            supervisor,
            free_space: u64::MAX,
            metered: false,
            rootfs_bytes: tar_gz(&[
                ("bin/sh", b"#!/bin/sh"),
                ("etc/hostname", b"localhost"),
                ("home/user/.profile", b""),
            ]),
        };
        harness.publish(3);
        harness
    }

    /// Publish every archive at `version` with a valid checksum manifest.
    pub fn publish(&self, version: u64) {
        self.source.publish("support", &[("proot.tar.gz", version, 2048)]);
        self.source.publish(
            "debian",
            &[
                (ROOTFS, version, self.rootfs_bytes.len() as u64),
                ("MD5SUMS", version, 64),
                ("assets.tar.gz", version, 1024),
            ],
        );
        self.serve_manifest(&md5_hex(&self.rootfs_bytes));
        self.transport.serve(
            &url("support", "proot.tar.gz"),
            Payload::Bytes(tar_gz(&[("proot", b"elf"), ("killProcTree.sh", b"#!/bin/sh")])),
        );
        self.transport.serve(
            &url("debian", "assets.tar.gz"),
            Payload::Bytes(tar_gz(&[("startSSHServer.sh", b"#!/bin/sh"), ("startVNCServer.sh", b"#!/bin/sh")])),
        );
        self.transport
            .serve(&url("debian", ROOTFS), Payload::Bytes(self.rootfs_bytes.clone()));
    }

    pub fn serve_manifest(&self, digest: &str) {
        let manifest = format!("{digest}  {ROOTFS}\n0123456789abcdef0123456789abcdef  x86_64-rootfs.tar.gz\n");
        self.transport
            .serve(&url("debian", "MD5SUMS"), Payload::Bytes(manifest.into_bytes()));
    }

    pub fn coordinator(&self) -> DownloadCoordinator {
        DownloadCoordinator::new(
            self.transport.clone(),
            self.prefs.clone(),
            &self.paths.downloads,
            self.config.checksum_policy(),
        )
    }

    pub fn deps(&self) -> StartupDeps {
        StartupDeps {
            asset_source: self.source.clone(),
            downloads: Arc::new(tokio::sync::Mutex::new(self.coordinator())),
            installer: ArchiveInstaller::new(
                &self.paths.data,
                &self.paths.staging,
                self.prefs.clone(),
                self.config.integrity.manifest_marker.clone(),
            ),
            free_space: Arc::new(FixedFreeSpace(self.free_space)),
            network: Arc::new(FixedNetwork(self.metered)),
            supervisor: self.supervisor.clone(),
            prefs: self.prefs.clone(),
            config: self.config.clone(),
        }
    }

    pub fn filesystem_dir(&self, id: u64) -> PathBuf {
        self.paths.filesystem_dir(id)
    }
}

pub fn url(repository: &str, archive: &str) -> String {
    format!("{BASE_URL}/{repository}/{archive}")
}

pub fn drain(updates: &mut mpsc::UnboundedReceiver<PipelineUpdate>) -> Vec<PipelineUpdate> {
    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push(update);
    }
    seen
}

pub fn read_to_string(path: &Path) -> String {
    let mut s = String::new();
    io::Read::read_to_string(&mut File::open(path).unwrap(), &mut s).unwrap();
    s
}
