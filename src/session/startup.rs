//! Session startup pipeline.
//!
//! ```text
//! SessionStartup::spawn(deps, session)
//!     ├─► SessionStartupHandle      inputs + cancellation, usable from any thread
//!     ├─► UnboundedReceiver<PipelineUpdate>
//!     └─► JoinHandle<StartupOutcome>
//!
//! setup ─► service type? ─► credentials? ─► asset lists ─► updates
//!       ─► resume persisted batch? ─► install ─► submit what is still missing
//!       ─► install ─► verify filesystem ─► verify storage ─► extract
//!       ─► start server ─► wait until running
//! ```
//!
//! Each step reports a [`ProgressBarUpdateState`] before it starts. Exactly
//! one terminal update ends the stream.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use statig::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ProvisionError;
use crate::prefs::AssetPreferences;
use crate::provision::download::{DownloadCoordinator, DownloadFailureReason, DownloadOutcome};
use crate::provision::installer::{self, ArchiveInstaller};
use crate::provision::manifest::AssetSource;
use crate::provision::storage::{self, FreeSpace, NetworkStatus};
use crate::provision::{AssetBundle, AssetKind, DownloadRequirement};
use crate::server::LocalServerSupervisor;
use crate::session::{
    IllegalState, PipelineFailure, PipelineInput, PipelineUpdate, ProgressBarUpdateState, ServiceType,
    Session, UserInputRequiredState,
};
use crate::state_machine::startup_sm::{InputKind, State as StartupState, StartupEvent, StartupMachine};

/// Collaborators a startup run needs.
#[derive(Clone)]
pub struct StartupDeps {
    pub asset_source: Arc<dyn AssetSource>,
    /// Shared so only one run provisions at a time.
    pub downloads: Arc<tokio::sync::Mutex<DownloadCoordinator>>,
    pub installer: ArchiveInstaller,
    pub free_space: Arc<dyn FreeSpace>,
    pub network: Arc<dyn NetworkStatus>,
    pub supervisor: Arc<LocalServerSupervisor>,
    pub prefs: AssetPreferences,
    pub config: Config,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    Started(Session),
    Failed(PipelineFailure),
    Cancelled,
    Illegal(IllegalState),
    CanOnlyStartSingleSession,
}

/// Entry points for answering the pipeline's input requests.
#[derive(Clone)]
pub struct SessionStartupHandle {
    inputs: mpsc::UnboundedSender<PipelineInput>,
    cancel: CancellationToken,
}

impl SessionStartupHandle {
    pub fn submit_filesystem_credentials(&self, username: &str, ssh_password: &str, vnc_password: &str) {
        self.send(PipelineInput::FilesystemCredentials {
            username: username.to_string(),
            ssh_password: ssh_password.to_string(),
            vnc_password: vnc_password.to_string(),
        });
    }

    pub fn submit_app_service_type(&self, service_type: ServiceType) {
        self.send(PipelineInput::AppServiceType(service_type));
    }

    /// Approve a large download, possibly with a reduced set.
    pub fn start_asset_downloads(&self, requirements: Vec<DownloadRequirement>) {
        self.send(PipelineInput::StartAssetDownloads(requirements));
    }

    pub fn low_available_storage_acknowledged(&self) {
        self.send(PipelineInput::LowStorageAcknowledged);
    }

    /// The user dismissed an input request; the run ends as cancelled.
    pub fn handle_user_input_cancelled(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn send(&self, input: PipelineInput) {
        if self.inputs.send(input).is_err() {
            debug!(target: "startup", "input dropped, pipeline already finished");
        }
    }
}

/// Early exit from the pipeline body.
enum Halt {
    Failure(PipelineFailure),
    Cancelled,
    Illegal(IllegalState),
    SingleSession,
}

type Step<T> = Result<T, Halt>;

pub struct SessionStartup {
    deps: StartupDeps,
    session: Session,
    updates: mpsc::UnboundedSender<PipelineUpdate>,
    inputs: mpsc::UnboundedReceiver<PipelineInput>,
    cancel: CancellationToken,
    machine: StateMachine<StartupMachine>,
}

impl SessionStartup {
    /// Start a run on the current tokio runtime.
    pub fn spawn(
        deps: StartupDeps,
        session: Session,
    ) -> (
        SessionStartupHandle,
        mpsc::UnboundedReceiver<PipelineUpdate>,
        JoinHandle<StartupOutcome>,
    ) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let startup = SessionStartup {
            machine: StartupMachine::new(session.id).state_machine(),
            deps,
            session,
            updates: updates_tx,
            inputs: inputs_rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(startup.run());

        let handle = SessionStartupHandle {
            inputs: inputs_tx,
            cancel,
        };
        (handle, updates_rx, task)
    }

    async fn run(mut self) -> StartupOutcome {
        info!(target: "startup", session = self.session.id, fs = self.session.filesystem_id, "session startup begins");
        let result = self.execute().await;

        let (update, outcome) = match result {
            Ok(session) => {
                self.machine.handle(&StartupEvent::Finish);
                info!(target: "startup", session = session.id, pid = ?session.pid, "session started");
                (
                    PipelineUpdate::Progress(ProgressBarUpdateState::OperationComplete),
                    StartupOutcome::Started(session),
                )
            }
            Err(Halt::Failure(failure)) => {
                self.machine.handle(&StartupEvent::Finish);
                warn!(target: "startup", session = self.session.id, %failure, "session startup failed");
                (PipelineUpdate::Failure(failure.clone()), StartupOutcome::Failed(failure))
            }
            Err(Halt::Cancelled) => {
                self.machine.handle(&StartupEvent::Cancel);
                info!(target: "startup", session = self.session.id, "session startup cancelled");
                (PipelineUpdate::Cancelled, StartupOutcome::Cancelled)
            }
            Err(Halt::Illegal(state)) => {
                warn!(target: "startup", session = self.session.id, state = state.name(), %state, "illegal state");
                (PipelineUpdate::Illegal(state.clone()), StartupOutcome::Illegal(state))
            }
            Err(Halt::SingleSession) => {
                self.machine.handle(&StartupEvent::Finish);
                (PipelineUpdate::CanOnlyStartSingleSession, StartupOutcome::CanOnlyStartSingleSession)
            }
        };
        self.emit(update);
        outcome
    }

    async fn execute(&mut self) -> Step<Session> {
        // Held until the run ends.
        let _claim = if self.deps.config.startup.single_session {
            let claim = self.deps.supervisor.claim_exclusive(self.session.id);
            Some(claim.ok_or(Halt::SingleSession)?)
        } else {
            None
        };

        self.progress(ProgressBarUpdateState::StartingSetup);
        self.ensure_service_type().await?;
        self.ensure_credentials().await?;

        let mut bundles = self.asset_lists().await?;

        self.progress(ProgressBarUpdateState::CheckingForAssetUpdates);
        let filesystem_dir = self.deps.supervisor.filesystem_dir(self.session.filesystem_id);
        let extracted = installer::is_filesystem_extracted(&filesystem_dir);
        let requirements = self.required_downloads(&bundles, extracted);

        {
            let downloads = Arc::clone(&self.deps.downloads);
            let mut coordinator = downloads.lock().await;

            let mut missing = requirements.clone();
            if self.resume_downloads(&mut coordinator).await? {
                self.progress(ProgressBarUpdateState::CopyingDownloads);
                self.install(coordinator.download_dir().to_path_buf()).await?;
                self.refresh_local_versions(&mut bundles);
                missing = self.required_downloads(&bundles, extracted);
            }
            if self.submit_downloads(&mut coordinator, &missing).await? {
                self.progress(ProgressBarUpdateState::CopyingDownloads);
                self.install(coordinator.download_dir().to_path_buf()).await?;
            }
        }

        self.progress(ProgressBarUpdateState::VerifyingFilesystem);
        let rootfs_archive = if extracted {
            None
        } else {
            Some(self.rootfs_archive(&bundles)?)
        };

        self.progress(ProgressBarUpdateState::VerifyingAvailableStorage);
        self.verify_storage(&requirements).await?;

        self.prepare_filesystem(filesystem_dir, rootfs_archive).await?;

        self.progress(ProgressBarUpdateState::StartingSession);
        self.start_server().await?;

        self.session.active = true;
        Ok(self.session.clone())
    }

    // ------------------------------------------------------------------
    // User input
    // ------------------------------------------------------------------

    async fn ensure_service_type(&mut self) -> Step<()> {
        if self.session.service_type != ServiceType::Unselected {
            return Ok(());
        }
        let input = self
            .await_input(InputKind::AppServiceType, UserInputRequiredState::AppServiceTypePreferenceRequired)
            .await?;
        if let PipelineInput::AppServiceType(service_type) = input {
            if service_type == ServiceType::Unselected {
                return Err(Halt::Illegal(IllegalState::TransitionRejected(
                    "no service type selected".to_string(),
                )));
            }
            self.session.service_type = service_type;
        }
        Ok(())
    }

    async fn ensure_credentials(&mut self) -> Step<()> {
        if self.session.has_credentials() {
            return Ok(());
        }
        let input = self
            .await_input(InputKind::FilesystemCredentials, UserInputRequiredState::FilesystemCredentialsRequired)
            .await?;
        if let PipelineInput::FilesystemCredentials {
            username,
            ssh_password,
            vnc_password,
        } = input
        {
            self.session.username = username;
            self.session.ssh_password = ssh_password;
            self.session.vnc_password = vnc_password;
        }
        Ok(())
    }

    /// Suspend until the awaited input arrives. Any other input is illegal.
    async fn await_input(&mut self, kind: InputKind, request: UserInputRequiredState) -> Step<PipelineInput> {
        self.machine.handle(&StartupEvent::AwaitInput(kind));
        self.emit(PipelineUpdate::UserInputRequired(request));

        let input = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
            input = self.inputs.recv() => input.ok_or(Halt::Cancelled)?,
        };
        self.machine.handle(&StartupEvent::InputReceived(InputKind::of(&input)));

        match self.machine.state() {
            StartupState::Working {} => Ok(input),
            StartupState::Illegal { expected, received } => Err(Halt::Illegal(IllegalState::UnexpectedUserInput {
                expected: expected.map(|k| k.to_string()),
                received: received.to_string(),
            })),
            other => Err(Halt::Illegal(IllegalState::TransitionRejected(format!("{other:?}")))),
        }
    }

    // ------------------------------------------------------------------
    // Asset lists and updates
    // ------------------------------------------------------------------

    fn repositories(&self) -> Vec<String> {
        vec![
            self.deps.config.assets.support_repository.clone(),
            self.session.distribution.clone(),
        ]
    }

    async fn asset_lists(&mut self) -> Step<Vec<AssetBundle>> {
        let repos = self.repositories();
        let prefs = self.deps.prefs.clone();
        let max_age = chrono::Duration::from_std(self.deps.config.asset_list_max_age()).unwrap_or(chrono::Duration::MAX);
        let fresh = prefs
            .asset_lists_refreshed_at()
            .is_some_and(|at| Utc::now().signed_duration_since(at) < max_age);

        let mut lists = Vec::new();
        if fresh && repos.iter().all(|r| prefs.cached_asset_list(r).is_some()) {
            debug!(target: "startup", "asset lists are fresh, skipping fetch");
            for repo in &repos {
                lists.extend(prefs.cached_asset_list(repo).unwrap_or_default());
            }
        } else {
            self.progress(ProgressBarUpdateState::FetchingAssetLists);
            let mut all_fetched = true;
            for repo in &repos {
                let fetched = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                    fetched = self.deps.asset_source.fetch_asset_list(repo) => fetched,
                };
                match fetched {
                    Ok(bundles) => {
                        if let Err(e) = prefs.set_cached_asset_list(repo, &bundles) {
                            warn!(target: "startup", repo = %repo, error = %e, "cannot cache asset list");
                        }
                        lists.extend(bundles);
                    }
                    Err(e) => {
                        all_fetched = false;
                        match prefs.cached_asset_list(repo) {
                            Some(cached) => {
                                warn!(target: "startup", repo = %repo, error = %e, "asset list fetch failed, using cached list");
                                lists.extend(cached);
                            }
                            None => {
                                warn!(target: "startup", repo = %repo, error = %e, "asset list unavailable");
                                return Err(Halt::Failure(PipelineFailure::AssetListsUnavailable));
                            }
                        }
                    }
                }
            }
            if all_fetched {
                if let Err(e) = prefs.set_asset_lists_refreshed_at(Utc::now()) {
                    warn!(target: "startup", error = %e, "cannot persist asset list refresh time");
                }
            }
        }

        self.refresh_local_versions(&mut lists);
        Ok(lists)
    }

    fn refresh_local_versions(&self, bundles: &mut [AssetBundle]) {
        for bundle in bundles {
            bundle.local_version = self.deps.prefs.version(&bundle.version_key()).local;
        }
    }

    /// The distribution's rootfs built for this host.
    fn is_host_rootfs(&self, bundle: &AssetBundle) -> bool {
        bundle.repository == self.session.distribution && bundle.is_rootfs_for(&self.deps.config.architecture())
    }

    fn required_downloads(&self, bundles: &[AssetBundle], extracted: bool) -> Vec<DownloadRequirement> {
        let base_url = self.deps.asset_source.base_url();
        let marker = &self.deps.config.integrity.manifest_marker;

        let rootfs_needed = !extracted
            && bundles.iter().any(|b| {
                self.is_host_rootfs(b)
                    && (b.is_outdated()
                        || !self.deps.installer.repo_dir(&b.repository).join(&b.archive_filename).exists())
            });

        bundles
            .iter()
            .filter(|b| {
                if b.archive_filename.contains(marker.as_str()) {
                    return rootfs_needed && b.repository == self.session.distribution;
                }
                match b.kind {
                    AssetKind::Rootfs => rootfs_needed && self.is_host_rootfs(b),
                    AssetKind::Support => {
                        b.is_outdated() || !self.deps.installer.repo_dir(&b.repository).exists()
                    }
                }
            })
            .map(|b| DownloadRequirement::for_bundle(base_url, b))
            .collect()
    }

    // ------------------------------------------------------------------
    // Downloads and installation
    // ------------------------------------------------------------------

    /// Finish a batch persisted by an earlier process. Returns whether it
    /// completed and needs installing.
    ///
    /// A batch the transport has no record of is dropped so this run can
    /// submit its own.
    async fn resume_downloads(&mut self, coordinator: &mut DownloadCoordinator) -> Step<bool> {
        if !coordinator.has_persisted_batch() {
            return Ok(false);
        }
        info!(target: "startup", "resuming persisted download batch");
        let outcome = coordinator.resume_from_persisted_state().map_err(download_failure)?;
        match self.await_batch(coordinator, outcome).await? {
            Ok(()) => Ok(true),
            Err(DownloadFailureReason::ReasonNotFound) => {
                info!(target: "startup", "persisted batch is unknown to the transport, starting over");
                Ok(false)
            }
            Err(reason) => Err(self.batch_failed(reason)),
        }
    }

    /// Submit `requirements` as a new batch. Returns whether one completed.
    async fn submit_downloads(
        &mut self,
        coordinator: &mut DownloadCoordinator,
        requirements: &[DownloadRequirement],
    ) -> Step<bool> {
        if requirements.is_empty() {
            return Ok(false);
        }
        let requirements = self.confirm_large_download(requirements).await?;
        if requirements.is_empty() {
            return Ok(false);
        }
        let batch = coordinator.submit_batch(&requirements).map_err(download_failure)?;
        let outcome = Some(DownloadOutcome::Progress {
            completed: 0,
            total: batch.len(),
        });
        match self.await_batch(coordinator, outcome).await? {
            Ok(()) => Ok(true),
            Err(reason) => Err(self.batch_failed(reason)),
        }
    }

    /// Follow the active batch until it completes or fails.
    async fn await_batch(
        &mut self,
        coordinator: &mut DownloadCoordinator,
        mut outcome: Option<DownloadOutcome>,
    ) -> Step<Result<(), DownloadFailureReason>> {
        let transport = Arc::clone(coordinator.transport());
        loop {
            match outcome.take() {
                Some(DownloadOutcome::Progress { completed, total }) => {
                    self.progress(ProgressBarUpdateState::DownloadProgress { completed, total });
                }
                Some(DownloadOutcome::AllComplete) => return Ok(Ok(())),
                Some(DownloadOutcome::Failed(reason)) => return Ok(Err(reason)),
                Some(DownloadOutcome::NotOurs) | None => {}
            }

            let finished = tokio::select! {
                _ = self.cancel.cancelled() => {
                    if let Err(e) = coordinator.cancel_all() {
                        warn!(target: "startup", error = %e, "failed to clear cancelled batch");
                    }
                    return Err(Halt::Cancelled);
                }
                id = transport.next_finished() => id,
            };
            let Some(id) = finished else {
                return Ok(Err(DownloadFailureReason::Unknown));
            };
            outcome = Some(coordinator.on_item_finished(id).map_err(download_failure)?);
        }
    }

    fn batch_failed(&self, reason: DownloadFailureReason) -> Halt {
        let e = ProvisionError::NetworkFailure(reason);
        warn!(target: "breadcrumb", func = "download", session = self.session.id, error = %e, "download batch failed");
        download_failure(e)
    }

    async fn confirm_large_download(&mut self, requirements: &[DownloadRequirement]) -> Step<Vec<DownloadRequirement>> {
        let total: u64 = requirements.iter().map(|r| r.size_bytes).sum();
        let threshold = self.deps.config.startup.large_download_threshold_bytes;
        if !self.deps.network.is_metered() || total <= threshold {
            return Ok(requirements.to_vec());
        }

        info!(target: "startup", total, threshold, "large download on metered network needs approval");
        let input = self
            .await_input(
                InputKind::LargeDownloadApproval,
                UserInputRequiredState::LargeDownloadRequired(requirements.to_vec()),
            )
            .await?;
        match input {
            PipelineInput::StartAssetDownloads(approved) => Ok(approved),
            _ => Ok(requirements.to_vec()),
        }
    }

    async fn install(&mut self, download_dir: PathBuf) -> Step<()> {
        let installer = self.deps.installer.clone();
        let result = tokio::task::spawn_blocking(move || installer.install_all(&download_dir)).await;
        match result {
            Ok(Ok(report)) => {
                debug!(target: "startup", ?report, "downloads installed");
                Ok(())
            }
            Ok(Err(e)) => Err(Halt::Failure(PipelineFailure::CopyingFailed(e.to_string()))),
            Err(e) => Err(Halt::Failure(PipelineFailure::CopyingFailed(e.to_string()))),
        }
    }

    // ------------------------------------------------------------------
    // Filesystem
    // ------------------------------------------------------------------

    fn rootfs_archive(&self, bundles: &[AssetBundle]) -> Step<PathBuf> {
        let distribution = &self.session.distribution;
        bundles
            .iter()
            .filter(|b| self.is_host_rootfs(b))
            .map(|b| self.deps.installer.repo_dir(distribution).join(&b.archive_filename))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                warn!(target: "startup", distribution = %distribution, "no rootfs archive available");
                Halt::Failure(PipelineFailure::FilesystemUnavailable)
            })
    }

    async fn verify_storage(&mut self, requirements: &[DownloadRequirement]) -> Step<()> {
        let startup = &self.deps.config.startup;
        let required = storage::required_bytes(
            requirements.iter().map(|r| (r.kind == AssetKind::Rootfs, r.size_bytes)),
            startup.rootfs_expansion_factor,
            startup.extraction_overhead_bytes,
        );
        let available = match self.deps.free_space.available_bytes(self.deps.installer.data_dir()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(target: "startup", error = %e, "free space unknown, skipping storage check");
                return Ok(());
            }
        };

        if available < required {
            let low = ProvisionError::StorageInsufficient { required, available };
            warn!(target: "startup", %low, "low storage");
            self.await_input(
                InputKind::LowStorageAcknowledgement,
                UserInputRequiredState::LowStorageAcknowledgementRequired,
            )
            .await?;
        }
        Ok(())
    }

    async fn prepare_filesystem(&mut self, filesystem_dir: PathBuf, rootfs_archive: Option<PathBuf>) -> Step<()> {
        let repo_dir = self.deps.installer.repo_dir(&self.session.distribution);
        let updates = self.updates.clone();

        let result = tokio::task::spawn_blocking(move || {
            installer::copy_distribution_assets(&repo_dir, &filesystem_dir.join("support"))?;
            if let Some(archive) = rootfs_archive {
                installer::extract_filesystem(&filesystem_dir, &archive, |entry| {
                    let _ = updates.send(PipelineUpdate::Progress(ProgressBarUpdateState::FilesystemExtractionStep(
                        entry.to_string(),
                    )));
                })?;
            }
            Ok::<_, ProvisionError>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Halt::Failure(PipelineFailure::ExtractionFailed(e.to_string()))),
            Err(e) => return Err(Halt::Failure(PipelineFailure::ExtractionFailed(e.to_string()))),
        }
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Server
    // ------------------------------------------------------------------

    async fn start_server(&mut self) -> Step<()> {
        let supervisor = Arc::clone(&self.deps.supervisor);
        let pid = match supervisor.start(&self.session).await {
            Ok(pid) => pid,
            Err(ProvisionError::SessionAlreadyActive { .. }) => return Err(Halt::SingleSession),
            Err(e) => return Err(Halt::Failure(PipelineFailure::StartFailure(e.to_string()))),
        };
        self.session.pid = Some(pid);

        let interval = self.deps.config.poll_interval();
        let timeout = self.deps.config.start_timeout();
        match supervisor
            .wait_until_running(&self.session, interval, timeout, &self.cancel)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                supervisor.stop(&self.session).await;
                self.session.pid = None;
                match e {
                    ProvisionError::Cancelled => Err(Halt::Cancelled),
                    _ => Err(Halt::Failure(PipelineFailure::StartTimedOut)),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    fn progress(&self, state: ProgressBarUpdateState) {
        self.emit(PipelineUpdate::Progress(state));
    }

    fn emit(&self, update: PipelineUpdate) {
        debug!(target: "startup", session = self.session.id, ?update, "update");
        if self.updates.send(update).is_err() {
            debug!(target: "startup", "update observer gone");
        }
    }
}

fn download_failure(e: ProvisionError) -> Halt {
    match e {
        ProvisionError::NetworkFailure(reason) => Halt::Failure(PipelineFailure::AssetDownloadFailure(reason)),
        ProvisionError::Cancelled => Halt::Cancelled,
        other => {
            warn!(target: "startup", error = %other, "download bookkeeping failed");
            Halt::Failure(PipelineFailure::AssetDownloadFailure(DownloadFailureReason::FileError))
        }
    }
}
