//! Starts, tracks and terminates local servers.
//!
//! The active map is keyed by launcher pid. A filesystem id is reserved for
//! the duration of a launch so two concurrent starts on the same filesystem
//! cannot both succeed. A run under the single-session policy holds an
//! [`ExclusiveClaim`] from its first step until it ends, which keeps every
//! other policy-bound run out even while nothing is launched yet.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use statig::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::server::env::{build_environment, ServerPreferences};
use crate::server::host::SandboxHost;
use crate::server::{ActiveServer, RunningServerHandle, ServiceType};
use crate::session::Session;
use crate::state_machine::server_sm::{ServerEvent, ServerMachine};

#[derive(Default)]
struct Registry {
    active: HashMap<u32, RunningServerHandle>,
    starting: HashSet<u64>,
    /// Session holding the single-session claim.
    exclusive: Option<i64>,
}

/// Right to be the only session. Released on drop.
pub struct ExclusiveClaim {
    supervisor: Arc<LocalServerSupervisor>,
    session_id: i64,
}

impl Drop for ExclusiveClaim {
    fn drop(&mut self) {
        let mut registry = self.supervisor.lock();
        if registry.exclusive == Some(self.session_id) {
            registry.exclusive = None;
        }
        debug!(target: "supervisor", session = self.session_id, "exclusive claim released");
    }
}

pub struct LocalServerSupervisor {
    host: Arc<dyn SandboxHost>,
    data_dir: PathBuf,
    prefs: ServerPreferences,
    registry: Mutex<Registry>,
}

impl LocalServerSupervisor {
    pub fn new(host: Arc<dyn SandboxHost>, data_dir: impl Into<PathBuf>, prefs: ServerPreferences) -> Self {
        Self {
            host,
            data_dir: data_dir.into(),
            prefs,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn filesystem_dir(&self, filesystem_id: u64) -> PathBuf {
        self.data_dir.join(filesystem_id.to_string())
    }

    /// Absolute pid file path for `session`'s server.
    pub fn pid_file_path(&self, session: &Session) -> Option<PathBuf> {
        let relative = session
            .service_type
            .pid_file(&session.username, &self.prefs.vnc_display)?;
        Some(
            self.filesystem_dir(session.filesystem_id)
                .join(relative.trim_start_matches('/')),
        )
    }

    /// Launch `session`'s server and return the launcher pid.
    pub async fn start(&self, session: &Session) -> ProvisionResult<u32> {
        let Some(script) = session.service_type.entry_script() else {
            return Err(ProvisionError::IllegalTransition(format!(
                "session {} has no service type selected",
                session.id
            )));
        };

        {
            let mut registry = self.lock();
            let busy = registry.starting.contains(&session.filesystem_id)
                || registry
                    .active
                    .values()
                    .any(|h| h.filesystem_id == session.filesystem_id);
            if busy {
                return Err(ProvisionError::SessionAlreadyActive {
                    filesystem_id: session.filesystem_id,
                });
            }
            registry.starting.insert(session.filesystem_id);
        }

        let result = self.launch(session, script).await;
        self.lock().starting.remove(&session.filesystem_id);
        result
    }

    async fn launch(&self, session: &Session, script: &str) -> ProvisionResult<u32> {
        let mut machine = ServerMachine::new(session.id).state_machine();
        machine.handle(&ServerEvent::Launch);

        let pid_file = self.pid_file_path(session);
        if let Some(path) = &pid_file {
            remove_stale_pid_file(path);
        }

        let env = build_environment(session, &self.prefs);
        let filesystem_dir = self.filesystem_dir(session.filesystem_id);
        let pid = match self.host.launch(&filesystem_dir, script, &env).await {
            Ok(pid) => pid,
            Err(e) => {
                machine.handle(&ServerEvent::LaunchFailed);
                warn!(target: "breadcrumb", func = "start", session = session.id, error = %e, "server launch failed");
                return Err(e);
            }
        };
        machine.handle(&ServerEvent::Launched(pid));

        let handle = RunningServerHandle::new(session, pid, pid_file, machine);
        self.lock().active.insert(pid, handle);
        info!(
            target: "supervisor",
            session = session.id,
            fs = session.filesystem_id,
            service = %session.service_type,
            pid,
            "server started"
        );
        Ok(pid)
    }

    /// Whether `session`'s server answers the liveness check.
    pub async fn is_running(&self, session: &Session) -> bool {
        let Some(pid) = session.pid else {
            return false;
        };
        let pid_file = {
            let registry = self.lock();
            match registry.active.get(&pid) {
                Some(handle) => handle.pid_file_path.clone(),
                None => return false,
            }
        };

        if session.service_type.is_externally_managed() {
            self.mark_ready(pid);
            return true;
        }

        let Some(server_pid) = pid_file.as_deref().and_then(read_pid_file) else {
            debug!(target: "supervisor", session = session.id, "pid file not written yet");
            return false;
        };

        match self.host.is_alive(server_pid).await {
            Ok(true) => {
                self.mark_ready(pid);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(target: "breadcrumb", func = "is_running", session = session.id, error = %e, "liveness check failed");
                false
            }
        }
    }

    /// Poll [`Self::is_running`] until it succeeds, the timeout elapses or
    /// `cancel` fires.
    pub async fn wait_until_running(
        &self,
        session: &Session,
        interval: Duration,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_running(session).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(target: "supervisor", session = session.id, ?timeout, "server did not become ready");
                return Err(ProvisionError::StartTimedOut(timeout));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Stop `session`'s server. Kill failures are logged, not returned.
    pub async fn stop(&self, session: &Session) {
        let pid = session.pid.or_else(|| {
            let registry = self.lock();
            registry
                .active
                .values()
                .find(|h| h.session_id == session.id)
                .map(|h| h.os_pid)
        });
        match pid {
            Some(pid) => self.stop_pid(pid).await,
            None => debug!(target: "supervisor", session = session.id, "stop requested for unknown session"),
        }
    }

    async fn stop_pid(&self, pid: u32) {
        let removed = self.lock().active.remove(&pid);
        let Some(mut handle) = removed else {
            return;
        };
        handle.dispatch(ServerEvent::StopRequested);

        let server_pid = handle.pid_file_path.as_deref().and_then(read_pid_file);
        if let Err(e) = self.host.kill_tree(pid, server_pid).await {
            warn!(target: "breadcrumb", func = "stop", session = handle.session_id, error = %e, "failed to kill server tree");
        }
        handle.dispatch(ServerEvent::Exited);
        info!(target: "supervisor", session = handle.session_id, pid, "server stopped");
    }

    pub async fn stop_all(&self) {
        for pid in self.pids_where(|_| true) {
            self.stop_pid(pid).await;
        }
    }

    /// Stop every session of a filesystem that is about to be deleted.
    pub async fn clean_up_filesystem(&self, filesystem_id: u64) {
        for pid in self.pids_where(|h| h.filesystem_id == filesystem_id) {
            self.stop_pid(pid).await;
        }
    }

    /// Stop every session started for the app `name`.
    pub async fn stop_app(&self, name: &str) {
        for pid in self.pids_where(|h| h.session_name == name) {
            self.stop_pid(pid).await;
        }
    }

    pub fn active_sessions(&self) -> Vec<ActiveServer> {
        let mut sessions: Vec<ActiveServer> = self.lock().active.values().map(|h| h.summary()).collect();
        sessions.sort_by_key(|s| s.os_pid);
        sessions
    }

    /// Claim the single-session slot for `session_id`.
    ///
    /// Fails while any server runs or launches, or another run holds the
    /// claim.
    pub fn claim_exclusive(self: &Arc<Self>, session_id: i64) -> Option<ExclusiveClaim> {
        {
            let mut registry = self.lock();
            if !registry.active.is_empty() || !registry.starting.is_empty() || registry.exclusive.is_some() {
                debug!(target: "supervisor", session = session_id, "single-session claim refused");
                return None;
            }
            registry.exclusive = Some(session_id);
        }
        Some(ExclusiveClaim {
            supervisor: Arc::clone(self),
            session_id,
        })
    }

    pub fn has_active_session(&self) -> bool {
        let registry = self.lock();
        !registry.active.is_empty() || !registry.starting.is_empty()
    }

    pub fn service_type_of(&self, pid: u32) -> Option<ServiceType> {
        self.lock().active.get(&pid).map(|h| h.service_type)
    }

    fn pids_where(&self, predicate: impl Fn(&RunningServerHandle) -> bool) -> Vec<u32> {
        self.lock()
            .active
            .values()
            .filter(|h| predicate(h))
            .map(|h| h.os_pid)
            .collect()
    }

    fn mark_ready(&self, pid: u32) {
        if let Some(handle) = self.lock().active.get_mut(&pid) {
            handle.dispatch(ServerEvent::BecameReady);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn remove_stale_pid_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(target: "supervisor", path = %path.display(), "removed stale pid file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(target: "supervisor", path = %path.display(), error = %e, "cannot remove stale pid file"),
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
