//! Local server supervision: launching, tracking and stopping the servers
//! that expose a filesystem as an interactive session.

use std::path::PathBuf;

use statig::prelude::*;

use crate::state_machine::server_sm::{ServerEvent, ServerLifecycle, ServerMachine};

pub mod env;
pub mod geometry;
pub mod host;
pub mod service;
pub mod supervisor;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// A launched server, owned by the supervisor's active map.
pub struct RunningServerHandle {
    pub session_id: i64,
    pub session_name: String,
    pub filesystem_id: u64,
    pub service_type: ServiceType,
    /// OS pid of the sandbox launcher.
    pub os_pid: u32,
    /// Absolute path of the server's pid file inside the filesystem.
    pub pid_file_path: Option<PathBuf>,
    machine: StateMachine<ServerMachine>,
}

impl RunningServerHandle {
    pub(crate) fn new(
        session: &crate::session::Session,
        os_pid: u32,
        pid_file_path: Option<PathBuf>,
        machine: StateMachine<ServerMachine>,
    ) -> Self {
        Self {
            session_id: session.id,
            session_name: session.name.clone(),
            filesystem_id: session.filesystem_id,
            service_type: session.service_type,
            os_pid,
            pid_file_path,
            machine,
        }
    }

    pub fn lifecycle(&self) -> ServerLifecycle {
        ServerMachine::lifecycle(self.machine.state())
    }

    pub(crate) fn dispatch(&mut self, event: ServerEvent) {
        self.machine.handle(&event);
    }

    pub fn summary(&self) -> ActiveServer {
        ActiveServer {
            session_id: self.session_id,
            session_name: self.session_name.clone(),
            filesystem_id: self.filesystem_id,
            service_type: self.service_type,
            os_pid: self.os_pid,
            lifecycle: self.lifecycle(),
        }
    }
}

/// Snapshot of one entry in the active map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveServer {
    pub session_id: i64,
    pub session_name: String,
    pub filesystem_id: u64,
    pub service_type: ServiceType,
    pub os_pid: u32,
    pub lifecycle: ServerLifecycle,
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use env::ServerPreferences;
pub use host::{ProotHost, SandboxHost};
pub use service::ServiceType;
pub use supervisor::{ExclusiveClaim, LocalServerSupervisor};
