//! Sessions and the startup pipeline that provisions and launches them.
//!
//! A [`startup::SessionStartup`] run streams [`PipelineUpdate`]s to its
//! observer and suspends whenever it needs a [`PipelineInput`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::provision::download::DownloadFailureReason;
use crate::provision::DownloadRequirement;

pub mod startup;

pub use crate::server::ServiceType;
pub use startup::{SessionStartup, SessionStartupHandle, StartupDeps, StartupOutcome};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A user's interactive session on one filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    /// App or distribution the session was created for.
    pub name: String,
    pub filesystem_id: u64,
    pub distribution: String,
    pub service_type: ServiceType,
    pub username: String,
    pub ssh_password: String,
    pub vnc_password: String,
    /// `WxH` passed to VNC servers.
    pub geometry: String,
    /// Launcher pid while the server runs.
    pub pid: Option<u32>,
    pub active: bool,
}

impl Session {
    pub fn new(id: i64, name: &str, filesystem_id: u64, distribution: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            filesystem_id,
            distribution: distribution.to_string(),
            service_type: ServiceType::Unselected,
            username: String::new(),
            ssh_password: String::new(),
            vnc_password: String::new(),
            geometry: String::new(),
            pid: None,
            active: false,
        }
    }

    pub fn has_credentials(&self) -> bool {
        let vnc_ok = self.service_type != ServiceType::Vnc || !self.vnc_password.is_empty();
        !self.username.is_empty() && !self.ssh_password.is_empty() && vnc_ok
    }
}

// ---------------------------------------------------------------------------
// Pipeline updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressBarUpdateState {
    StartingSetup,
    FetchingAssetLists,
    CheckingForAssetUpdates,
    DownloadProgress { completed: usize, total: usize },
    CopyingDownloads,
    VerifyingFilesystem,
    VerifyingAvailableStorage,
    FilesystemExtractionStep(String),
    StartingSession,
    OperationComplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInputRequiredState {
    FilesystemCredentialsRequired,
    AppServiceTypePreferenceRequired,
    LowStorageAcknowledgementRequired,
    /// Confirmation before a large download on a metered connection.
    LargeDownloadRequired(Vec<DownloadRequirement>),
}

/// The pipeline reached a state it cannot continue from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IllegalState {
    UnexpectedUserInput { expected: Option<String>, received: String },
    TransitionRejected(String),
}

impl IllegalState {
    /// Diagnostic name of the illegal state.
    pub fn name(&self) -> &'static str {
        match self {
            IllegalState::UnexpectedUserInput { .. } => "UnexpectedUserInput",
            IllegalState::TransitionRejected(_) => "TransitionRejected",
        }
    }
}

impl fmt::Display for IllegalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IllegalState::UnexpectedUserInput { expected: Some(expected), received } => {
                write!(f, "received {received} while waiting for {expected}")
            }
            IllegalState::UnexpectedUserInput { expected: None, received } => {
                write!(f, "received {received} while no input was requested")
            }
            IllegalState::TransitionRejected(reason) => write!(f, "transition rejected: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineFailure {
    AssetListsUnavailable,
    AssetDownloadFailure(DownloadFailureReason),
    CopyingFailed(String),
    FilesystemUnavailable,
    ExtractionFailed(String),
    StartFailure(String),
    StartTimedOut,
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineFailure::AssetListsUnavailable => f.write_str("asset lists could not be fetched and none are cached"),
            PipelineFailure::AssetDownloadFailure(reason) => write!(f, "asset download failed: {reason}"),
            PipelineFailure::CopyingFailed(msg) => write!(f, "installing downloads failed: {msg}"),
            PipelineFailure::FilesystemUnavailable => f.write_str("no filesystem archive is available"),
            PipelineFailure::ExtractionFailed(msg) => write!(f, "filesystem extraction failed: {msg}"),
            PipelineFailure::StartFailure(msg) => write!(f, "server failed to start: {msg}"),
            PipelineFailure::StartTimedOut => f.write_str("server did not become ready in time"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineUpdate {
    Progress(ProgressBarUpdateState),
    UserInputRequired(UserInputRequiredState),
    Illegal(IllegalState),
    CanOnlyStartSingleSession,
    Failure(PipelineFailure),
    Cancelled,
}

impl PipelineUpdate {
    /// No further updates follow a terminal one.
    pub fn is_terminal(&self) -> bool {
        match self {
            PipelineUpdate::Progress(state) => *state == ProgressBarUpdateState::OperationComplete,
            PipelineUpdate::UserInputRequired(_) => false,
            PipelineUpdate::Illegal(_)
            | PipelineUpdate::CanOnlyStartSingleSession
            | PipelineUpdate::Failure(_)
            | PipelineUpdate::Cancelled => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineInput {
    FilesystemCredentials {
        username: String,
        ssh_password: String,
        vnc_password: String,
    },
    AppServiceType(ServiceType),
    StartAssetDownloads(Vec<DownloadRequirement>),
    LowStorageAcknowledged,
}
