//! Session startup input-gating state machine.
//!
//! The pipeline body drives itself; this machine only tracks whether it is
//! working or suspended on a specific user input, and rejects everything
//! else.
//!
//! ```text
//! Running (superstate)
//!   ├── Working ─AwaitInput(k)─► Suspended { awaiting: k }
//!   └── Suspended ─InputReceived(k)─► Working
//!
//! Running ─Cancel─► Cancelled
//! Running ─Finish─► Finished
//! any unexpected input ─► Illegal { expected, received }
//! ```

use std::fmt;

use statig::prelude::*;
use tracing::{debug, warn};

use crate::session::PipelineInput;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Kinds of input the pipeline can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    FilesystemCredentials,
    AppServiceType,
    LargeDownloadApproval,
    LowStorageAcknowledgement,
}

impl InputKind {
    pub fn of(input: &PipelineInput) -> Self {
        match input {
            PipelineInput::FilesystemCredentials { .. } => InputKind::FilesystemCredentials,
            PipelineInput::AppServiceType(_) => InputKind::AppServiceType,
            PipelineInput::StartAssetDownloads(_) => InputKind::LargeDownloadApproval,
            PipelineInput::LowStorageAcknowledged => InputKind::LowStorageAcknowledgement,
        }
    }
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InputKind::FilesystemCredentials => "filesystem credentials",
            InputKind::AppServiceType => "app service type",
            InputKind::LargeDownloadApproval => "download approval",
            InputKind::LowStorageAcknowledgement => "low storage acknowledgement",
        })
    }
}

#[derive(Debug, Clone)]
pub enum StartupEvent {
    AwaitInput(InputKind),
    InputReceived(InputKind),
    Cancel,
    Finish,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct StartupMachine {
    pub session_id: i64,
}

impl StartupMachine {
    pub fn new(session_id: i64) -> Self {
        Self { session_id }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::working()",
    state(derive(Debug, Clone, PartialEq))
)]
impl StartupMachine {
    #[superstate]
    fn running(&mut self, event: &StartupEvent) -> Outcome<State> {
        match event {
            StartupEvent::Cancel => Transition(State::cancelled()),
            StartupEvent::Finish => Transition(State::finished()),
            _ => Handled,
        }
    }

    /// Provisioning work in progress; no input is expected.
    #[state(superstate = "running")]
    fn working(&mut self, event: &StartupEvent) -> Outcome<State> {
        match event {
            StartupEvent::AwaitInput(kind) => {
                debug!(target: "startup_sm", session = self.session_id, awaiting = %kind, "suspended");
                Transition(State::suspended(*kind))
            }
            StartupEvent::InputReceived(kind) => {
                warn!(target: "startup_sm", session = self.session_id, received = %kind, "input while working");
                Transition(State::illegal(None, *kind))
            }
            _ => Super,
        }
    }

    #[state(superstate = "running")]
    fn suspended(&mut self, event: &StartupEvent, awaiting: &InputKind) -> Outcome<State> {
        match event {
            StartupEvent::InputReceived(kind) if kind == awaiting => Transition(State::working()),
            StartupEvent::InputReceived(kind) => {
                warn!(target: "startup_sm", session = self.session_id, expected = %awaiting, received = %kind, "unexpected input");
                Transition(State::illegal(Some(*awaiting), *kind))
            }
            StartupEvent::AwaitInput(kind) => Transition(State::illegal(Some(*awaiting), *kind)),
            _ => Super,
        }
    }

    /// Terminal.
    #[state]
    fn illegal(&mut self, event: &StartupEvent, expected: &Option<InputKind>, received: &InputKind) -> Outcome<State> {
        let _ = (event, expected, received);
        Handled
    }

    /// Terminal.
    #[state]
    fn cancelled(&mut self, event: &StartupEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    /// Terminal.
    #[state]
    fn finished(&mut self, event: &StartupEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_input_resumes_work() {
        let mut sm = StartupMachine::new(1).state_machine();
        sm.handle(&StartupEvent::AwaitInput(InputKind::FilesystemCredentials));
        assert_eq!(
            sm.state(),
            &State::Suspended { awaiting: InputKind::FilesystemCredentials }
        );
        sm.handle(&StartupEvent::InputReceived(InputKind::FilesystemCredentials));
        assert_eq!(sm.state(), &State::Working {});
    }

    #[test]
    fn wrong_input_is_illegal() {
        let mut sm = StartupMachine::new(1).state_machine();
        sm.handle(&StartupEvent::AwaitInput(InputKind::AppServiceType));
        sm.handle(&StartupEvent::InputReceived(InputKind::LowStorageAcknowledgement));
        assert_eq!(
            sm.state(),
            &State::Illegal {
                expected: Some(InputKind::AppServiceType),
                received: InputKind::LowStorageAcknowledgement,
            }
        );

        sm.handle(&StartupEvent::Finish);
        assert!(matches!(sm.state(), State::Illegal { .. }));
    }

    #[test]
    fn unsolicited_input_is_illegal() {
        let mut sm = StartupMachine::new(1).state_machine();
        sm.handle(&StartupEvent::InputReceived(InputKind::LowStorageAcknowledgement));
        assert!(matches!(sm.state(), State::Illegal { expected: None, .. }));
    }

    #[test]
    fn cancel_from_suspension() {
        let mut sm = StartupMachine::new(1).state_machine();
        sm.handle(&StartupEvent::AwaitInput(InputKind::LowStorageAcknowledgement));
        sm.handle(&StartupEvent::Cancel);
        assert_eq!(sm.state(), &State::Cancelled {});
    }
}
