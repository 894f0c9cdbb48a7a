//! Per-server lifecycle state machine.
//!
//! ```text
//! NotStarted ─Launch─► Starting ─Launched(pid)─► Launched { pid }
//!                         │                          │ BecameReady
//!                   LaunchFailed                     ▼
//!                         │                     Ready { pid }
//!                         ▼                          │
//!                      Stopped ◄─Exited── Stopping ◄─┘ StopRequested
//! ```
//!
//! `Launched` and `Ready` share the `alive` superstate, which owns the stop
//! transition.

use statig::prelude::*;
use tracing::debug;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Launch,
    Launched(u32),
    LaunchFailed,
    BecameReady,
    StopRequested,
    Exited,
}

/// Coarse lifecycle reported outside the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLifecycle {
    NotStarted,
    Starting,
    Running { pid: u32, ready: bool },
    Stopping,
    Stopped,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ServerMachine {
    pub session_id: i64,
}

impl ServerMachine {
    pub fn new(session_id: i64) -> Self {
        Self { session_id }
    }

    pub fn lifecycle(state: &State) -> ServerLifecycle {
        match state {
            State::NotStarted {} => ServerLifecycle::NotStarted,
            State::Starting {} => ServerLifecycle::Starting,
            State::Launched { pid } => ServerLifecycle::Running { pid: *pid, ready: false },
            State::Ready { pid } => ServerLifecycle::Running { pid: *pid, ready: true },
            State::Stopping {} => ServerLifecycle::Stopping,
            State::Stopped {} => ServerLifecycle::Stopped,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::not_started()",
    state(derive(Debug, Clone, PartialEq))
)]
impl ServerMachine {
    #[state]
    fn not_started(&mut self, event: &ServerEvent) -> Outcome<State> {
        match event {
            ServerEvent::Launch => Transition(State::starting()),
            _ => Handled,
        }
    }

    #[state]
    fn starting(&mut self, event: &ServerEvent) -> Outcome<State> {
        match event {
            ServerEvent::Launched(pid) => {
                debug!(target: "server_sm", session = self.session_id, pid, "launched");
                Transition(State::launched(*pid))
            }
            ServerEvent::LaunchFailed => Transition(State::stopped()),
            _ => Handled,
        }
    }

    #[superstate]
    fn alive(&mut self, event: &ServerEvent) -> Outcome<State> {
        match event {
            ServerEvent::StopRequested => Transition(State::stopping()),
            ServerEvent::Exited => Transition(State::stopped()),
            _ => Handled,
        }
    }

    #[state(superstate = "alive")]
    fn launched(&mut self, event: &ServerEvent, pid: &u32) -> Outcome<State> {
        match event {
            ServerEvent::BecameReady => {
                debug!(target: "server_sm", session = self.session_id, pid, "ready");
                Transition(State::ready(*pid))
            }
            _ => Super,
        }
    }

    #[state(superstate = "alive")]
    fn ready(&mut self, event: &ServerEvent, pid: &u32) -> Outcome<State> {
        let _ = (event, pid);
        Super
    }

    #[state]
    fn stopping(&mut self, event: &ServerEvent) -> Outcome<State> {
        match event {
            ServerEvent::Exited => Transition(State::stopped()),
            _ => Handled,
        }
    }

    /// Terminal.
    #[state]
    fn stopped(&mut self, event: &ServerEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }
}
