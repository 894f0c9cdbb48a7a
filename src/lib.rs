//! rootfs-sessions: provision a Linux root filesystem and supervise the
//! SSH, VNC and X-display servers that expose it as interactive sessions.
//!
//! ```text
//! session::startup ──► provision::{manifest, download, installer}
//!        │
//!        └──────────► server::supervisor ──► server::host (proot)
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod prefs;
pub mod provision;
pub mod server;
pub mod session;
pub mod state_machine;

pub use config::Config;
pub use error::{ProvisionError, ProvisionResult};
pub use paths::AppPaths;
