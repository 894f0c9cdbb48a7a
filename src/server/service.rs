//! Service types and their fixed in-filesystem locations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which server a session runs inside its filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Ssh,
    Vnc,
    Xsdl,
    #[default]
    Unselected,
}

impl ServiceType {
    /// Entry script run inside the sandbox. `None` for `Unselected`.
    pub fn entry_script(self) -> Option<&'static str> {
        match self {
            ServiceType::Ssh => Some("/support/startSSHServer.sh"),
            ServiceType::Vnc => Some("/support/startVNCServer.sh"),
            ServiceType::Xsdl => Some("/support/startXSDLServer.sh"),
            ServiceType::Unselected => None,
        }
    }

    /// Pid file of the server, relative to the filesystem root.
    pub fn pid_file(self, username: &str, vnc_display: &str) -> Option<String> {
        match self {
            ServiceType::Ssh => Some("/run/dropbear.pid".to_string()),
            ServiceType::Vnc => Some(format!("/home/{username}/.vnc/localhost:{vnc_display}.pid")),
            ServiceType::Xsdl => Some("/tmp/xsdl.pidfile".to_string()),
            ServiceType::Unselected => None,
        }
    }

    /// XSDL runs in a third-party app that owns its own error handling.
    pub fn is_externally_managed(self) -> bool {
        matches!(self, ServiceType::Xsdl)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceType::Ssh => "ssh",
            ServiceType::Vnc => "vnc",
            ServiceType::Xsdl => "xsdl",
            ServiceType::Unselected => "unselected",
        })
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" => Ok(ServiceType::Ssh),
            "vnc" => Ok(ServiceType::Vnc),
            "xsdl" => Ok(ServiceType::Xsdl),
            "unselected" => Ok(ServiceType::Unselected),
            other => Err(format!("unknown service type: {other}")),
        }
    }
}
