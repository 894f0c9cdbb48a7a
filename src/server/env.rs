//! Environment handed to a server's entry script.
//!
//! Built fresh for every launch from the session and [`ServerPreferences`];
//! a `BTreeMap` keeps the launch command deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::server::ServiceType;
use crate::session::Session;

pub const DEFAULT_HOSTNAME: &str = "localhost";
pub const DEFAULT_DNS_DOMAINS: &str = "search localdomain";
pub const DEFAULT_DNS_NAMESERVERS: &str = "nameserver 8.8.8.8\nnameserver 8.8.4.4";
pub const INTENTS_DIR: &str = "/Intents/";
pub const XSDL_DISPLAY: &str = ":4721";
pub const XSDL_PULSE_SERVER: &str = "127.0.0.1:4721";

pub type ServerEnv = BTreeMap<String, String>;

/// Host and user settings that shape the server environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerPreferences {
    /// Overrides every other hostname source when set.
    pub custom_hostname: Option<String>,
    /// Stable per-device id, used as hostname when no custom one is set.
    pub unique_id: Option<String>,
    /// Full resolv.conf contents; replaces the generated one when set.
    pub custom_dns: Option<String>,
    pub search_domains: Option<String>,
    /// Current nameservers of the host network, at most two are used.
    pub nameservers: Vec<String>,
    pub has_camera: bool,
    pub has_microphone: bool,
    pub vnc_display: String,
    pub version_code: String,
    pub version_name: String,
    /// Extra variables merged into the VNC environment.
    pub extra_env: BTreeMap<String, String>,
}

impl Default for ServerPreferences {
    fn default() -> Self {
        Self {
            custom_hostname: None,
            unique_id: None,
            custom_dns: None,
            search_domains: None,
            nameservers: Vec::new(),
            has_camera: false,
            has_microphone: false,
            vnc_display: "51".to_string(),
            version_code: "1".to_string(),
            version_name: env!("CARGO_PKG_VERSION").to_string(),
            extra_env: BTreeMap::new(),
        }
    }
}

impl ServerPreferences {
    pub fn hostname(&self) -> String {
        self.custom_hostname
            .clone()
            .or_else(|| self.unique_id.clone())
            .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string())
    }

    pub fn resolv_conf(&self) -> String {
        if let Some(custom) = &self.custom_dns {
            return custom.clone();
        }

        let mut resolv = match &self.search_domains {
            Some(domains) => format!("search {domains}"),
            None => DEFAULT_DNS_DOMAINS.to_string(),
        };
        if self.nameservers.is_empty() {
            resolv.push('\n');
            resolv.push_str(DEFAULT_DNS_NAMESERVERS);
        } else {
            for server in self.nameservers.iter().take(2) {
                resolv.push_str("\nnameserver ");
                resolv.push_str(server.trim_start_matches('/'));
            }
        }
        resolv
    }
}

/// Environment for launching `session`'s server.
pub fn build_environment(session: &Session, prefs: &ServerPreferences) -> ServerEnv {
    let mut env = ServerEnv::new();
    env.insert("INITIAL_USERNAME".into(), session.username.clone());

    match session.service_type {
        ServiceType::Ssh => {
            env.insert("INITIAL_PASSWORD".into(), session.ssh_password.clone());
        }
        ServiceType::Vnc => {
            env.insert("HAS_CAMERA".into(), flag(prefs.has_camera));
            env.insert("HAS_MICROPHONE".into(), flag(prefs.has_microphone));
            env.insert("INITIAL_VNC_PASSWORD".into(), session.vnc_password.clone());
            env.insert("DIMENSIONS".into(), session.geometry.clone());
            env.insert("VERSION_CODE".into(), prefs.version_code.clone());
            env.insert("VERSION_NAME".into(), prefs.version_name.clone());
            env.insert("VNC_DISPLAY".into(), prefs.vnc_display.clone());
            env.insert("INTENTS_DIR".into(), INTENTS_DIR.into());
            env.extend(prefs.extra_env.clone());

            let hostname = prefs.hostname();
            env.insert("HOSTS".into(), format!("127.0.0.1 localhost\n127.0.0.1 {hostname}"));
            env.insert("HOSTNAME".into(), hostname);
            env.insert("RESOLV".into(), prefs.resolv_conf());
        }
        ServiceType::Xsdl => {
            env.insert("DISPLAY".into(), XSDL_DISPLAY.into());
            env.insert("PULSE_SERVER".into(), XSDL_PULSE_SERVER.into());
        }
        ServiceType::Unselected => {}
    }
    env
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vnc_session() -> Session {
        let mut session = Session::new(1, "debian", 3, "debian");
        session.service_type = ServiceType::Vnc;
        session.username = "alice".into();
        session.vnc_password = "secret".into();
        session.geometry = "1480x720".into();
        session
    }

    #[test]
    fn hostname_precedence() {
        let mut prefs = ServerPreferences::default();
        assert_eq!(prefs.hostname(), DEFAULT_HOSTNAME);
        prefs.unique_id = Some("device-42".into());
        assert_eq!(prefs.hostname(), "device-42");
        prefs.custom_hostname = Some("box".into());
        assert_eq!(prefs.hostname(), "box");
    }

    #[test]
    fn resolv_from_host_network() {
        let prefs = ServerPreferences {
            search_domains: Some("lan".into()),
            nameservers: vec!["/10.0.0.1".into(), "10.0.0.2".into(), "10.0.0.3".into()],
            ..Default::default()
        };
        assert_eq!(prefs.resolv_conf(), "search lan\nnameserver 10.0.0.1\nnameserver 10.0.0.2");
    }

    #[test]
    fn resolv_defaults_and_custom() {
        let mut prefs = ServerPreferences::default();
        assert_eq!(
            prefs.resolv_conf(),
            format!("{DEFAULT_DNS_DOMAINS}\n{DEFAULT_DNS_NAMESERVERS}")
        );
        prefs.custom_dns = Some("nameserver 1.1.1.1".into());
        assert_eq!(prefs.resolv_conf(), "nameserver 1.1.1.1");
    }

    #[test]
    fn vnc_environment_is_complete() {
        let mut prefs = ServerPreferences::default();
        prefs.extra_env.insert("LANG".into(), "C.UTF-8".into());
        let env = build_environment(&vnc_session(), &prefs);

        assert_eq!(env["INITIAL_USERNAME"], "alice");
        assert_eq!(env["INITIAL_VNC_PASSWORD"], "secret");
        assert_eq!(env["DIMENSIONS"], "1480x720");
        assert_eq!(env["HAS_CAMERA"], "0");
        assert_eq!(env["INTENTS_DIR"], "/Intents/");
        assert_eq!(env["HOSTS"], "127.0.0.1 localhost\n127.0.0.1 localhost");
        assert_eq!(env["LANG"], "C.UTF-8");
    }

    #[test]
    fn xsdl_environment_points_at_display() {
        let mut session = vnc_session();
        session.service_type = ServiceType::Xsdl;
        let env = build_environment(&session, &ServerPreferences::default());
        assert_eq!(env["DISPLAY"], ":4721");
        assert_eq!(env["PULSE_SERVER"], "127.0.0.1:4721");
        assert!(!env.contains_key("RESOLV"));
    }
}
