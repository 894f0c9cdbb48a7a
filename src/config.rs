//! User configuration, read from `config.toml` in the config directory.
//!
//! Every field has a default, so a partial file (or none at all) works.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::provision::download::ChecksumPolicy;
use crate::provision::integrity::{self, DigestAlgorithm};
use crate::server::env::ServerPreferences;
use crate::server::geometry::DeviceDimensions;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    pub assets: AssetConfig,
    pub integrity: IntegrityConfig,
    pub startup: StartupConfig,
    pub server: ServerPreferences,
    pub display: DeviceDimensions,
}

// --- Sub-structs ---

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct AssetConfig {
    /// Root URL serving `apps.txt` and `<repo>/assets.txt`.
    pub base_url: String,
    /// Repository holding the support tools shared by all distributions.
    pub support_repository: String,
    /// Overrides the architecture derived from the host.
    pub architecture: Option<String>,
    /// Cached asset lists younger than this are not refetched.
    pub asset_list_max_age_secs: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub enabled: bool,
    pub algorithm: DigestAlgorithm,
    /// Substring identifying the checksum manifest among downloads.
    pub manifest_marker: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Refuse to start a session while another one is active.
    pub single_session: bool,
    pub poll_interval_ms: u64,
    pub start_timeout_secs: u64,
    /// Rootfs archives need roughly this multiple of their size once
    /// extracted alongside the archive.
    pub rootfs_expansion_factor: f64,
    pub extraction_overhead_bytes: u64,
    /// Downloads above this size need confirmation on metered networks.
    pub large_download_threshold_bytes: u64,
}

// ---------------------------------------------------------------------------
// Default implementations
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            assets: AssetConfig::default(),
            integrity: IntegrityConfig::default(),
            startup: StartupConfig::default(),
            server: ServerPreferences::default(),
            display: DeviceDimensions::default(),
        }
    }
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            base_url: "https://assets.example.org/rootfs".to_string(),
            support_repository: "support".to_string(),
            architecture: None,
            asset_list_max_age_secs: 60 * 60 * 24,
        }
    }
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: DigestAlgorithm::Md5,
            manifest_marker: "MD5SUMS".to_string(),
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            single_session: true,
            poll_interval_ms: 500,
            start_timeout_secs: 120,
            rootfs_expansion_factor: 3.0,
            extraction_overhead_bytes: 50 * 1024 * 1024,
            large_download_threshold_bytes: 100 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Helper methods
// ---------------------------------------------------------------------------

impl Config {
    /// Load `path`, writing the defaults there first when it is missing.
    ///
    /// A file that fails to parse is reported and replaced by defaults in
    /// memory; the file itself is left for the user to fix.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, config.to_toml())?;
            info!(target: "config", path = %path.display(), "wrote default config");
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path)?;
        match Self::from_toml(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(target: "config", path = %path.display(), error = %e, "config unreadable, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Deserialize from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn architecture(&self) -> String {
        self.assets
            .architecture
            .clone()
            .unwrap_or_else(|| integrity::host_arch().to_string())
    }

    pub fn checksum_policy(&self) -> ChecksumPolicy {
        ChecksumPolicy {
            enabled: self.integrity.enabled,
            algorithm: self.integrity.algorithm,
            manifest_marker: self.integrity.manifest_marker.clone(),
            arch: self.architecture(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup.poll_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.startup.start_timeout_secs)
    }

    pub fn asset_list_max_age(&self) -> Duration {
        Duration::from_secs(self.assets.asset_list_max_age_secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert!(c.startup.single_session);
        assert_eq!(c.poll_interval(), Duration::from_millis(500));
        assert!(c.integrity.enabled);
        assert_eq!(c.integrity.algorithm, DigestAlgorithm::Md5);
        assert_eq!(c.assets.support_repository, "support");
    }

    #[test]
    fn toml_roundtrip() {
        let mut original = Config::default();
        original.server.extra_env.insert("LANG".into(), "C.UTF-8".into());
        original.server.custom_hostname = Some("box".into());
        let parsed = Config::from_toml(&original.to_toml()).expect("roundtrip parse failed");
        assert_eq!(parsed, original);
    }

    #[test]
    fn partial_toml() {
        let partial = r#"
[startup]
single_session = false

[integrity]
algorithm = "sha256"
"#;
        let c = Config::from_toml(partial).expect("partial parse failed");
        assert!(!c.startup.single_session);
        assert_eq!(c.startup.poll_interval_ms, 500);
        assert_eq!(c.integrity.algorithm, DigestAlgorithm::Sha256);
        assert!(c.integrity.enabled);
    }

    #[test]
    fn load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let c = Config::load(&path).unwrap();
        assert!(path.is_file());
        assert_eq!(c, Config::default());
    }

    #[test]
    fn architecture_override() {
        let mut c = Config::default();
        c.assets.architecture = Some("x86".into());
        assert_eq!(c.checksum_policy().arch, "x86");
    }
}
