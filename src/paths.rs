//! Application directory structure for rootfs-sessions.
//!
//! Provides a single `AppPaths` struct that resolves all standard directories
//! and ensures they exist on first launch:
//!
//! - Config:    `~/.config/rootfs-sessions/`  (human-editable, XDG-style)
//! - Data:      `~/.local/share/rootfs-sessions/`, or
//!              `~/Library/Application Support/org.rootfs-sessions/` on macOS
//! - Cache:     `~/.cache/rootfs-sessions/`
//! - Logs:      `<data>/logs/`, or `~/Library/Logs/rootfs-sessions/` on macOS
//!
//! Inside the data directory, installed repositories live in `<repo>/` and
//! extracted filesystems in `<filesystem id>/`.

use std::path::{Path, PathBuf};
use tracing::info;

#[cfg(target_os = "macos")]
const BUNDLE_ID: &str = "org.rootfs-sessions";
const APP_NAME: &str = "rootfs-sessions";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Human-editable config: `~/.config/rootfs-sessions/`
    pub config: PathBuf,
    /// Installed repositories, filesystems and persisted state
    pub data: PathBuf,
    /// Where the download transport writes the active batch
    pub downloads: PathBuf,
    /// Scratch space for extracting support bundles
    pub staging: PathBuf,
    /// Regenerable cache data
    pub cache: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::from_roots(
            resolve_config_dir(&home),
            resolve_data_dir(&home),
            resolve_cache_dir(&home),
            resolve_log_dir(&home),
        ))
    }

    /// Lay out every directory under explicit roots.
    pub fn from_roots(config: PathBuf, data: PathBuf, cache: PathBuf, logs: PathBuf) -> Self {
        Self {
            config,
            downloads: cache.join("downloads"),
            staging: cache.join("staging"),
            data,
            cache,
            logs,
        }
    }

    /// Everything under one directory; used by tests and `--root`.
    pub fn under(root: &Path) -> Self {
        Self::from_roots(
            root.join("config"),
            root.join("data"),
            root.join("cache"),
            root.join("logs"),
        )
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        let dirs = [&self.config, &self.data, &self.downloads, &self.cache, &self.logs];

        for dir in &dirs {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }

        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    pub fn state_file(&self) -> PathBuf {
        self.data.join("state.json")
    }

    pub fn repo_dir(&self, repository: &str) -> PathBuf {
        self.data.join(repository)
    }

    pub fn filesystem_dir(&self, filesystem_id: u64) -> PathBuf {
        self.data.join(filesystem_id.to_string())
    }

    /// Installed support tools, including the sandbox helper scripts.
    pub fn support_dir(&self, support_repository: &str) -> PathBuf {
        self.repo_dir(support_repository)
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_cache_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Caches").join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_cache_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".cache").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    resolve_data_dir(home).join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_produces_valid_paths() {
        let paths = AppPaths::resolve().expect("HOME should be set in tests");
        assert!(paths.config.to_string_lossy().contains("rootfs-sessions"));
        assert!(paths.data.to_string_lossy().contains("rootfs-sessions"));
        assert!(paths.downloads.ends_with("downloads"));
        assert!(paths.staging.ends_with("staging"));
        assert!(paths.state_file().ends_with("state.json"));
    }

    #[test]
    fn ensure_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = AppPaths::under(tmp.path());

        paths.ensure().expect("ensure should succeed");

        assert!(paths.config.is_dir());
        assert!(paths.data.is_dir());
        assert!(paths.downloads.is_dir());
        assert!(paths.cache.is_dir());
        assert!(paths.logs.is_dir());
        assert!(!paths.staging.exists());
    }

    #[test]
    fn filesystem_and_repo_dirs_live_in_data() {
        let paths = AppPaths::under(Path::new("/srv"));
        assert_eq!(paths.filesystem_dir(3), PathBuf::from("/srv/data/3"));
        assert_eq!(paths.repo_dir("debian"), PathBuf::from("/srv/data/debian"));
    }
}
