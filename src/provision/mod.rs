//! Asset provisioning: manifests, downloads, integrity checks and archive
//! installation.
//!
//! ```text
//! AssetSource ──► AssetBundle[] ──► DownloadRequirement[]
//!                                        │
//!                         DownloadCoordinator (transport + persisted ids)
//!                                        │ AllComplete
//!                                 ArchiveInstaller ──► <data>/<repo>/...
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod download;
pub mod installer;
pub mod integrity;
pub mod manifest;
pub mod storage;
pub mod transport;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Substring identifying the guest root filesystem archive.
pub const ROOTFS_ARCHIVE_MARKER: &str = "rootfs.tar.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetKind {
    /// The guest root filesystem image of a distribution.
    Rootfs,
    /// Support binaries or scripts extracted into `<data>/<repo>/`.
    Support,
}

/// One downloadable, versioned archive published by a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBundle {
    pub repository: String,
    pub archive_filename: String,
    pub kind: AssetKind,
    pub remote_version: u64,
    pub local_version: u64,
    /// Published archive size, used for storage estimates.
    pub size_bytes: u64,
}

impl AssetBundle {
    pub fn new(repository: &str, archive_filename: &str, remote_version: u64, size_bytes: u64) -> Self {
        let kind = if archive_filename.contains(ROOTFS_ARCHIVE_MARKER) {
            AssetKind::Rootfs
        } else {
            AssetKind::Support
        };
        Self {
            repository: repository.to_string(),
            archive_filename: archive_filename.to_string(),
            kind,
            remote_version,
            local_version: 0,
            size_bytes,
        }
    }

    /// Key under which this bundle's versions are persisted.
    ///
    /// A distribution repository publishes both a rootfs and support
    /// archives, so the rootfs gets its own key.
    pub fn version_key(&self) -> String {
        version_key(&self.repository, self.kind)
    }

    /// Whether this is the rootfs image built for `arch`, named
    /// `<arch>-rootfs.tar.gz`.
    pub fn is_rootfs_for(&self, arch: &str) -> bool {
        self.kind == AssetKind::Rootfs
            && self
                .archive_filename
                .strip_prefix(arch)
                .is_some_and(|rest| rest.starts_with('-'))
    }

    pub fn is_outdated(&self) -> bool {
        self.remote_version > self.local_version
    }

    /// Title of the downloaded file, `<repo>-<archive>-<version>`.
    pub fn download_title(&self) -> String {
        format!(
            "{}-{}-{}",
            self.repository, self.archive_filename, self.remote_version
        )
    }
}

pub fn version_key(repository: &str, kind: AssetKind) -> String {
    match kind {
        AssetKind::Rootfs => format!("{repository}/rootfs"),
        AssetKind::Support => repository.to_string(),
    }
}

/// A single file that must be downloaded in the current provisioning pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequirement {
    pub url: String,
    /// Filename inside the download directory.
    pub destination_title: String,
    pub human_title: String,
    pub kind: AssetKind,
    pub size_bytes: u64,
}

impl DownloadRequirement {
    pub fn for_bundle(base_url: &str, bundle: &AssetBundle) -> Self {
        Self {
            url: format!(
                "{}/{}/{}",
                base_url.trim_end_matches('/'),
                bundle.repository,
                bundle.archive_filename
            ),
            destination_title: bundle.download_title(),
            human_title: format!("{} {}", bundle.repository, bundle.archive_filename),
            kind: bundle.kind,
            size_bytes: bundle.size_bytes,
        }
    }
}

impl fmt::Display for DownloadRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.human_title, self.size_bytes)
    }
}

/// Parsed `<repo>-<archive>-<version>` download filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub repository: String,
    pub archive: String,
    pub version: u64,
}

impl ArchiveName {
    /// The repository never contains `-` and the version is the text after
    /// the last `-`; everything in between is the archive name.
    pub fn parse(filename: &str) -> Option<Self> {
        let (repository, rest) = filename.split_once('-')?;
        let (archive, version) = rest.rsplit_once('-')?;
        if repository.is_empty() || archive.is_empty() {
            return None;
        }
        Some(Self {
            repository: repository.to_string(),
            archive: archive.to_string(),
            version: version.parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_kind_from_filename() {
        assert_eq!(AssetBundle::new("debian", "arm64-rootfs.tar.gz", 2, 0).kind, AssetKind::Rootfs);
        assert_eq!(AssetBundle::new("support", "proot.tar.gz", 2, 0).kind, AssetKind::Support);
    }

    #[test]
    fn rootfs_is_matched_by_architecture_prefix() {
        let arm = AssetBundle::new("debian", "arm64-rootfs.tar.gz", 1, 0);
        assert!(arm.is_rootfs_for("arm64"));
        assert!(!arm.is_rootfs_for("arm"));
        assert!(!arm.is_rootfs_for("x86_64"));
        assert!(!AssetBundle::new("debian", "arm64-assets.tar.gz", 1, 0).is_rootfs_for("arm64"));
    }

    #[test]
    fn version_keys_distinguish_rootfs() {
        let rootfs = AssetBundle::new("debian", "rootfs.tar.gz", 1, 0);
        let assets = AssetBundle::new("debian", "assets.tar.gz", 1, 0);
        assert_eq!(rootfs.version_key(), "debian/rootfs");
        assert_eq!(assets.version_key(), "debian");
    }

    #[test]
    fn archive_name_round_trips_download_title() {
        let bundle = AssetBundle::new("debian", "arm64-rootfs.tar.gz", 12, 0);
        let parsed = ArchiveName::parse(&bundle.download_title()).unwrap();
        assert_eq!(parsed.repository, "debian");
        assert_eq!(parsed.archive, "arm64-rootfs.tar.gz");
        assert_eq!(parsed.version, 12);
    }

    #[test]
    fn archive_name_rejects_malformed() {
        assert!(ArchiveName::parse("noversion").is_none());
        assert!(ArchiveName::parse("support-busybox").is_none());
        assert!(ArchiveName::parse("support-busybox-abc").is_none());
        assert!(ArchiveName::parse("-busybox-3").is_none());
    }

    #[test]
    fn requirement_url_joins_repository() {
        let bundle = AssetBundle::new("support", "proot.tar.gz", 5, 1024);
        let req = DownloadRequirement::for_bundle("https://example.com/assets/", &bundle);
        assert_eq!(req.url, "https://example.com/assets/support/proot.tar.gz");
        assert_eq!(req.destination_title, "support-proot.tar.gz-5");
        assert_eq!(req.size_bytes, 1024);
    }
}
