//! Installs completed downloads into the data directory.
//!
//! Layout after installation:
//!
//! ```text
//! <data>/<repo>/<archive>         rootfs archive, moved as-is
//! <data>/<repo>/<entries...>      extracted support bundle contents
//! <data>/<fs_id>/                 extracted guest filesystem
//! <data>/<fs_id>/support/         distribution assets + extraction marker
//! ```
//!
//! Everything here is blocking; async callers go through
//! `tokio::task::spawn_blocking`.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{ProvisionError, ProvisionResult};
use crate::prefs::AssetPreferences;
use crate::provision::download::{file_name, list_files};
use crate::provision::{version_key, ArchiveName, AssetKind, ROOTFS_ARCHIVE_MARKER};

/// Written into `<fs>/support/` once the rootfs has been fully unpacked.
pub const EXTRACTION_MARKER: &str = ".success_filesystem_extraction";

const PART_SUFFIX: &str = ".part";
const ASSET_MODE: u32 = 0o777;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub rootfs: Vec<ArchiveName>,
    pub support: Vec<ArchiveName>,
    /// Checksum manifests and other files that were not installed.
    pub skipped: Vec<PathBuf>,
}

#[derive(Clone)]
pub struct ArchiveInstaller {
    data_dir: PathBuf,
    staging_dir: PathBuf,
    prefs: AssetPreferences,
    manifest_marker: String,
}

impl ArchiveInstaller {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        prefs: AssetPreferences,
        manifest_marker: impl Into<String>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            staging_dir: staging_dir.into(),
            prefs,
            manifest_marker: manifest_marker.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn repo_dir(&self, repository: &str) -> PathBuf {
        self.data_dir.join(repository)
    }

    /// Install every file in `download_dir`, in name order.
    ///
    /// Each bundle is installed atomically on its own; a failure part way
    /// leaves earlier bundles installed.
    pub fn install_all(&self, download_dir: &Path) -> ProvisionResult<InstallReport> {
        let _staging = StagingGuard::create(&self.staging_dir)?;
        let mut report = InstallReport::default();

        for path in list_files(download_dir)? {
            let filename = file_name(&path);
            if filename.contains(&self.manifest_marker) {
                debug!(target: "installer", file = %filename, "skipping checksum manifest");
                report.skipped.push(path);
                continue;
            }

            let name = ArchiveName::parse(&filename)
                .ok_or_else(|| ProvisionError::MalformedArchiveName(filename.clone()))?;

            if name.archive.contains(ROOTFS_ARCHIVE_MARKER) {
                self.install_rootfs(&path, &name)?;
                report.rootfs.push(name);
            } else {
                self.install_support(&path, &name)?;
                report.support.push(name);
            }
        }

        info!(
            target: "installer",
            rootfs = report.rootfs.len(),
            support = report.support.len(),
            "downloads installed"
        );
        Ok(report)
    }

    fn install_rootfs(&self, source: &Path, name: &ArchiveName) -> ProvisionResult<()> {
        let repo_dir = self.repo_dir(&name.repository);
        fs::create_dir_all(&repo_dir)?;
        remove_part_fragments(&repo_dir)?;

        let target = repo_dir.join(&name.archive);
        move_file(source, &target)?;
        self.prefs
            .set_local_version(&version_key(&name.repository, AssetKind::Rootfs), name.version)?;

        info!(target: "installer", repo = %name.repository, version = name.version, "rootfs archive installed");
        Ok(())
    }

    fn install_support(&self, source: &Path, name: &ArchiveName) -> ProvisionResult<()> {
        let staged = self.staging_dir.join(file_name(source));
        fs::copy(source, &staged)?;

        let extract_dir = self.staging_dir.join(format!("{}.extract", file_name(source)));
        if extract_dir.exists() {
            fs::remove_dir_all(&extract_dir)?;
        }
        fs::create_dir_all(&extract_dir)?;
        unpack_archive(&staged, &name.archive, &extract_dir)?;

        let repo_dir = self.repo_dir(&name.repository);
        fs::create_dir_all(&repo_dir)?;
        for entry in fs::read_dir(&extract_dir)? {
            let entry = entry?;
            let target = repo_dir.join(entry.file_name());
            remove_path(&target)?;
            fs::rename(entry.path(), &target)?;
            make_accessible(&target)?;
        }

        fs::remove_dir_all(&extract_dir)?;
        fs::remove_file(&staged)?;
        self.prefs
            .set_local_version(&version_key(&name.repository, AssetKind::Support), name.version)?;

        info!(target: "installer", repo = %name.repository, archive = %name.archive, version = name.version, "support bundle installed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Filesystem extraction
// ---------------------------------------------------------------------------

pub fn is_filesystem_extracted(filesystem_dir: &Path) -> bool {
    filesystem_dir.join("support").join(EXTRACTION_MARKER).is_file()
}

/// Unpack a rootfs archive into `filesystem_dir`.
///
/// `on_entry` is called once per distinct top-level entry as it is reached.
/// The marker is written only after the last entry was unpacked.
pub fn extract_filesystem(
    filesystem_dir: &Path,
    archive: &Path,
    mut on_entry: impl FnMut(&str),
) -> ProvisionResult<()> {
    fs::create_dir_all(filesystem_dir)?;
    let marker = filesystem_dir.join("support").join(EXTRACTION_MARKER);
    if marker.exists() {
        fs::remove_file(&marker)?;
    }

    let reader = open_archive(archive, &file_name(archive))?;
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);

    let mut current_top: Option<String> = None;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if let Some(top) = top_level_component(&path) {
            if current_top.as_deref() != Some(top.as_str()) {
                on_entry(&top);
                current_top = Some(top);
            }
        }
        entry.unpack_in(filesystem_dir)?;
    }

    fs::create_dir_all(marker.parent().unwrap_or(filesystem_dir))?;
    fs::write(&marker, b"")?;
    info!(target: "installer", dir = %filesystem_dir.display(), "filesystem extracted");
    Ok(())
}

/// Copy a distribution's installed assets into `<fs>/support/`.
pub fn copy_distribution_assets(repo_dir: &Path, support_dir: &Path) -> ProvisionResult<usize> {
    fs::create_dir_all(support_dir)?;
    let mut copied = 0;
    if !repo_dir.is_dir() {
        return Ok(copied);
    }
    for entry in WalkDir::new(repo_dir).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(repo_dir).map_err(io::Error::other)?;
        if is_rootfs_artifact(relative) {
            continue;
        }
        let target = support_dir.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            fs::set_permissions(&target, fs::Permissions::from_mode(ASSET_MODE))?;
            copied += 1;
        }
    }
    debug!(target: "installer", from = %repo_dir.display(), to = %support_dir.display(), copied, "distribution assets copied");
    Ok(copied)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Removes the staging directory however installation ends.
struct StagingGuard {
    dir: PathBuf,
}

impl StagingGuard {
    fn create(dir: &Path) -> io::Result<Self> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(target: "installer", dir = %self.dir.display(), error = %e, "failed to clean staging directory");
            }
        }
    }
}

fn open_archive(path: &Path, archive_name: &str) -> ProvisionResult<Box<dyn Read>> {
    let file = BufReader::new(File::open(path)?);
    if archive_name.ends_with(".tar.gz") || archive_name.ends_with(".tgz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else if archive_name.ends_with(".tar") {
        Ok(Box::new(file))
    } else {
        Err(ProvisionError::UnsupportedArchive(path.to_path_buf()))
    }
}

fn unpack_archive(path: &Path, archive_name: &str, into: &Path) -> ProvisionResult<()> {
    let mut tar = tar::Archive::new(open_archive(path, archive_name)?);
    tar.unpack(into)?;
    Ok(())
}

fn top_level_component(path: &Path) -> Option<String> {
    path.components().find_map(|c| match c {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    })
}

fn is_rootfs_artifact(relative: &Path) -> bool {
    relative
        .components()
        .next()
        .map(|c| c.as_os_str().to_string_lossy().contains(ROOTFS_ARCHIVE_MARKER))
        .unwrap_or(false)
}

fn remove_part_fragments(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = file_name(&path);
        if name.contains(ROOTFS_ARCHIVE_MARKER) && name.contains(PART_SUFFIX) {
            debug!(target: "installer", file = %name, "removing partial rootfs fragment");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Rename, falling back to copy + delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    remove_path(to)?;
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

fn make_accessible(path: &Path) -> io::Result<()> {
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.path_is_symlink() {
            continue;
        }
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(ASSET_MODE))?;
    }
    Ok(())
}
