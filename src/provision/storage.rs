//! Host environment queries used before committing to a download.

use std::io;
use std::path::Path;

/// Free space on the filesystem holding a path.
pub trait FreeSpace: Send + Sync {
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// `statvfs(3)` backed free-space query.
pub struct StatvfsFreeSpace;

impl FreeSpace for StatvfsFreeSpace {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        // The directory may not exist yet on first run.
        let mut probe = path;
        while !probe.exists() {
            probe = match probe.parent() {
                Some(parent) => parent,
                None => break,
            };
        }
        let stat = rustix::fs::statvfs(probe).map_err(io::Error::from)?;
        Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
    }
}

/// Whether the active network connection is billed by volume.
pub trait NetworkStatus: Send + Sync {
    fn is_metered(&self) -> bool;
}

/// Desktop hosts: never ask before large downloads.
pub struct UnmeteredNetwork;

impl NetworkStatus for UnmeteredNetwork {
    fn is_metered(&self) -> bool {
        false
    }
}

/// Estimate of the space a batch needs once downloaded and unpacked.
///
/// Rootfs archives are counted `expansion_factor` times since they are
/// kept and also extracted.
pub fn required_bytes(
    sizes: impl IntoIterator<Item = (bool, u64)>,
    expansion_factor: f64,
    overhead_bytes: u64,
) -> u64 {
    let payload: f64 = sizes
        .into_iter()
        .map(|(is_rootfs, size)| {
            if is_rootfs {
                size as f64 * expansion_factor
            } else {
                size as f64
            }
        })
        .sum();
    (payload.ceil() as u64).saturating_add(overhead_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statvfs_reports_space_for_missing_child() {
        let dir = tempfile::tempdir().unwrap();
        let free = StatvfsFreeSpace
            .available_bytes(&dir.path().join("not/yet/created"))
            .unwrap();
        assert!(free > 0);
    }

    #[test]
    fn rootfs_size_is_expanded() {
        let required = required_bytes([(true, 100), (false, 10)], 2.5, 5);
        assert_eq!(required, 250 + 10 + 5);
    }
}
