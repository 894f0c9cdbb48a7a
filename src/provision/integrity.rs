//! Checksums for downloaded archives.
//!
//! Published checksum manifests are plain text with one `"<hex>  <filename>"`
//! entry per line, as produced by `md5sum`/`sha256sum`. Only the entry whose
//! filename starts with the host architecture prefix (e.g. `arm64-`) applies
//! to the rootfs archive we downloaded.
//!
//! Verification fails closed: an empty expected digest, a missing file or
//! any read error counts as a mismatch.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 8192;

/// Hash function used for archive checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// 128-bit digest used by the published `MD5SUMS` manifests.
    #[default]
    Md5,
    Sha256,
}

/// Lowercase hex digest of a file's contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

impl Digest {
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a hex string from a manifest.
    pub fn matches(&self, expected_hex: &str) -> bool {
        self.0.eq_ignore_ascii_case(expected_hex.trim())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the digest of the file at `path`.
pub fn checksum(path: &Path, algorithm: DigestAlgorithm) -> io::Result<Digest> {
    let file = File::open(path)?;
    let hex = match algorithm {
        DigestAlgorithm::Md5 => hash_reader::<Md5, _>(file)?,
        DigestAlgorithm::Sha256 => hash_reader::<Sha256, _>(file)?,
    };
    Ok(Digest(hex))
}

/// Returns `true` only when `path` hashes to `expected_hex`.
pub fn verify(expected_hex: &str, path: &Path, algorithm: DigestAlgorithm) -> bool {
    if expected_hex.trim().is_empty() {
        warn!(target: "integrity", file = %path.display(), "expected digest is empty");
        return false;
    }

    match checksum(path, algorithm) {
        Ok(actual) => {
            debug!(
                target: "integrity",
                file = %path.display(),
                expected = expected_hex,
                actual = %actual,
                "computed digest"
            );
            actual.matches(expected_hex)
        }
        Err(e) => {
            warn!(target: "integrity", file = %path.display(), error = %e, "hashing failed");
            false
        }
    }
}

/// Find the digest for the `<arch>-...` entry in a checksum manifest.
///
/// When several entries match, the last one wins.
pub fn parse_manifest_digest(contents: &str, arch: &str) -> Option<String> {
    let prefix = format!("{arch}-");
    contents
        .lines()
        .filter_map(|line| line.split_once("  "))
        .filter(|(_, filename)| filename.trim().starts_with(&prefix))
        .map(|(digest, _)| digest.trim().to_string())
        .last()
}

/// Translate the compile-time target architecture into the prefix used by
/// published rootfs archives.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "arm" => "arm",
        "x86_64" => "x86_64",
        "x86" => "x86",
        _ => "",
    }
}

fn hash_reader<D: sha2::Digest, R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
