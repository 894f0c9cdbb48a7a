//! Line-oriented manifests published by the asset server.
//!
//! Both formats start with a schema header line that is skipped.
//!
//! `apps.txt`:
//! ```text
//! name, category, filesystem required, supports cli, supports gui, is paid app, version
//! debian, distribution, debian, true, true, false, 3
//! ```
//!
//! `<repo>/assets.txt`:
//! ```text
//! archive, version, size
//! arm64-rootfs.tar.gz, 12, 104857600
//! assets.tar.gz, 4, 20480
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::provision::AssetBundle;

const HEADER_LINES: usize = 1;

/// An entry from the apps list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub category: String,
    /// Distribution the app runs in.
    pub filesystem_required: String,
    pub supports_cli: bool,
    pub supports_gui: bool,
    pub is_paid: bool,
    pub version: u64,
}

impl App {
    pub fn is_distribution(&self) -> bool {
        self.category == "distribution"
    }
}

/// Parse `apps.txt`. Any malformed record fails the whole list.
pub fn parse_apps_list(contents: &str) -> ProvisionResult<Vec<App>> {
    records(contents)
        .map(|line| {
            let lowered = line.to_lowercase();
            let fields: Vec<&str> = lowered.split(", ").collect();
            let [name, category, filesystem, cli, gui, paid, version] = fields.as_slice() else {
                return Err(ProvisionError::AssetList(format!("bad app record: {line}")));
            };
            Ok(App {
                name: name.to_string(),
                category: category.to_string(),
                filesystem_required: filesystem.to_string(),
                supports_cli: parse_bool(cli),
                supports_gui: parse_bool(gui),
                is_paid: parse_bool(paid),
                version: parse_version(version, line)?,
            })
        })
        .collect()
}

/// Parse `<repo>/assets.txt` into bundles for `repository`.
pub fn parse_asset_list(repository: &str, contents: &str) -> ProvisionResult<Vec<AssetBundle>> {
    records(contents)
        .map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            match fields.as_slice() {
                [archive, version] => Ok(AssetBundle::new(
                    repository,
                    archive,
                    parse_version(version, line)?,
                    0,
                )),
                [archive, version, size] => Ok(AssetBundle::new(
                    repository,
                    archive,
                    parse_version(version, line)?,
                    size.parse().map_err(|_| {
                        ProvisionError::AssetList(format!("bad size in record: {line}"))
                    })?,
                )),
                _ => Err(ProvisionError::AssetList(format!("bad asset record: {line}"))),
            }
        })
        .collect()
}

/// Names of all distribution entries in an apps list.
pub fn distributions(apps: &[App]) -> Vec<String> {
    let mut names: Vec<String> = apps
        .iter()
        .filter(|app| app.is_distribution())
        .map(|app| app.name.clone())
        .collect();
    names.sort();
    names.dedup();
    names
}

fn records(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .trim()
        .lines()
        .skip(HEADER_LINES)
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

fn parse_bool(field: &str) -> bool {
    field.trim() == "true"
}

fn parse_version(field: &str, line: &str) -> ProvisionResult<u64> {
    field
        .trim()
        .parse()
        .map_err(|_| ProvisionError::AssetList(format!("bad version in record: {line}")))
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Remote source of the apps list and per-repository asset lists.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Base URL that asset archive paths are resolved against.
    fn base_url(&self) -> &str;

    async fn fetch_apps_list(&self) -> ProvisionResult<Vec<App>>;

    async fn fetch_asset_list(&self, repository: &str) -> ProvisionResult<Vec<AssetBundle>>;
}

/// Fetches manifests over HTTP(S).
pub struct HttpAssetSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAssetSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get_text(&self, url: &str) -> ProvisionResult<String> {
        debug!(target: "manifest", url, "fetching manifest");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                warn!(target: "manifest", url, error = %e, "manifest fetch failed");
                ProvisionError::AssetList(format!("GET {url}: {e}"))
            })?;
        response
            .text()
            .await
            .map_err(|e| ProvisionError::AssetList(format!("read {url}: {e}")))
    }
}

#[async_trait]
impl AssetSource for HttpAssetSource {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_apps_list(&self) -> ProvisionResult<Vec<App>> {
        let body = self.get_text(&format!("{}/apps.txt", self.base_url)).await?;
        parse_apps_list(&body)
    }

    async fn fetch_asset_list(&self, repository: &str) -> ProvisionResult<Vec<AssetBundle>> {
        let body = self
            .get_text(&format!("{}/{repository}/assets.txt", self.base_url))
            .await?;
        parse_asset_list(repository, &body)
    }
}
