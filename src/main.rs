//! rootfs-sessions command line.
//!
//! Provisions a distribution's root filesystem, starts one of its servers
//! and keeps it running until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::info;

use rootfs_sessions::config::Config;
use rootfs_sessions::paths::AppPaths;
use rootfs_sessions::prefs::AssetPreferences;
use rootfs_sessions::provision::download::DownloadCoordinator;
use rootfs_sessions::provision::installer::ArchiveInstaller;
use rootfs_sessions::provision::manifest::{self, AssetSource, HttpAssetSource};
use rootfs_sessions::provision::storage::{StatvfsFreeSpace, UnmeteredNetwork};
use rootfs_sessions::provision::transport::HttpTransport;
use rootfs_sessions::server::{LocalServerSupervisor, ProotHost, ServiceType};
use rootfs_sessions::session::{
    PipelineUpdate, ProgressBarUpdateState, Session, SessionStartup, SessionStartupHandle, StartupDeps,
    StartupOutcome, UserInputRequiredState,
};
use rootfs_sessions::logging;

/// Provision root filesystems and run sessions on them
#[derive(Parser, Debug)]
#[command(name = "rootfs-sessions", version, about = "Provision root filesystems and run sessions on them")]
struct Args {
    /// Keep config, data and cache under this directory instead of the
    /// platform defaults
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision a distribution and start a session on it
    Start {
        /// Distribution repository, e.g. `debian`
        distribution: String,
        #[arg(long, default_value_t = 1)]
        filesystem_id: u64,
        #[arg(long, default_value_t = 1)]
        session_id: i64,
        /// App name the session is started for (defaults to the distribution)
        #[arg(long)]
        name: Option<String>,
        /// ssh, vnc or xsdl; asked for when omitted
        #[arg(long)]
        service: Option<ServiceType>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        ssh_password: Option<String>,
        #[arg(long)]
        vnc_password: Option<String>,
    },
    /// List the apps published by the asset server
    Apps,
    /// Show persisted download and version state
    Status,
    /// Forget cached asset lists, versions and any pending batch
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let paths = match &args.root {
        Some(root) => AppPaths::under(root),
        None => AppPaths::resolve().context("HOME is not set")?,
    };
    let _log_guard = logging::init(&paths.logs);
    paths.ensure().context("creating application directories")?;

    let config = Config::load(&paths.config_file()).context("loading config")?;
    url::Url::parse(&config.assets.base_url)
        .with_context(|| format!("invalid asset base URL {:?}", config.assets.base_url))?;
    let prefs = AssetPreferences::open(paths.state_file()).context("opening persisted state")?;

    match args.command {
        Command::Start {
            distribution,
            filesystem_id,
            session_id,
            name,
            service,
            username,
            ssh_password,
            vnc_password,
        } => {
            let mut session = Session::new(
                session_id,
                name.as_deref().unwrap_or(&distribution),
                filesystem_id,
                &distribution,
            );
            session.service_type = service.unwrap_or_default();
            session.username = username.unwrap_or_default();
            session.ssh_password = ssh_password.unwrap_or_default();
            session.vnc_password = vnc_password.unwrap_or_default();
            session.geometry = config.display.geometry();
            start(paths, config, prefs, session).await
        }
        Command::Apps => {
            let source = HttpAssetSource::new(&config.assets.base_url);
            let apps = source.fetch_apps_list().await.context("fetching apps list")?;
            for app in &apps {
                println!(
                    "{:<20} {:<14} fs={:<10} cli={} gui={} v{}",
                    app.name, app.category, app.filesystem_required, app.supports_cli, app.supports_gui, app.version
                );
            }
            println!("distributions: {}", manifest::distributions(&apps).join(", "));
            Ok(())
        }
        Command::Status => {
            println!("downloads in progress: {}", prefs.downloads_in_progress());
            for id in prefs.enqueued_downloads() {
                println!("  enqueued {id}");
            }
            match prefs.asset_lists_refreshed_at() {
                Some(at) => println!("asset lists refreshed: {at}"),
                None => println!("asset lists refreshed: never"),
            }
            for (key, version) in prefs.versions() {
                println!("{key:<24} local {:<6} remote {}", version.local, version.remote);
            }
            Ok(())
        }
        Command::ClearCache => {
            prefs.clear_all().context("clearing persisted state")?;
            if paths.downloads.exists() {
                std::fs::remove_dir_all(&paths.downloads).context("removing downloads")?;
            }
            println!("cache cleared");
            Ok(())
        }
    }
}

async fn start(paths: AppPaths, config: Config, prefs: AssetPreferences, session: Session) -> Result<()> {
    let support_dir = paths.support_dir(&config.assets.support_repository);
    let supervisor = Arc::new(LocalServerSupervisor::new(
        Arc::new(ProotHost::new(&paths.data, support_dir)),
        &paths.data,
        config.server.clone(),
    ));
    let coordinator = DownloadCoordinator::new(
        Arc::new(HttpTransport::new()),
        prefs.clone(),
        &paths.downloads,
        config.checksum_policy(),
    );
    let deps = StartupDeps {
        asset_source: Arc::new(HttpAssetSource::new(&config.assets.base_url)),
        downloads: Arc::new(tokio::sync::Mutex::new(coordinator)),
        installer: ArchiveInstaller::new(
            &paths.data,
            &paths.staging,
            prefs.clone(),
            config.integrity.manifest_marker.clone(),
        ),
        free_space: Arc::new(StatvfsFreeSpace),
        network: Arc::new(UnmeteredNetwork),
        supervisor: Arc::clone(&supervisor),
        prefs,
        config,
    };

    let (handle, mut updates, task) = SessionStartup::spawn(deps, session);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(update) = updates.recv().await {
        match update {
            PipelineUpdate::Progress(ProgressBarUpdateState::DownloadProgress { completed, total }) => {
                eprintln!("downloading: {completed}/{total}");
            }
            PipelineUpdate::Progress(ProgressBarUpdateState::FilesystemExtractionStep(entry)) => {
                eprintln!("extracting: {entry}");
            }
            PipelineUpdate::Progress(step) => eprintln!("{step:?}"),
            PipelineUpdate::UserInputRequired(request) => answer(&handle, request, &mut stdin).await?,
            PipelineUpdate::Illegal(state) => eprintln!("illegal state {}: {state}", state.name()),
            PipelineUpdate::CanOnlyStartSingleSession => eprintln!("another session is already running"),
            PipelineUpdate::Failure(failure) => eprintln!("failed: {failure}"),
            PipelineUpdate::Cancelled => eprintln!("cancelled"),
        }
    }

    let session = match task.await.context("startup task panicked")? {
        StartupOutcome::Started(session) => session,
        StartupOutcome::Cancelled => return Ok(()),
        other => bail!("session did not start: {other:?}"),
    };

    println!("session {} running ({}), press Ctrl-C to stop", session.id, session.service_type);
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!(target: "startup", session = session.id, "stopping session");
    supervisor.stop(&session).await;
    Ok(())
}

async fn answer(
    handle: &SessionStartupHandle,
    request: UserInputRequiredState,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> Result<()> {
    match request {
        UserInputRequiredState::AppServiceTypePreferenceRequired => {
            let choice = prompt(stdin, "service type (ssh/vnc/xsdl): ").await?;
            match choice.and_then(|c| c.parse::<ServiceType>().ok()) {
                Some(service) => handle.submit_app_service_type(service),
                None => handle.handle_user_input_cancelled(),
            }
        }
        UserInputRequiredState::FilesystemCredentialsRequired => {
            let username = prompt(stdin, "username: ").await?;
            let ssh_password = prompt(stdin, "password: ").await?;
            let vnc_password = prompt(stdin, "vnc password (blank for none): ").await?;
            match (username, ssh_password) {
                (Some(username), Some(ssh_password)) => handle.submit_filesystem_credentials(
                    &username,
                    &ssh_password,
                    vnc_password.as_deref().unwrap_or_default(),
                ),
                _ => handle.handle_user_input_cancelled(),
            }
        }
        UserInputRequiredState::LargeDownloadRequired(requirements) => {
            for requirement in &requirements {
                eprintln!("  {requirement}");
            }
            if confirm(stdin, "download over a metered connection? [y/N] ").await? {
                handle.start_asset_downloads(requirements);
            } else {
                handle.handle_user_input_cancelled();
            }
        }
        UserInputRequiredState::LowStorageAcknowledgementRequired => {
            if confirm(stdin, "storage is low, continue anyway? [y/N] ").await? {
                handle.low_available_storage_acknowledged();
            } else {
                handle.handle_user_input_cancelled();
            }
        }
    }
    Ok(())
}

async fn prompt(stdin: &mut Lines<BufReader<Stdin>>, question: &str) -> Result<Option<String>> {
    eprint!("{question}");
    let line = stdin.next_line().await.context("reading stdin")?;
    Ok(line.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()))
}

async fn confirm(stdin: &mut Lines<BufReader<Stdin>>, question: &str) -> Result<bool> {
    let answer = prompt(stdin, question).await?;
    Ok(matches!(answer.as_deref(), Some("y" | "Y" | "yes")))
}
