//! Integration tests that run a real server inside proot.
//!
//! These need an installed data directory: the support repository with
//! `execInProot.sh`, `killProcTree.sh`, `isServerInProcTree.sh` and a proot
//! binary, plus an extracted filesystem whose `support/` holds the server
//! entry scripts. They are gated behind the `proot-integration-tests`
//! feature.
//!
//! # Running
//!
//! ```bash
//! ROOTFS_SESSIONS_TEST_DATA=/path/to/data \
//! ROOTFS_SESSIONS_TEST_FS=1 \
//!     cargo test --features proot-integration-tests --test proot_integration
//! ```

#![cfg(all(feature = "proot-integration-tests", target_os = "linux"))]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use rootfs_sessions::server::env::ServerPreferences;
use rootfs_sessions::server::{LocalServerSupervisor, ProotHost, ServiceType};
use rootfs_sessions::session::Session;

fn test_data_dir() -> Result<PathBuf> {
    std::env::var("ROOTFS_SESSIONS_TEST_DATA")
        .map(PathBuf::from)
        .context("ROOTFS_SESSIONS_TEST_DATA must point at an installed data directory")
}

fn test_filesystem_id() -> u64 {
    std::env::var("ROOTFS_SESSIONS_TEST_FS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

fn supervisor(data: &Path) -> LocalServerSupervisor {
    let host = ProotHost::new(data, data.join("support"));
    LocalServerSupervisor::new(Arc::new(host), data, ServerPreferences::default())
}

fn session(service_type: ServiceType) -> Session {
    let mut session = Session::new(1, "integration", test_filesystem_id(), "debian");
    session.service_type = service_type;
    session.username = "user".into();
    session.ssh_password = "userland".into();
    session.vnc_password = "userland".into();
    session.geometry = "1480x720".into();
    session
}

#[tokio::test]
async fn ssh_server_starts_and_stops() -> Result<()> {
    let data = test_data_dir()?;
    let supervisor = supervisor(&data);
    let mut session = session(ServiceType::Ssh);

    session.pid = Some(supervisor.start(&session).await?);
    supervisor
        .wait_until_running(
            &session,
            Duration::from_millis(500),
            Duration::from_secs(60),
            &CancellationToken::new(),
        )
        .await
        .context("dropbear never appeared in the process tree")?;
    assert!(supervisor.has_active_session());

    supervisor.stop(&session).await;
    assert!(!supervisor.has_active_session());
    assert!(!supervisor.is_running(&session).await);
    Ok(())
}

#[tokio::test]
async fn second_session_on_the_same_filesystem_is_refused() -> Result<()> {
    let data = test_data_dir()?;
    let supervisor = supervisor(&data);
    let mut first = session(ServiceType::Ssh);
    first.pid = Some(supervisor.start(&first).await?);

    let mut second = session(ServiceType::Vnc);
    second.id = 2;
    assert!(supervisor.start(&second).await.is_err());

    supervisor.stop_all().await;
    Ok(())
}
