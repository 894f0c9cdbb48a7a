//! Process-level access to the sandbox that hosts the servers.
//!
//! ```text
//! ProotHost::launch
//!     └─► sh <support>/execInProot.sh <entry script>   (long-running, reaped in a task)
//! ProotHost::kill_tree
//!     └─► sh <support>/killProcTree.sh <launcher pid> <server pid>
//! ProotHost::is_alive
//!     └─► sh <support>/isServerInProcTree.sh <server pid>
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::server::env::ServerEnv;

/// Sentinel passed to helper scripts when a pid is unknown.
pub const NO_PID: i64 = -1;

#[async_trait]
pub trait SandboxHost: Send + Sync {
    /// Run `script` inside the filesystem at `filesystem_dir`, returning the
    /// OS pid of the launcher process.
    async fn launch(&self, filesystem_dir: &Path, script: &str, env: &ServerEnv) -> ProvisionResult<u32>;

    /// Kill the launcher and, when known, the server running inside it.
    async fn kill_tree(&self, launcher_pid: u32, server_pid: Option<u32>) -> ProvisionResult<()>;

    /// Whether the in-sandbox server process is still part of our tree.
    async fn is_alive(&self, server_pid: u32) -> ProvisionResult<bool>;
}

/// Launches servers through proot using the installed support scripts.
pub struct ProotHost {
    data_dir: PathBuf,
    support_dir: PathBuf,
}

impl ProotHost {
    pub fn new(data_dir: impl Into<PathBuf>, support_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            support_dir: support_dir.into(),
        }
    }

    fn helper(&self, script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg(self.support_dir.join(script))
            .current_dir(&self.data_dir)
            .env("ROOT_PATH", &self.data_dir)
            .env("LD_LIBRARY_PATH", &self.support_dir)
            .stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl SandboxHost for ProotHost {
    async fn launch(&self, filesystem_dir: &Path, script: &str, env: &ServerEnv) -> ProvisionResult<u32> {
        let mut cmd = self.helper("execInProot.sh");
        cmd.arg(script)
            .env("ROOTFS_PATH", filesystem_dir)
            .env("PROOT_TMP_DIR", filesystem_dir.join("tmp"))
            .envs(env)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ProvisionError::ProcessLaunchFailure(format!("{script}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| ProvisionError::ProcessLaunchFailure(format!("{script}: exited before reporting a pid")))?;

        info!(target: "sandbox", pid, script, fs = %filesystem_dir.display(), "launched server");

        let script = script.to_string();
        tokio::spawn(async move {
            match child.wait_with_output().await {
                Ok(output) if output.status.success() => {
                    debug!(target: "sandbox", pid, script = %script, "launcher exited");
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(target: "sandbox", pid, script = %script, status = ?output.status, stderr = %stderr.trim(), "launcher exited with failure");
                }
                Err(e) => warn!(target: "sandbox", pid, error = %e, "failed to reap launcher"),
            }
        });

        Ok(pid)
    }

    async fn kill_tree(&self, launcher_pid: u32, server_pid: Option<u32>) -> ProvisionResult<()> {
        let server_pid = server_pid.map(i64::from).unwrap_or(NO_PID);
        let output = self
            .helper("killProcTree.sh")
            .arg(launcher_pid.to_string())
            .arg(server_pid.to_string())
            .output()
            .await
            .map_err(|e| ProvisionError::ProcessLaunchFailure(format!("killProcTree.sh: {e}")))?;

        if output.status.success() {
            debug!(target: "sandbox", launcher_pid, server_pid, "process tree killed");
            Ok(())
        } else {
            Err(ProvisionError::ProcessLaunchFailure(format!(
                "killProcTree.sh exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn is_alive(&self, server_pid: u32) -> ProvisionResult<bool> {
        let status = self
            .helper("isServerInProcTree.sh")
            .arg(server_pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ProvisionError::ProcessLaunchFailure(format!("isServerInProcTree.sh: {e}")))?;
        Ok(status.success())
    }
}
