//! Foreground launches of the server binary

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::errors::DeployError;

/// Time a fresh process gets before its liveness is re-checked
pub const STARTUP_GRACE_PERIOD: Duration = Duration::from_secs(2);

const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

/// One launch attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub start_time: DateTime<Utc>,

    /// Set once the process has exited; `None` while running or when
    /// terminated by a signal
    pub exit_code: Option<i32>,
}

/// A running child owned by the attempt that launched it.
///
/// Dropping it kills the child, so no process outlives a failed attempt.
#[derive(Debug)]
pub struct SupervisedProcess {
    handle: ProcessHandle,
    child: Child,
}

impl SupervisedProcess {
    pub fn pid(&self) -> u32 {
        self.handle.pid
    }

    /// Wait for the child to exit on its own
    pub async fn wait(&mut self) -> Result<ProcessHandle, DeployError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| DeployError::ProcessError(format!("Failed to wait for pid {}: {}", self.handle.pid, e)))?;
        self.handle.exit_code = status.code();
        info!("Process {} exited with {}", self.handle.pid, status);
        Ok(self.handle.clone())
    }

    /// Kill the child and reap it
    pub async fn terminate(mut self) -> Result<ProcessHandle, DeployError> {
        if let Ok(Some(status)) = self.child.try_wait() {
            self.handle.exit_code = status.code();
            debug!("Process {} had already exited", self.handle.pid);
            return Ok(self.handle);
        }

        info!("Terminating process {}", self.handle.pid);
        self.child
            .start_kill()
            .map_err(|e| DeployError::ProcessError(format!("Failed to kill pid {}: {}", self.handle.pid, e)))?;

        match tokio::time::timeout(TERMINATE_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => self.handle.exit_code = status.code(),
            Ok(Err(e)) => warn!("Failed to reap pid {}: {}", self.handle.pid, e),
            Err(_) => warn!("Process {} did not exit within {:?}", self.handle.pid, TERMINATE_TIMEOUT),
        }
        Ok(self.handle)
    }
}

/// Launches the server outside of any service manager
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    grace_period: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self {
            grace_period: STARTUP_GRACE_PERIOD,
        }
    }
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Spawn `binary_path` with `args`, then confirm it survived the grace
    /// period. A process that exits during startup is an error and is reaped
    /// before returning.
    pub async fn start(&self, binary_path: &Path, args: &[OsString]) -> Result<SupervisedProcess, DeployError> {
        let mut child = Command::new(binary_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeployError::ProcessError(format!("Failed to spawn {:?}: {}", binary_path, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| DeployError::ProcessError(format!("{:?} exited before reporting a pid", binary_path)))?;
        let start_time = Utc::now();
        info!("Started {:?} (pid {})", binary_path, pid);

        tokio::time::sleep(self.grace_period).await;

        match child.try_wait() {
            Ok(None) => Ok(SupervisedProcess {
                handle: ProcessHandle {
                    pid,
                    start_time,
                    exit_code: None,
                },
                child,
            }),
            Ok(Some(status)) => Err(DeployError::ProcessError(format!(
                "pid {} exited during startup with {}",
                pid, status
            ))),
            Err(e) => Err(DeployError::ProcessError(format!(
                "Liveness check for pid {} failed: {}",
                pid, e
            ))),
        }
    }
}
