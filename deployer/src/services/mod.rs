//! OS service lifecycle
//!
//! One capability interface, three backends. The backend is chosen once at
//! startup with [`PlatformKind::detect`] and [`service_manager`]; callers
//! never branch on platform afterwards.

pub mod launchd;
pub mod systemd;
pub mod windows;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::DeployError;

pub use launchd::Launchd;
pub use systemd::Systemd;
pub use windows::WindowsScm;

/// Pause between stop and start during a restart
pub const RESTART_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Service manager families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    #[serde(rename = "windows_scm")]
    WindowsScm,
    Systemd,
    Launchd,
}

impl PlatformKind {
    pub fn detect() -> Self {
        if cfg!(windows) {
            PlatformKind::WindowsScm
        } else if cfg!(target_os = "macos") {
            PlatformKind::Launchd
        } else {
            PlatformKind::Systemd
        }
    }
}

/// Everything a backend needs to register the server as a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub platform_kind: PlatformKind,
    pub run_as_user: Option<String>,
    pub working_directory: PathBuf,
    pub binary_path: PathBuf,
    pub config_path: PathBuf,

    /// The only writable tree for sandboxed backends
    pub data_dir: PathBuf,

    /// Start at boot
    pub auto_start: bool,
    pub description: String,
}

/// Platform-independent service state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,

    /// `auto`, `manual`, `disabled` or `unknown`
    pub start_type: String,
    pub exists: bool,
}

impl ServiceStatus {
    /// Status of a service that is not registered, or could not be queried
    pub fn missing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            running: false,
            start_type: "unknown".to_string(),
            exists: false,
        }
    }
}

/// Service lifecycle capabilities
#[async_trait]
pub trait ServiceManager: Send + Sync {
    fn kind(&self) -> PlatformKind;

    /// Register (or re-register) the service
    async fn install(&self, descriptor: &ServiceDescriptor) -> Result<(), DeployError>;

    async fn uninstall(&self, name: &str) -> Result<(), DeployError>;

    async fn start(&self, name: &str) -> Result<(), DeployError>;

    async fn stop(&self, name: &str) -> Result<(), DeployError>;

    /// Never fails; an unqueryable service reports as missing
    async fn status(&self, name: &str) -> ServiceStatus;

    /// Most recent `lines` log lines, oldest first
    async fn logs(&self, name: &str, lines: usize) -> Result<Vec<String>, DeployError>;

    fn settle_delay(&self) -> Duration {
        RESTART_SETTLE_DELAY
    }

    /// Stop, wait a fixed settle delay, start
    async fn restart(&self, name: &str) -> Result<(), DeployError> {
        info!("Restarting service {}", name);
        if let Err(e) = self.stop(name).await {
            warn!("Stop before restart failed for {}: {}", name, e);
        }
        tokio::time::sleep(self.settle_delay()).await;
        self.start(name).await
    }
}

/// Backend for `kind` with the OS-standard locations
pub fn service_manager(kind: PlatformKind) -> Arc<dyn ServiceManager> {
    match kind {
        PlatformKind::WindowsScm => Arc::new(WindowsScm::new()),
        PlatformKind::Systemd => Arc::new(Systemd::new()),
        PlatformKind::Launchd => Arc::new(Launchd::new()),
    }
}

/// Quote a path for a command line when it contains whitespace
pub(crate) fn quote_if_needed(value: &str) -> String {
    if value.contains(char::is_whitespace) {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}
