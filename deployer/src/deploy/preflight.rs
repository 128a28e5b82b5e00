//! Pre-flight checks
//!
//! Nothing here writes to the filesystem or touches a service.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::Disks;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::deploy::profile::EnvironmentProfile;
use crate::errors::DeployError;
use crate::exec::{self, COMMAND_TIMEOUT};
use crate::filesys::owner::Account;

/// Host facts the checks depend on
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Root on Unix, an administrator on Windows
    async fn is_elevated(&self) -> bool;

    async fn can_reach(&self, host: &str, port: u16, timeout: Duration) -> bool;

    /// Free bytes on the filesystem that holds `path`
    fn available_space(&self, path: &Path) -> Option<u64>;

    /// Whether nothing is listening on `port`
    async fn port_available(&self, port: u16) -> bool {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Port {} unavailable: {}", port, e);
                false
            }
        }
    }
}

/// Probes the machine this process runs on
#[derive(Debug, Clone, Default)]
pub struct SystemHostProbe;

#[async_trait]
impl HostProbe for SystemHostProbe {
    async fn is_elevated(&self) -> bool {
        if cfg!(windows) {
            // Only administrators may list sessions
            exec::run("net", ["session"], COMMAND_TIMEOUT)
                .await
                .map(|output| output.success())
                .unwrap_or(false)
        } else {
            exec::run("id", ["-u"], COMMAND_TIMEOUT)
                .await
                .map(|output| output.success() && output.stdout.trim() == "0")
                .unwrap_or(false)
        }
    }

    async fn can_reach(&self, host: &str, port: u16, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }

    fn available_space(&self, path: &Path) -> Option<u64> {
        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// The process must be able to register services and write system paths
pub async fn check_privileges(probe: &dyn HostProbe, profile: &EnvironmentProfile) -> Result<(), DeployError> {
    if !profile.require_elevation {
        debug!("Elevation not required for {}", profile.name);
        return Ok(());
    }
    if !probe.is_elevated().await {
        return Err(DeployError::PreflightError(
            "Administrator or root privileges are required".to_string(),
        ));
    }
    Ok(())
}

/// The account the service runs as must exist
pub fn check_account(profile: &EnvironmentProfile) -> Result<(), DeployError> {
    if let Some(user) = &profile.run_as_user {
        let account = Account::lookup(user).map_err(|e| DeployError::PreflightError(e.to_string()))?;
        debug!("Service account {} resolved", account.name);
    }
    Ok(())
}

/// The release feed host must accept TCP connections
pub async fn check_network(probe: &dyn HostProbe, feed_url: &str, timeout: Duration) -> Result<(), DeployError> {
    let url = url::Url::parse(feed_url)
        .map_err(|e| DeployError::PreflightError(format!("Invalid release feed URL {}: {}", feed_url, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| DeployError::PreflightError(format!("Release feed URL {} has no host", feed_url)))?;
    let port = url.port_or_known_default().unwrap_or(443);

    if !probe.can_reach(host, port, timeout).await {
        return Err(DeployError::PreflightError(format!(
            "Release feed {}:{} is not reachable",
            host, port
        )));
    }
    debug!("Release feed {}:{} reachable", host, port);
    Ok(())
}

/// The data directory must have the free space the size class asks for
pub fn check_disk(probe: &dyn HostProbe, profile: &EnvironmentProfile) -> Result<(), DeployError> {
    let required = profile.size_class.min_free_bytes();
    let available = probe.available_space(&profile.data_dir).ok_or_else(|| {
        DeployError::PreflightError(format!("Cannot determine free space for {:?}", profile.data_dir))
    })?;

    if available < required {
        return Err(DeployError::PreflightError(format!(
            "{} bytes free for {:?}, {:?} profile needs {}",
            available, profile.data_dir, profile.size_class, required
        )));
    }
    debug!("{} bytes free for {:?}", available, profile.data_dir);
    Ok(())
}

/// Every port in `ports` must be free
pub async fn check_ports(probe: &dyn HostProbe, ports: &[u16]) -> Result<(), DeployError> {
    let mut busy = Vec::new();
    for port in ports {
        if !probe.port_available(*port).await {
            busy.push(*port);
        }
    }
    if !busy.is_empty() {
        return Err(DeployError::PreflightError(format!("Ports already in use: {:?}", busy)));
    }
    info!("Ports available: {:?}", ports);
    Ok(())
}
