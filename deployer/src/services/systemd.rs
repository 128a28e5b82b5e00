//! systemd backend

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::exec::{self, CommandOutput, COMMAND_TIMEOUT};
use crate::filesys::file::File;
use crate::services::{quote_if_needed, PlatformKind, ServiceDescriptor, ServiceManager, ServiceStatus};

const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// Manages `<name>.service` units
#[derive(Debug, Clone)]
pub struct Systemd {
    unit_dir: PathBuf,
}

impl Default for Systemd {
    fn default() -> Self {
        Self::new()
    }
}

impl Systemd {
    pub fn new() -> Self {
        Self::with_unit_dir(DEFAULT_UNIT_DIR)
    }

    pub fn with_unit_dir(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
        }
    }

    pub fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.service", name))
    }

    async fn systemctl(&self, args: &[&str]) -> Result<CommandOutput, DeployError> {
        exec::run("systemctl", args, COMMAND_TIMEOUT)
            .await
            .map_err(|e| DeployError::ServiceError(format!("Failed to run systemctl: {}", e)))
    }

    async fn systemctl_ok(&self, args: &[&str]) -> Result<(), DeployError> {
        let output = self.systemctl(args).await?;
        if !output.success() {
            return Err(DeployError::ServiceError(format!(
                "systemctl {} failed ({})",
                args.join(" "),
                output.describe()
            )));
        }
        Ok(())
    }
}

/// Render the unit file for `descriptor`
pub fn render_unit(descriptor: &ServiceDescriptor) -> String {
    let mut unit = String::new();
    unit.push_str("[Unit]\n");
    unit.push_str(&format!("Description={}\n", descriptor.description));
    unit.push_str("After=network-online.target\n");
    unit.push_str("Wants=network-online.target\n");
    unit.push('\n');

    unit.push_str("[Service]\n");
    unit.push_str("Type=simple\n");
    if let Some(user) = &descriptor.run_as_user {
        unit.push_str(&format!("User={}\n", user));
    }
    unit.push_str(&format!(
        "WorkingDirectory={}\n",
        quote_if_needed(&descriptor.working_directory.to_string_lossy())
    ));
    unit.push_str(&format!(
        "ExecStart={} --config {} frontend\n",
        quote_if_needed(&descriptor.binary_path.to_string_lossy()),
        quote_if_needed(&descriptor.config_path.to_string_lossy())
    ));
    unit.push_str("Restart=always\n");
    unit.push_str("RestartSec=10\n");
    unit.push_str("LimitNOFILE=65536\n");
    unit.push_str("NoNewPrivileges=true\n");
    unit.push_str("PrivateTmp=true\n");
    unit.push_str("ProtectSystem=strict\n");
    unit.push_str(&format!(
        "ReadWritePaths={}\n",
        quote_if_needed(&descriptor.data_dir.to_string_lossy())
    ));
    unit.push('\n');

    unit.push_str("[Install]\n");
    unit.push_str("WantedBy=multi-user.target\n");
    unit
}

/// Map `systemctl show` output to (running, start type)
pub fn parse_show(output: &str) -> (bool, String) {
    let mut running = false;
    let mut start_type = "unknown".to_string();
    for line in output.lines() {
        match line.split_once('=') {
            Some(("ActiveState", state)) => running = state.trim() == "active",
            Some(("UnitFileState", state)) => {
                start_type = match state.trim() {
                    "enabled" | "enabled-runtime" | "static" => "auto",
                    "disabled" => "manual",
                    "masked" | "masked-runtime" => "disabled",
                    _ => "unknown",
                }
                .to_string()
            }
            _ => {}
        }
    }
    (running, start_type)
}

#[async_trait]
impl ServiceManager for Systemd {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Systemd
    }

    async fn install(&self, descriptor: &ServiceDescriptor) -> Result<(), DeployError> {
        let unit_path = self.unit_path(&descriptor.name);
        info!("Writing systemd unit {:?}", unit_path);

        File::new(&unit_path)
            .write_atomic(render_unit(descriptor).as_bytes())
            .await
            .map_err(|e| DeployError::ServiceError(format!("Failed to write {:?}: {}", unit_path, e)))?;

        self.systemctl_ok(&["daemon-reload"]).await?;
        if descriptor.auto_start {
            self.systemctl_ok(&["enable", "--now", descriptor.name.as_str()]).await?;
        }
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> Result<(), DeployError> {
        let unit_path = self.unit_path(name);
        if !File::new(&unit_path).exists().await {
            debug!("Unit {:?} not present", unit_path);
            return Ok(());
        }

        if let Err(e) = self.systemctl_ok(&["disable", "--now", name]).await {
            warn!("Disabling {} failed: {}", name, e);
        }
        tokio::fs::remove_file(&unit_path).await?;
        self.systemctl_ok(&["daemon-reload"]).await
    }

    async fn start(&self, name: &str) -> Result<(), DeployError> {
        self.systemctl_ok(&["start", name]).await
    }

    async fn stop(&self, name: &str) -> Result<(), DeployError> {
        self.systemctl_ok(&["stop", name]).await
    }

    async fn status(&self, name: &str) -> ServiceStatus {
        if !unit_exists(&self.unit_path(name)).await {
            return ServiceStatus::missing(name);
        }

        match self
            .systemctl(&["show", name, "--property=ActiveState,UnitFileState", "--no-pager"])
            .await
        {
            Ok(output) if output.success() => {
                let (running, start_type) = parse_show(&output.stdout);
                ServiceStatus {
                    name: name.to_string(),
                    running,
                    start_type,
                    exists: true,
                }
            }
            Ok(output) => {
                warn!("systemctl show {} failed: {}", name, output.describe());
                ServiceStatus::missing(name)
            }
            Err(e) => {
                warn!("Status query for {} failed: {}", name, e);
                ServiceStatus::missing(name)
            }
        }
    }

    async fn logs(&self, name: &str, lines: usize) -> Result<Vec<String>, DeployError> {
        let count = lines.to_string();
        let output = exec::run(
            "journalctl",
            ["-u", name, "-n", count.as_str(), "--no-pager", "-o", "short-iso"],
            COMMAND_TIMEOUT,
        )
        .await
        .map_err(|e| DeployError::ServiceError(format!("Failed to run journalctl: {}", e)))?;

        if !output.success() {
            return Err(DeployError::ServiceError(format!(
                "journalctl failed ({})",
                output.describe()
            )));
        }
        Ok(output.stdout.lines().map(str::to_string).collect())
    }
}

async fn unit_exists(path: &Path) -> bool {
    File::new(path).exists().await
}
