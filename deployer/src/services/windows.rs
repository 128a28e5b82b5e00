//! Windows service control manager backend, driven through `sc.exe`

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::exec::{self, CommandOutput, COMMAND_TIMEOUT};
use crate::managed::ManagedBinary;
use crate::services::{PlatformKind, ServiceDescriptor, ServiceManager, ServiceStatus};

/// `ERROR_SERVICE_DOES_NOT_EXIST`
const SERVICE_DOES_NOT_EXIST: i32 = 1060;

/// `ERROR_SERVICE_ALREADY_RUNNING`
const SERVICE_ALREADY_RUNNING: i32 = 1056;

/// `ERROR_SERVICE_NOT_ACTIVE`
const SERVICE_NOT_ACTIVE: i32 = 1062;

/// Failure counter reset window in seconds
const FAILURE_RESET_SECS: u32 = 86_400;

/// Three restarts, 60 seconds apart
const FAILURE_ACTIONS: &str = "restart/60000/restart/60000/restart/60000";

/// Manages services registered with the SCM
#[derive(Debug, Clone)]
pub struct WindowsScm {
    sc: String,
}

impl Default for WindowsScm {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowsScm {
    pub fn new() -> Self {
        Self {
            sc: "sc.exe".to_string(),
        }
    }

    async fn sc(&self, args: &[&str]) -> Result<CommandOutput, DeployError> {
        exec::run(&self.sc, args, COMMAND_TIMEOUT)
            .await
            .map_err(|e| DeployError::ServiceError(format!("Failed to run sc.exe: {}", e)))
    }

    async fn sc_ok(&self, args: &[&str], tolerated: &[i32]) -> Result<(), DeployError> {
        let output = self.sc(args).await?;
        if output.success() || output.code.is_some_and(|c| tolerated.contains(&c)) {
            return Ok(());
        }
        Err(DeployError::ServiceError(format!(
            "sc.exe {} failed ({})",
            args.first().copied().unwrap_or_default(),
            output.describe()
        )))
    }
}

/// `RUNNING` state from `sc query` output
pub fn parse_query_running(output: &str) -> bool {
    output
        .lines()
        .find(|line| line.trim_start().starts_with("STATE"))
        .is_some_and(|line| line.contains("RUNNING"))
}

/// Normalized start type from `sc qc` output
pub fn parse_qc_start_type(output: &str) -> String {
    let Some(line) = output
        .lines()
        .find(|line| line.trim_start().starts_with("START_TYPE"))
    else {
        return "unknown".to_string();
    };

    if line.contains("AUTO_START") || line.contains("BOOT_START") || line.contains("SYSTEM_START") {
        "auto"
    } else if line.contains("DEMAND_START") {
        "manual"
    } else if line.contains("DISABLED") {
        "disabled"
    } else {
        "unknown"
    }
    .to_string()
}

#[async_trait]
impl ServiceManager for WindowsScm {
    fn kind(&self) -> PlatformKind {
        PlatformKind::WindowsScm
    }

    async fn install(&self, descriptor: &ServiceDescriptor) -> Result<(), DeployError> {
        let name = descriptor.name.as_str();
        let command_line =
            ManagedBinary::new(&descriptor.binary_path).frontend_command_line(&descriptor.config_path);
        let start = if descriptor.auto_start { "auto" } else { "demand" };

        let verb = if self.status(name).await.exists {
            info!("Updating existing service {}", name);
            "config"
        } else {
            info!("Creating service {}", name);
            "create"
        };

        let mut args = vec![verb, name, "binPath=", command_line.as_str(), "start=", start, "DisplayName=", name];
        if let Some(user) = &descriptor.run_as_user {
            args.extend(["obj=", user.as_str()]);
        }
        self.sc_ok(&args, &[]).await?;

        let reset = FAILURE_RESET_SECS.to_string();
        self.sc_ok(&["failure", name, "reset=", reset.as_str(), "actions=", FAILURE_ACTIONS], &[])
            .await?;

        if let Err(e) = self.sc_ok(&["description", name, descriptor.description.as_str()], &[]).await {
            warn!("Setting description for {} failed: {}", name, e);
        }
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> Result<(), DeployError> {
        if !self.status(name).await.exists {
            debug!("Service {} not registered", name);
            return Ok(());
        }
        self.sc_ok(&["stop", name], &[SERVICE_NOT_ACTIVE]).await?;
        self.sc_ok(&["delete", name], &[SERVICE_DOES_NOT_EXIST]).await
    }

    async fn start(&self, name: &str) -> Result<(), DeployError> {
        self.sc_ok(&["start", name], &[SERVICE_ALREADY_RUNNING]).await
    }

    async fn stop(&self, name: &str) -> Result<(), DeployError> {
        self.sc_ok(&["stop", name], &[SERVICE_NOT_ACTIVE]).await
    }

    async fn status(&self, name: &str) -> ServiceStatus {
        let query = match self.sc(&["query", name]).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                if output.code != Some(SERVICE_DOES_NOT_EXIST) {
                    warn!("sc query {} failed: {}", name, output.describe());
                }
                return ServiceStatus::missing(name);
            }
            Err(e) => {
                warn!("Status query for {} failed: {}", name, e);
                return ServiceStatus::missing(name);
            }
        };

        let start_type = match self.sc(&["qc", name]).await {
            Ok(output) if output.success() => parse_qc_start_type(&output.stdout),
            _ => "unknown".to_string(),
        };

        ServiceStatus {
            name: name.to_string(),
            running: parse_query_running(&query.stdout),
            start_type,
            exists: true,
        }
    }

    async fn logs(&self, name: &str, lines: usize) -> Result<Vec<String>, DeployError> {
        let query = format!("/q:*[System[Provider[@Name='{}']]]", name);
        let count = format!("/c:{}", lines);
        let output = exec::run(
            "wevtutil",
            ["qe", "Application", query.as_str(), count.as_str(), "/rd:true", "/f:text"],
            COMMAND_TIMEOUT,
        )
        .await
        .map_err(|e| DeployError::ServiceError(format!("Failed to run wevtutil: {}", e)))?;

        if !output.success() {
            return Err(DeployError::ServiceError(format!(
                "wevtutil failed ({})",
                output.describe()
            )));
        }

        // Newest first from wevtutil; callers expect oldest first.
        let mut events: Vec<String> = output
            .stdout
            .split("Event[")
            .map(|event| event.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|event| !event.is_empty())
            .collect();
        events.reverse();
        Ok(events)
    }
}
