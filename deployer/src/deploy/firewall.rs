//! Inbound firewall rules

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::DeployError;
use crate::exec::{self, COMMAND_TIMEOUT};
use crate::services::PlatformKind;

/// Result of ensuring one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallChange {
    Created,
    AlreadyPresent,

    /// No supported firewall to manage on this host
    Unmanaged(String),
}

/// Idempotent inbound TCP allow rules
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn allow_tcp(&self, rule_name: &str, port: u16) -> Result<FirewallChange, DeployError>;
}

/// `netsh advfirewall`
#[derive(Debug, Clone, Default)]
pub struct NetshFirewall;

#[async_trait]
impl Firewall for NetshFirewall {
    async fn allow_tcp(&self, rule_name: &str, port: u16) -> Result<FirewallChange, DeployError> {
        let name = format!("name={}", rule_name);
        let show = exec::run(
            "netsh",
            ["advfirewall", "firewall", "show", "rule", name.as_str()],
            COMMAND_TIMEOUT,
        )
        .await?;
        if show.success() {
            debug!("Firewall rule {} already present", rule_name);
            return Ok(FirewallChange::AlreadyPresent);
        }

        let localport = format!("localport={}", port);
        let add = exec::run(
            "netsh",
            [
                "advfirewall",
                "firewall",
                "add",
                "rule",
                name.as_str(),
                "dir=in",
                "action=allow",
                "protocol=TCP",
                localport.as_str(),
            ],
            COMMAND_TIMEOUT,
        )
        .await?;
        if !add.success() {
            return Err(DeployError::ServiceError(format!(
                "netsh add rule {} failed ({})",
                rule_name,
                add.describe()
            )));
        }
        info!("Created firewall rule {} for tcp/{}", rule_name, port);
        Ok(FirewallChange::Created)
    }
}

/// `ufw` when installed, otherwise `firewall-cmd`. Rules are named on both:
/// a ufw comment, or a firewalld service of the same name.
#[derive(Debug, Clone, Default)]
pub struct LinuxFirewall;

impl LinuxFirewall {
    async fn ufw(&self, rule_name: &str, port: u16) -> Result<FirewallChange, DeployError> {
        let status = exec::run("ufw", ["status"], COMMAND_TIMEOUT).await?;
        if status.success() && ufw_has_rule(&status.stdout, rule_name) {
            debug!("ufw rule {} already present", rule_name);
            return Ok(FirewallChange::AlreadyPresent);
        }

        let port_proto = format!("{}/tcp", port);
        let output = exec::run("ufw", ["allow", port_proto.as_str(), "comment", rule_name], COMMAND_TIMEOUT).await?;
        if !output.success() {
            return Err(DeployError::ServiceError(format!(
                "ufw allow {} failed ({})",
                port_proto,
                output.describe()
            )));
        }
        // An unnamed rule for the same port already lets the traffic in
        if output.stdout.contains("Skipping") {
            info!("tcp/{} already allowed by ufw; {} not added", port, rule_name);
            Ok(FirewallChange::AlreadyPresent)
        } else {
            info!("Created ufw rule {} for tcp/{}", rule_name, port);
            Ok(FirewallChange::Created)
        }
    }

    async fn firewalld(&self, rule_name: &str, port: u16) -> Result<FirewallChange, DeployError> {
        let query = format!("--query-service={}", rule_name);
        if exec::run("firewall-cmd", ["--permanent", query.as_str()], COMMAND_TIMEOUT)
            .await?
            .success()
        {
            debug!("firewalld service {} already enabled", rule_name);
            return Ok(FirewallChange::AlreadyPresent);
        }

        // A run interrupted after defining the service leaves it defined but not enabled
        let info = format!("--info-service={}", rule_name);
        let defined = exec::run("firewall-cmd", ["--permanent", info.as_str()], COMMAND_TIMEOUT)
            .await?
            .success();

        for args in firewalld_commands(rule_name, port, defined) {
            let output = exec::run("firewall-cmd", &args, COMMAND_TIMEOUT).await?;
            if !output.success() {
                return Err(DeployError::ServiceError(format!(
                    "firewall-cmd {} failed ({})",
                    args.join(" "),
                    output.describe()
                )));
            }
        }
        info!("Created firewalld service {} for tcp/{}", rule_name, port);
        Ok(FirewallChange::Created)
    }
}

#[async_trait]
impl Firewall for LinuxFirewall {
    async fn allow_tcp(&self, rule_name: &str, port: u16) -> Result<FirewallChange, DeployError> {
        if which::which("ufw").is_ok() {
            self.ufw(rule_name, port).await
        } else if which::which("firewall-cmd").is_ok() {
            self.firewalld(rule_name, port).await
        } else {
            Ok(FirewallChange::Unmanaged(
                "neither ufw nor firewall-cmd is installed".to_string(),
            ))
        }
    }
}

/// Whether `ufw status` lists a rule commented `rule_name`
pub fn ufw_has_rule(status: &str, rule_name: &str) -> bool {
    status
        .lines()
        .filter_map(|line| line.split_once(" # "))
        .any(|(_, comment)| comment.trim() == rule_name)
}

/// `firewall-cmd` invocations that define `rule_name` as a service opening
/// `port`, enable it permanently and reload
pub fn firewalld_commands(rule_name: &str, port: u16, defined: bool) -> Vec<Vec<String>> {
    let mut commands = Vec::new();
    if !defined {
        commands.push(vec!["--permanent".to_string(), format!("--new-service={}", rule_name)]);
        commands.push(vec![
            "--permanent".to_string(),
            format!("--service={}", rule_name),
            format!("--add-port={}/tcp", port),
        ]);
    }
    commands.push(vec!["--permanent".to_string(), format!("--add-service={}", rule_name)]);
    commands.push(vec!["--reload".to_string()]);
    commands
}

/// Hosts whose firewall is left to the operator
#[derive(Debug, Clone)]
pub struct UnmanagedFirewall {
    reason: String,
}

impl UnmanagedFirewall {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Firewall for UnmanagedFirewall {
    async fn allow_tcp(&self, _rule_name: &str, _port: u16) -> Result<FirewallChange, DeployError> {
        Ok(FirewallChange::Unmanaged(self.reason.clone()))
    }
}

/// Firewall backend for the platform
pub fn firewall_for(kind: PlatformKind) -> Arc<dyn Firewall> {
    match kind {
        PlatformKind::WindowsScm => Arc::new(NetshFirewall),
        PlatformKind::Systemd => Arc::new(LinuxFirewall),
        PlatformKind::Launchd => Arc::new(UnmanagedFirewall::new(
            "the macOS application firewall is not managed",
        )),
    }
}
