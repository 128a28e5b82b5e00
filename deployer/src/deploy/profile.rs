//! Environment profiles

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{SecurityLevel, ServiceConfig};
use crate::services::{PlatformKind, ServiceDescriptor};
use crate::storage::layout::InstallTarget;

const GIB: u64 = 1024 * 1024 * 1024;

/// Free disk space an environment needs at its data directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    #[default]
    Medium,
    Large,
}

impl SizeClass {
    pub fn min_free_bytes(&self) -> u64 {
        match self {
            SizeClass::Small => 2 * GIB,
            SizeClass::Medium => 20 * GIB,
            SizeClass::Large => 100 * GIB,
        }
    }
}

/// How the server is kept running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Registered with the platform service manager
    #[default]
    Service,

    /// Child of this process, in the foreground
    Direct,
}

/// Everything that differs between environments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentProfile {
    /// Set from the settings key when loaded from a file
    pub name: String,

    /// Roll back automatically on failure
    pub production: bool,
    pub size_class: SizeClass,
    pub install_dir: PathBuf,
    pub data_dir: PathBuf,
    pub service_name: String,
    pub gui_port: u16,
    pub frontend_port: u16,

    /// Ports opened and checked in addition to the GUI and frontend ports
    pub extra_ports: Vec<u16>,
    pub security_level: SecurityLevel,
    pub admin_username: String,
    pub launch_mode: LaunchMode,
    pub auto_start: bool,
    pub run_as_user: Option<String>,
    pub readiness_timeout_secs: u64,

    /// `https` for the server's self-signed GUI
    pub readiness_scheme: String,
    pub force_download: bool,
    pub smoke_test: bool,
    pub require_elevation: bool,
    pub manage_firewall: bool,
}

impl Default for EnvironmentProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            production: false,
            size_class: SizeClass::default(),
            install_dir: default_install_dir(),
            data_dir: default_data_dir(),
            service_name: default_service_name().to_string(),
            gui_port: 8889,
            frontend_port: 8000,
            extra_ports: Vec::new(),
            security_level: SecurityLevel::default(),
            admin_username: "admin".to_string(),
            launch_mode: LaunchMode::default(),
            auto_start: true,
            run_as_user: None,
            readiness_timeout_secs: 120,
            readiness_scheme: "https".to_string(),
            force_download: false,
            smoke_test: true,
            require_elevation: true,
            manage_firewall: true,
        }
    }
}

fn default_install_dir() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Program Files\Velociraptor")
    } else if cfg!(target_os = "macos") {
        PathBuf::from("/usr/local/velociraptor")
    } else {
        PathBuf::from("/opt/velociraptor")
    }
}

fn default_data_dir() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\Velociraptor")
    } else if cfg!(target_os = "macos") {
        PathBuf::from("/usr/local/var/velociraptor")
    } else {
        PathBuf::from("/var/lib/velociraptor")
    }
}

fn default_service_name() -> &'static str {
    if cfg!(target_os = "macos") {
        "com.velocidex.velociraptor"
    } else {
        "velociraptor"
    }
}

impl EnvironmentProfile {
    /// `development`, `staging` or `production`
    pub fn builtin(name: &str) -> Option<Self> {
        let base = Self {
            name: name.to_string(),
            ..Self::default()
        };
        match name {
            "development" => Some(Self {
                size_class: SizeClass::Small,
                launch_mode: LaunchMode::Direct,
                readiness_timeout_secs: 60,
                require_elevation: false,
                manage_firewall: false,
                ..base
            }),
            "staging" => Some(base),
            "production" => Some(Self {
                production: true,
                size_class: SizeClass::Large,
                security_level: SecurityLevel::Strict,
                readiness_timeout_secs: 300,
                ..base
            }),
            _ => None,
        }
    }

    /// GUI, frontend and extra ports, deduplicated, in that order
    pub fn required_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.gui_port, self.frontend_port];
        for port in &self.extra_ports {
            if !ports.contains(port) {
                ports.push(*port);
            }
        }
        ports.dedup();
        ports
    }

    pub fn install_target(&self) -> InstallTarget {
        InstallTarget::new(&self.install_dir, &self.data_dir)
    }

    pub fn service_config(&self, target: &InstallTarget) -> ServiceConfig {
        ServiceConfig {
            gui_port: self.gui_port,
            frontend_port: self.frontend_port,
            datastore_path: target.datastore_dir().path().to_path_buf(),
            filestore_path: target.filestore_dir().path().to_path_buf(),
            security_level: self.security_level,
        }
    }

    /// One firewall rule per (environment, port)
    pub fn firewall_rule_name(&self, port: u16) -> String {
        format!("{}-{}-tcp-{}", self.service_name, self.name, port)
    }

    pub fn service_descriptor(&self, target: &InstallTarget, platform_kind: PlatformKind) -> ServiceDescriptor {
        ServiceDescriptor {
            name: self.service_name.clone(),
            platform_kind,
            run_as_user: self.run_as_user.clone(),
            working_directory: target.install_dir.clone(),
            binary_path: target.binary_path.clone(),
            config_path: target.config_path(),
            data_dir: target.data_dir.clone(),
            auto_start: self.auto_start,
            description: format!("Velociraptor server ({})", self.name),
        }
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}
