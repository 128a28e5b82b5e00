//! Server configuration generation and patching

pub mod generator;
pub mod patch;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Exposure of the administrative GUI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// GUI listens on all interfaces
    #[default]
    Standard,

    /// GUI listens on loopback only
    Strict,
}

impl SecurityLevel {
    pub fn gui_bind_address(&self) -> &'static str {
        match self {
            SecurityLevel::Standard => "0.0.0.0",
            SecurityLevel::Strict => "127.0.0.1",
        }
    }
}

/// The fields of the live server configuration this tool owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub gui_port: u16,
    pub frontend_port: u16,
    pub datastore_path: PathBuf,
    pub filestore_path: PathBuf,
    pub security_level: SecurityLevel,
}

/// Fields to patch into a generated configuration; `None` leaves the
/// generated value alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub gui_port: Option<u16>,
    pub frontend_port: Option<u16>,
    pub datastore_path: Option<PathBuf>,
    pub filestore_path: Option<PathBuf>,
    pub gui_bind_address: Option<String>,
}

impl From<&ServiceConfig> for ConfigOverrides {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            gui_port: Some(config.gui_port),
            frontend_port: Some(config.frontend_port),
            datastore_path: Some(config.datastore_path.clone()),
            filestore_path: Some(config.filestore_path.clone()),
            gui_bind_address: Some(config.security_level.gui_bind_address().to_string()),
        }
    }
}
