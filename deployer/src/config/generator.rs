//! Baseline generation via the server binary, then targeted patches

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::patch::{get_section_value, replace_list_port, set_section_value};
use crate::config::ConfigOverrides;
use crate::errors::DeployError;
use crate::exec::COMMAND_TIMEOUT;
use crate::filesys::file::File;
use crate::managed::ManagedBinary;
use crate::storage::backup::{self, ConfigBackup};

/// What a generation run did
#[derive(Debug, Clone)]
pub struct GenerateReport {
    pub config_path: PathBuf,

    /// Backup of the file that was replaced, if one existed
    pub backup: Option<ConfigBackup>,
}

/// Produces the live server configuration
#[derive(Debug, Clone)]
pub struct ConfigGenerator {
    command_timeout: Duration,
}

impl Default for ConfigGenerator {
    fn default() -> Self {
        Self {
            command_timeout: COMMAND_TIMEOUT,
        }
    }
}

impl ConfigGenerator {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    /// Generate a baseline with the binary, patch `overrides` into it, write
    /// it to `config_path` and validate it with the binary.
    ///
    /// Any file already at `config_path` is backed up before the first write.
    pub async fn generate(
        &self,
        binary_path: &Path,
        config_path: &Path,
        overrides: &ConfigOverrides,
    ) -> Result<GenerateReport, DeployError> {
        let binary = ManagedBinary::new(binary_path).with_timeout(self.command_timeout);
        let config_file = File::new(config_path);

        let backup = backup::create_backup(config_path).await?;
        let before = match &backup {
            Some(_) => Some(config_file.read_bytes().await?),
            None => None,
        };

        info!("Generating baseline configuration at {:?}", config_path);
        let output = binary
            .generate_config(config_path)
            .await
            .map_err(|e| DeployError::ConfigurationError(e.to_string()))?;
        if !output.success() {
            return Err(DeployError::ConfigurationError(format!(
                "config generate failed ({})",
                output.describe()
            )));
        }

        // The binary either prints the configuration or writes it in place.
        let after = if config_file.exists().await {
            Some(config_file.read_bytes().await?)
        } else {
            None
        };
        let baseline = match after {
            Some(bytes) if Some(&bytes) != before.as_ref() => String::from_utf8(bytes)
                .map_err(|_| DeployError::ConfigurationError("Generated configuration is not UTF-8".to_string()))?,
            _ => output.stdout,
        };
        if baseline.trim().is_empty() {
            return Err(DeployError::ConfigurationError(
                "config generate produced no configuration".to_string(),
            ));
        }

        let patched = apply_overrides(&baseline, overrides)?;
        config_file.write_atomic(patched.as_bytes()).await?;
        config_file.set_permissions_600().await?;
        debug!("Wrote patched configuration ({} bytes)", patched.len());

        self.validate(&binary, config_path).await?;
        info!("Configuration validated: {:?}", config_path);

        Ok(GenerateReport {
            config_path: config_path.to_path_buf(),
            backup,
        })
    }

    async fn validate(&self, binary: &ManagedBinary, config_path: &Path) -> Result<(), DeployError> {
        let output = binary
            .show_config(config_path)
            .await
            .map_err(|e| DeployError::ConfigurationError(e.to_string()))?;
        if !output.success() {
            return Err(DeployError::ConfigurationError(format!(
                "config show rejected {:?} ({})",
                config_path,
                output.describe()
            )));
        }
        Ok(())
    }
}

/// Apply `overrides` to a configuration text
pub fn apply_overrides(text: &str, overrides: &ConfigOverrides) -> Result<String, DeployError> {
    let mut text = text.to_string();

    if let Some(path) = &overrides.datastore_path {
        text = set_section_value(&text, "Datastore", "location", &path.to_string_lossy())?;
    }
    if let Some(path) = &overrides.filestore_path {
        text = set_section_value(&text, "Datastore", "filestore_directory", &path.to_string_lossy())?;
    }
    if let Some(address) = &overrides.gui_bind_address {
        text = set_section_value(&text, "GUI", "bind_address", address)?;
    }
    if let Some(port) = overrides.gui_port {
        text = set_section_value(&text, "GUI", "bind_port", &port.to_string())?;
    }
    if let Some(port) = overrides.frontend_port {
        let previous = get_section_value(&text, "Frontend", "bind_port").and_then(|v| v.parse::<u16>().ok());
        text = set_section_value(&text, "Frontend", "bind_port", &port.to_string())?;
        if let Some(previous) = previous.filter(|p| *p != port) {
            text = replace_list_port(&text, "Client", "server_urls", previous, port);
        }
    }

    Ok(text)
}
