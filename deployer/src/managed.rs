//! Command-line surface of the managed server binary

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::errors::DeployError;
use crate::exec::{self, CommandOutput, COMMAND_TIMEOUT};

/// Handle on an installed server binary
#[derive(Debug, Clone)]
pub struct ManagedBinary {
    path: PathBuf,
    timeout: Duration,
}

impl ManagedBinary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Arguments that run the server in the foreground
    pub fn frontend_args(config_path: &Path) -> Vec<OsString> {
        vec![
            OsString::from("--config"),
            config_path.as_os_str().to_owned(),
            OsString::from("frontend"),
        ]
    }

    /// Full command line for service managers that take a single string
    pub fn frontend_command_line(&self, config_path: &Path) -> String {
        format!(
            "\"{}\" --config \"{}\" frontend",
            self.path.display(),
            config_path.display()
        )
    }

    /// `version`
    pub async fn version(&self) -> Result<CommandOutput, DeployError> {
        self.run(vec![OsString::from("version")]).await
    }

    /// `config generate --config <path>`
    pub async fn generate_config(&self, config_path: &Path) -> Result<CommandOutput, DeployError> {
        self.run(vec![
            "config".into(),
            "generate".into(),
            "--config".into(),
            config_path.as_os_str().to_owned(),
        ])
        .await
    }

    /// `config show --config <path>`, used as validation
    pub async fn show_config(&self, config_path: &Path) -> Result<CommandOutput, DeployError> {
        self.run(vec![
            "config".into(),
            "show".into(),
            "--config".into(),
            config_path.as_os_str().to_owned(),
        ])
        .await
    }

    /// `user add <name> --password <secret> --role administrator --config <path>`
    pub async fn add_admin_user(
        &self,
        username: &str,
        secret: &SecretString,
        config_path: &Path,
    ) -> Result<CommandOutput, DeployError> {
        self.run(vec![
            "user".into(),
            "add".into(),
            username.into(),
            "--password".into(),
            secret.expose_secret().into(),
            "--role".into(),
            "administrator".into(),
            "--config".into(),
            config_path.as_os_str().to_owned(),
        ])
        .await
    }

    /// `user show <name> --config <path>`
    pub async fn show_user(&self, username: &str, config_path: &Path) -> Result<CommandOutput, DeployError> {
        self.run(vec![
            "user".into(),
            "show".into(),
            username.into(),
            "--config".into(),
            config_path.as_os_str().to_owned(),
        ])
        .await
    }

    async fn run(&self, args: Vec<OsString>) -> Result<CommandOutput, DeployError> {
        let program = self.path.to_string_lossy();
        exec::run(&program, args, self.timeout).await.map_err(|e| {
            DeployError::ProcessError(format!("Failed to run {}: {}", self.path.display(), e))
        })
    }
}
