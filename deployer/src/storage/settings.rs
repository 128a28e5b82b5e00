//! Settings file management

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::deploy::profile::EnvironmentProfile;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::utils::{CooldownOptions, RetryPolicy};

/// Deployer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Directory for rolling JSON log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Emit JSON on stderr instead of human-readable lines
    #[serde(default)]
    pub json_logs: bool,

    /// Release feed configuration
    #[serde(default)]
    pub release: ReleaseFeedSettings,

    /// Retry policy for downloads and feed queries
    #[serde(default)]
    pub retry: RetrySettings,

    /// Named environment profiles; built-in profiles fill the gaps
    #[serde(default)]
    pub profiles: BTreeMap<String, EnvironmentProfile>,
}

impl Settings {
    /// Load settings from `path`, or the defaults when no path is given
    pub async fn load(path: Option<&Path>) -> Result<Self, DeployError> {
        match path {
            Some(path) => {
                let settings: Settings = File::new(path).read_json().await?;
                info!("Loaded settings from {:?}", path);
                Ok(settings)
            }
            None => Ok(Settings::default()),
        }
    }

    /// Look up a profile by name, falling back to the built-in profiles
    pub fn profile(&self, name: &str) -> Option<EnvironmentProfile> {
        self.profiles
            .get(name)
            .cloned()
            .map(|mut profile| {
                profile.name = name.to_string();
                profile
            })
            .or_else(|| EnvironmentProfile::builtin(name))
    }
}

/// Release feed settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseFeedSettings {
    /// Base URL of the releases API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Repository in `owner/name` form
    #[serde(default = "default_repo")]
    pub repo: String,

    /// Pin a release tag instead of following the latest release
    #[serde(default)]
    pub version: Option<String>,

    /// Timeout for metadata requests in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for a single artifact download in seconds
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_repo() -> String {
    "Velocidex/velociraptor".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    600
}

impl Default for ReleaseFeedSettings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            repo: default_repo(),
            version: None,
            request_timeout_secs: default_request_timeout(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    2
}

fn default_max_delay() -> u64 {
    30
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            cooldown: CooldownOptions {
                base_delay: Duration::from_secs(self.base_delay_secs),
                max_delay: Duration::from_secs(self.max_delay_secs),
                multiplier: self.multiplier,
            },
        }
    }
}
