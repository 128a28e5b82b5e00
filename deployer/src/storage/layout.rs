//! Install target layout

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Name of the live server configuration inside the install directory
pub const CONFIG_FILE_NAME: &str = "server.config.yaml";

/// Advisory lock held for the duration of a deployment
pub const LOCK_FILE_NAME: &str = ".velodeploy.lock";

/// Name of the managed binary on this platform
pub fn default_binary_name() -> &'static str {
    if cfg!(windows) {
        "velociraptor.exe"
    } else {
        "velociraptor"
    }
}

/// Where one deployment lives on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallTarget {
    /// Directory holding the binary and its configuration
    pub install_dir: PathBuf,

    /// Root for the datastore and filestore subtrees
    pub data_dir: PathBuf,

    /// Full path of the managed binary
    pub binary_path: PathBuf,
}

impl InstallTarget {
    /// Create a target with the platform's binary name inside `install_dir`
    pub fn new(install_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        let install_dir = install_dir.into();
        let binary_path = install_dir.join(default_binary_name());
        Self {
            install_dir,
            data_dir: data_dir.into(),
            binary_path,
        }
    }

    pub fn binary_file(&self) -> File {
        File::new(&self.binary_path)
    }

    pub fn config_path(&self) -> PathBuf {
        self.install_dir.join(CONFIG_FILE_NAME)
    }

    pub fn datastore_dir(&self) -> Dir {
        Dir::new(self.data_dir.join("datastore"))
    }

    pub fn filestore_dir(&self) -> Dir {
        Dir::new(self.data_dir.join("filestore"))
    }

    /// Directory for service stdout/stderr where the platform needs files
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.data_dir.join("logs"))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.install_dir.join(LOCK_FILE_NAME)
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Create every directory the deployment writes into
    pub async fn setup(&self) -> Result<(), DeployError> {
        Dir::new(&self.install_dir).create().await?;
        self.datastore_dir().create().await?;
        self.filestore_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}
