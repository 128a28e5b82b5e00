//! Directories the deployer creates or scans

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::DeployError;

#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// False for a missing path and for a path that is not a directory
    pub async fn exists(&self) -> bool {
        matches!(fs::metadata(&self.path).await, Ok(meta) if meta.is_dir())
    }

    /// `mkdir -p`
    pub async fn create(&self) -> Result<(), DeployError> {
        Ok(fs::create_dir_all(&self.path).await?)
    }

    /// Names of the regular files directly inside, in no particular order
    pub async fn list_file_names(&self) -> Result<Vec<String>, DeployError> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }
}
