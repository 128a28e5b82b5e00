//! Restore the last known-good configuration

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::deploy::record::DeploymentRecord;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::services::ServiceManager;
use crate::storage::backup::{self, ConfigBackup};

pub struct RollbackManager {
    services: Arc<dyn ServiceManager>,
}

impl RollbackManager {
    pub fn new(services: Arc<dyn ServiceManager>) -> Self {
        Self { services }
    }

    /// Restore the configuration of `record` and restart its service
    pub async fn rollback(&self, record: &DeploymentRecord) -> Result<ConfigBackup, DeployError> {
        self.restore(&record.config_path, record.service_name.as_deref())
            .await
    }

    /// Overwrite `config_path` with the exact bytes of its most recent backup,
    /// then restart `service_name` when given
    pub async fn restore(&self, config_path: &Path, service_name: Option<&str>) -> Result<ConfigBackup, DeployError> {
        let latest = backup::latest_backup(config_path)
            .await?
            .ok_or_else(|| DeployError::NoBackupError(format!("No backup of {:?}", config_path)))?;

        let contents = File::new(&latest.backup_path).read_bytes().await?;
        let live = File::new(config_path);
        live.write_atomic(&contents).await?;
        live.set_permissions_600().await?;
        info!("Restored {:?} from {:?}", config_path, latest.backup_path);

        if let Some(name) = service_name {
            self.services.restart(name).await?;
        }
        Ok(latest)
    }
}
