//! Configuration backups
//!
//! Backups are `<config>.backup.<timestamp>` siblings of the live file. They
//! are created with `create_new` and never rewritten, so the history is
//! append-only. Timestamps are fixed-width, which makes lexical order equal
//! to chronological order.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

const BACKUP_MARKER: &str = ".backup.";
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%6f";

/// A point-in-time copy of a configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigBackup {
    pub source_path: PathBuf,
    pub backup_path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

/// Copy `source` to a new timestamped sibling.
///
/// Returns `None` when there is nothing to back up.
pub async fn create_backup(source: &Path) -> Result<Option<ConfigBackup>, DeployError> {
    let source_file = File::new(source);
    if !source_file.exists().await {
        return Ok(None);
    }
    let contents = source_file.read_bytes().await?;

    // Two backups within the same microsecond collide on name; retry with a
    // fresh timestamp rather than overwrite.
    for _ in 0..16 {
        let timestamp = Utc::now();
        let backup_path = source_file.sibling(&format!(
            "backup.{}",
            timestamp.format(TIMESTAMP_FORMAT)
        ));

        let created = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&backup_path)
            .await;
        let mut file = match created {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&contents).await?;
        file.sync_all().await?;

        info!("Backed up {:?} to {:?}", source, backup_path);
        return Ok(Some(ConfigBackup {
            source_path: source.to_path_buf(),
            backup_path,
            timestamp,
        }));
    }

    Err(DeployError::ConfigurationError(format!(
        "Unable to allocate a unique backup name for {:?}",
        source
    )))
}

/// All backups of `source`, oldest first
pub async fn list_backups(source: &Path) -> Result<Vec<ConfigBackup>, DeployError> {
    let (Some(parent), Some(file_name)) = (source.parent(), source.file_name()) else {
        return Ok(Vec::new());
    };
    let dir = Dir::new(parent);
    if !dir.exists().await {
        return Ok(Vec::new());
    }

    let prefix = format!("{}{}", file_name.to_string_lossy(), BACKUP_MARKER);
    let mut backups: Vec<ConfigBackup> = dir
        .list_file_names()
        .await?
        .into_iter()
        .filter_map(|name| {
            let stamp = name.strip_prefix(&prefix)?;
            let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
            Some(ConfigBackup {
                source_path: source.to_path_buf(),
                backup_path: parent.join(&name),
                timestamp: naive.and_utc(),
            })
        })
        .collect();

    backups.sort_by(|a, b| a.backup_path.cmp(&b.backup_path));
    Ok(backups)
}

/// The most recent backup of `source`, if any
pub async fn latest_backup(source: &Path) -> Result<Option<ConfigBackup>, DeployError> {
    Ok(list_backups(source).await?.pop())
}
