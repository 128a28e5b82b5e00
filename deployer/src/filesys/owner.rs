//! Handing deployment files to the account a service runs as
//!
//! On Unix a service configured with `run_as_user` must be able to read its
//! configuration and write its data directory. Elsewhere the service manager
//! owns account handling and these are no-ops.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::DeployError;

/// A local account resolved by name. The ids are only meaningful on Unix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl Account {
    /// Resolve `name`; an unknown account is a `ConfigurationError`
    #[cfg(unix)]
    pub fn lookup(name: &str) -> Result<Self, DeployError> {
        let user = users::get_user_by_name(name)
            .ok_or_else(|| DeployError::ConfigurationError(format!("Unknown account '{}'", name)))?;
        Ok(Self {
            name: name.to_string(),
            uid: user.uid(),
            gid: user.primary_group_id(),
        })
    }

    #[cfg(not(unix))]
    pub fn lookup(name: &str) -> Result<Self, DeployError> {
        Ok(Self {
            name: name.to_string(),
            uid: 0,
            gid: 0,
        })
    }
}

/// Give `paths`, and everything below the directories among them, to
/// `account`. Symlinks are re-owned but not followed.
pub async fn hand_over(paths: &[PathBuf], account: &Account) -> Result<(), DeployError> {
    #[cfg(unix)]
    {
        let owned = paths.to_vec();
        let (uid, gid) = (account.uid, account.gid);
        tokio::task::spawn_blocking(move || owned.iter().try_for_each(|path| chown_tree(path, uid, gid)))
            .await
            .map_err(std::io::Error::other)??;
        info!("Handed {:?} over to {}", paths, account.name);
    }
    #[cfg(not(unix))]
    {
        debug!("Ownership of {} path(s) left to the service manager", paths.len());
    }
    Ok(())
}

#[cfg(unix)]
fn chown_tree(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    debug!("chown {}:{} {:?}", uid, gid, path);
    Ok(())
}
