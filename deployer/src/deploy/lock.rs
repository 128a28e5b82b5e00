//! Advisory deployment lock
//!
//! A lock file inside the install directory, created with `create_new` and
//! holding the owner's PID. The lock is released on drop, which also removes
//! any directories acquiring it had to create, so an attempt that fails
//! before writing anything leaves the filesystem as it found it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::storage::layout::InstallTarget;

/// Age after which a lock file without a readable PID counts as abandoned
pub const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(10);

/// Exclusive claim on an install target
#[derive(Debug)]
pub struct DeployLock {
    path: PathBuf,

    /// Directories created to hold the lock, deepest first
    created_dirs: Vec<PathBuf>,
}

impl DeployLock {
    /// Take the lock for `target`, failing fast when another live process
    /// holds it. A lock left by a dead process, or one without a PID older
    /// than [`UNREADABLE_LOCK_GRACE`], is reclaimed once.
    pub async fn acquire(target: &InstallTarget) -> Result<Self, DeployError> {
        let install_dir = target.install_dir();
        let created_dirs = missing_ancestors(install_dir);
        fs::create_dir_all(install_dir).await?;

        let path = target.lock_path();
        let result: Result<(), DeployError> = async {
            if try_create(&path).await? {
                return Ok(());
            }
            let holder = read_holder(&path).await;
            let stale = match holder {
                Some(pid) => !pid_alive(pid),
                // Holder crashed before writing its PID, or is still writing it
                None => lock_age(&path).await.is_some_and(|age| age >= UNREADABLE_LOCK_GRACE),
            };
            if !stale {
                return Err(contention(&path, holder));
            }

            warn!("Reclaiming stale lock {:?} ({})", path, describe_holder(holder));
            fs::remove_file(&path).await?;
            if try_create(&path).await? {
                Ok(())
            } else {
                Err(contention(&path, None))
            }
        }
        .await;

        match result {
            Ok(()) => {
                info!("Acquired deployment lock {:?}", path);
                Ok(Self { path, created_dirs })
            }
            Err(e) => {
                remove_empty_dirs(&created_dirs);
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Released deployment lock {:?}", self.path),
            Err(e) => warn!("Failed to remove lock {:?}: {}", self.path, e),
        }
        remove_empty_dirs(&self.created_dirs);
    }
}

async fn try_create(path: &Path) -> Result<bool, DeployError> {
    let created = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;

    let mut file = match created {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    file.write_all(std::process::id().to_string().as_bytes()).await?;
    file.sync_all().await?;
    Ok(true)
}

/// Remove `dirs` deepest first, stopping at the first one that is not empty
fn remove_empty_dirs(dirs: &[PathBuf]) {
    for dir in dirs {
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
    }
}

fn contention(path: &Path, holder: Option<u32>) -> DeployError {
    DeployError::LockContentionError(format!("{:?} is held by {}", path, describe_holder(holder)))
}

fn describe_holder(holder: Option<u32>) -> String {
    holder
        .map(|pid| format!("pid {}", pid))
        .unwrap_or_else(|| "another process".to_string())
}

async fn lock_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).await.ok()?.modified().ok()?.elapsed().ok()
}

async fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).await.ok()?.trim().parse().ok()
}

fn pid_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

/// `dir` and each of its ancestors that does not exist yet, deepest first
fn missing_ancestors(dir: &Path) -> Vec<PathBuf> {
    dir.ancestors()
        .take_while(|ancestor| !ancestor.as_os_str().is_empty() && !ancestor.exists())
        .map(Path::to_path_buf)
        .collect()
}
