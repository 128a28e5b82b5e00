//! Binary download and installation

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::managed::ManagedBinary;
use crate::release::ReleaseAsset;
use crate::utils::{retry, sha256_file, RetryPolicy};

/// Allowed difference between the advertised and the downloaded size
pub const SIZE_TOLERANCE_BYTES: u64 = 1024;

/// Suffix of the in-flight download next to the destination
pub const DOWNLOAD_SUFFIX: &str = "download";

const SMOKE_TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of the post-install `version` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmokeTest {
    Passed(String),
    Failed(String),
    NotRun,
}

/// What `install` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Destination already present and `force` was not set
    Skipped,

    Installed { sha256: String, smoke_test: SmokeTest },
}

/// Removes the temporary download unless disarmed, including when the
/// owning future is dropped mid-download
#[derive(Debug)]
struct DownloadGuard {
    path: PathBuf,
    armed: bool,
}

impl DownloadGuard {
    fn new(dest: &Path) -> Self {
        Self {
            path: File::new(dest).sibling(DOWNLOAD_SUFFIX),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        if self.armed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("Removed partial download {:?}", self.path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove partial download {:?}: {}", self.path, e),
            }
        }
    }
}

/// Downloads and installs the server binary
#[derive(Debug, Clone)]
pub struct ArtifactInstaller {
    client: Client,
    retry: RetryPolicy,
    smoke_test: bool,
}

impl ArtifactInstaller {
    pub fn new(download_timeout: Duration, retry: RetryPolicy) -> Result<Self, DeployError> {
        let client = Client::builder()
            .timeout(download_timeout)
            .user_agent(concat!("velodeploy/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            retry,
            smoke_test: true,
        })
    }

    /// Run `<binary> version` after installing
    pub fn with_smoke_test(mut self, enabled: bool) -> Self {
        self.smoke_test = enabled;
        self
    }

    /// Install `asset` at `dest_path`.
    ///
    /// Without `force` an existing destination is left alone and nothing is
    /// downloaded. Otherwise this is [`stage`](Self::stage) followed by
    /// [`StagedBinary::commit`].
    pub async fn install(&self, asset: &ReleaseAsset, dest_path: &Path, force: bool) -> Result<InstallOutcome, DeployError> {
        if !force && File::new(dest_path).exists().await {
            info!("{:?} already installed, skipping download", dest_path);
            return Ok(InstallOutcome::Skipped);
        }
        self.stage(asset, dest_path).await?.commit().await
    }

    /// Download and verify `asset` into `<dest>.download`, leaving the
    /// destination untouched. Dropping the returned value without committing
    /// removes the download.
    pub async fn stage(&self, asset: &ReleaseAsset, dest_path: &Path) -> Result<StagedBinary, DeployError> {
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let guard = DownloadGuard::new(dest_path);
        let temp_path = guard.path.as_path();

        info!("Downloading {} from {}", asset.asset_name, asset.download_url);
        retry(&self.retry, "Download", move |_| self.download_and_verify(asset, temp_path)).await?;
        File::new(temp_path).set_executable().await?;

        Ok(StagedBinary {
            guard,
            dest_path: dest_path.to_path_buf(),
            smoke_test: self.smoke_test,
        })
    }

    async fn download_and_verify(&self, asset: &ReleaseAsset, temp_path: &Path) -> Result<(), DeployError> {
        let mut response = self
            .client
            .get(&asset.download_url)
            .send()
            .await
            .map_err(|e| DeployError::DownloadError(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(DeployError::DownloadError(format!(
                "{} returned {}",
                asset.download_url,
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(temp_path).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| DeployError::DownloadError(format!("Transfer interrupted: {}", e)))?
        {
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);

        verify_download(temp_path, asset.size_bytes).await?;
        Ok(())
    }
}

/// A verified download waiting to replace its destination
#[derive(Debug)]
pub struct StagedBinary {
    guard: DownloadGuard,
    dest_path: PathBuf,
    smoke_test: bool,
}

impl StagedBinary {
    /// Rename the download over the destination, then hash and smoke-test it
    pub async fn commit(mut self) -> Result<InstallOutcome, DeployError> {
        let dest_path = self.dest_path.as_path();
        tokio::fs::rename(&self.guard.path, dest_path).await?;
        self.guard.disarm();

        let sha256 = sha256_file(dest_path).await?;
        info!("Installed {:?} (sha256 {})", dest_path, sha256);

        let smoke_test = if self.smoke_test {
            smoke_test(dest_path).await
        } else {
            SmokeTest::NotRun
        };
        Ok(InstallOutcome::Installed { sha256, smoke_test })
    }
}

async fn smoke_test(binary_path: &Path) -> SmokeTest {
    let binary = ManagedBinary::new(binary_path).with_timeout(SMOKE_TEST_TIMEOUT);
    match binary.version().await {
        Ok(output) if output.success() => {
            let version = output.stdout.lines().next().unwrap_or("").trim().to_string();
            debug!("Smoke test passed: {}", version);
            SmokeTest::Passed(version)
        }
        Ok(output) => {
            warn!("Smoke test failed: {}", output.describe());
            SmokeTest::Failed(output.describe())
        }
        Err(e) => {
            warn!("Smoke test could not run: {}", e);
            SmokeTest::Failed(e.to_string())
        }
    }
}

/// Check a finished download is non-empty and close to the advertised size.
/// An advertised size of zero means unknown and skips the size comparison.
pub async fn verify_download(path: &Path, expected_size: u64) -> Result<u64, DeployError> {
    let actual = File::new(path).len().await?;
    if actual == 0 {
        return Err(DeployError::VerificationError(format!("{:?} is empty", path)));
    }
    if expected_size > 0 && actual.abs_diff(expected_size) > SIZE_TOLERANCE_BYTES {
        return Err(DeployError::VerificationError(format!(
            "{:?} is {} bytes, expected {}",
            path, actual, expected_size
        )));
    }
    Ok(actual)
}
