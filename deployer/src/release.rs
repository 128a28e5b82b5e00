//! Release feed resolution

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::DeployError;

/// Asset name fragments that mark variants unsuitable for a server install
const EXCLUDED_VARIANTS: &[&str] = &["debug", "collector"];

/// Packaging formats that are not a bare executable
const EXCLUDED_EXTENSIONS: &[&str] = &[".sig", ".msi", ".deb", ".rpm", ".pkg", ".zip", ".tar.gz"];

/// A downloadable server build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub version: String,
    pub download_url: String,
    pub size_bytes: u64,
    pub asset_name: String,
}

/// Release metadata as returned by the feed
#[derive(Debug, Clone, Deserialize)]
pub struct FeedRelease {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<FeedAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

/// Operating system as named in asset file names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    Darwin,
}

impl Platform {
    pub fn detect() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Darwin
        } else {
            Platform::Linux
        }
    }

    pub fn feed_token(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::Darwin => "darwin",
        }
    }
}

/// CPU architecture as named in asset file names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
    X86,
}

impl Arch {
    pub fn detect() -> Self {
        match std::env::consts::ARCH {
            "aarch64" => Arch::Arm64,
            "x86" => Arch::X86,
            _ => Arch::Amd64,
        }
    }

    pub fn feed_token(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::X86 => "386",
        }
    }
}

/// Pick the first asset in feed order that fits the platform
pub fn select_asset(release: &FeedRelease, platform: Platform, arch: Arch) -> Option<ReleaseAsset> {
    release
        .assets
        .iter()
        .find(|asset| {
            let name = asset.name.to_lowercase();
            name.contains(platform.feed_token())
                && name.contains(arch.feed_token())
                && !EXCLUDED_VARIANTS.iter().any(|v| name.contains(v))
                && !EXCLUDED_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
        })
        .map(|asset| ReleaseAsset {
            version: release.tag_name.clone(),
            download_url: asset.browser_download_url.clone(),
            size_bytes: asset.size,
            asset_name: asset.name.clone(),
        })
}

/// Client for the release feed
#[derive(Debug, Clone)]
pub struct ReleaseResolver {
    client: Client,
    api_base_url: String,
}

impl ReleaseResolver {
    pub fn new(api_base_url: &str, timeout: Duration) -> Result<Self, DeployError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("velodeploy/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolve the newest matching asset of `repo_id` (`owner/name`)
    pub async fn resolve(&self, repo_id: &str, platform: Platform, arch: Arch) -> Result<ReleaseAsset, DeployError> {
        self.resolve_tag(repo_id, None, platform, arch).await
    }

    /// Resolve against a pinned tag, or the latest release when `tag` is `None`
    pub async fn resolve_tag(
        &self,
        repo_id: &str,
        tag: Option<&str>,
        platform: Platform,
        arch: Arch,
    ) -> Result<ReleaseAsset, DeployError> {
        let url = match tag {
            Some(tag) => format!("{}/repos/{}/releases/tags/{}", self.api_base_url, repo_id, tag),
            None => format!("{}/repos/{}/releases/latest", self.api_base_url, repo_id),
        };
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| DeployError::TransportError(format!("Release feed request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DeployError::NotFoundError(format!("No release found at {}", url)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeployError::TransportError(format!(
                "Release feed returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let release: FeedRelease = response
            .json()
            .await
            .map_err(|e| DeployError::TransportError(format!("Invalid release metadata: {}", e)))?;

        let asset = select_asset(&release, platform, arch).ok_or_else(|| {
            DeployError::NotFoundError(format!(
                "Release {} has no {}-{} asset",
                release.tag_name,
                platform.feed_token(),
                arch.feed_token()
            ))
        })?;

        info!(
            "Resolved {} {} ({} bytes)",
            asset.asset_name, asset.version, asset.size_bytes
        );
        Ok(asset)
    }
}
