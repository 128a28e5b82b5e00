//! Artifact installer tests

use std::time::Duration;

use velodeploy::errors::DeployError;
use velodeploy::installer::artifact::{ArtifactInstaller, InstallOutcome, SmokeTest};
use velodeploy::release::ReleaseAsset;
use velodeploy::utils::RetryPolicy;

const BODY_LEN: usize = 4096;

fn installer() -> ArtifactInstaller {
    ArtifactInstaller::new(Duration::from_secs(10), RetryPolicy::once())
        .unwrap()
        .with_smoke_test(false)
}

fn asset(server: &mockito::Server, size_bytes: u64) -> ReleaseAsset {
    ReleaseAsset {
        version: "v0.7.5".to_string(),
        download_url: format!("{}/download/velociraptor-v0.7.5-linux-amd64", server.url()),
        size_bytes,
        asset_name: "velociraptor-v0.7.5-linux-amd64".to_string(),
    }
}

fn leftovers(dir: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".download"))
        .collect()
}

#[tokio::test]
async fn test_install_downloads_once() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/download/velociraptor-v0.7.5-linux-amd64")
        .with_status(200)
        .with_body(vec![0x7fu8; BODY_LEN])
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bin").join("velociraptor");
    let asset = asset(&server, BODY_LEN as u64);
    let installer = installer();

    let first = installer.install(&asset, &dest, false).await.unwrap();
    match first {
        InstallOutcome::Installed { sha256, smoke_test } => {
            assert_eq!(sha256.len(), 64);
            assert_eq!(smoke_test, SmokeTest::NotRun);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), BODY_LEN as u64);

    let second = installer.install(&asset, &dest, false).await.unwrap();
    assert_eq!(second, InstallOutcome::Skipped);

    mock.assert_async().await;
    assert!(leftovers(dest.parent().unwrap()).is_empty());
}

#[tokio::test]
async fn test_size_within_tolerance_is_accepted() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/download/velociraptor-v0.7.5-linux-amd64")
        .with_body(vec![0u8; BODY_LEN])
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("velociraptor");
    let asset = asset(&server, BODY_LEN as u64 + 1000);

    let outcome = installer().install(&asset, &dest, false).await.unwrap();
    assert!(matches!(outcome, InstallOutcome::Installed { .. }));
}

#[tokio::test]
async fn test_size_mismatch_leaves_nothing_behind() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/download/velociraptor-v0.7.5-linux-amd64")
        .with_body(vec![0u8; BODY_LEN])
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("velociraptor");
    let asset = asset(&server, 10 * BODY_LEN as u64);

    let err = installer().install(&asset, &dest, false).await.unwrap_err();
    assert!(matches!(err, DeployError::VerificationError(_)));
    assert!(!dest.exists());
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_http_failure_leaves_existing_binary() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/download/velociraptor-v0.7.5-linux-amd64")
        .with_status(500)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("velociraptor");
    std::fs::write(&dest, b"previous build").unwrap();

    let err = installer()
        .install(&asset(&server, BODY_LEN as u64), &dest, true)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::DownloadError(_)));
    assert_eq!(std::fs::read(&dest).unwrap(), b"previous build");
    assert!(leftovers(dir.path()).is_empty());
}
