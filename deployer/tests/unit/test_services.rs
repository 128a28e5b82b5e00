//! Service backend tests that need no service manager on the host

use velodeploy::services::launchd::Launchd;
use velodeploy::services::systemd::Systemd;
use velodeploy::services::windows::WindowsScm;
use velodeploy::services::{PlatformKind, ServiceManager, ServiceStatus};

fn assert_missing(status: &ServiceStatus, name: &str) {
    assert_eq!(status, &ServiceStatus::missing(name));
    assert!(!status.running);
    assert!(!status.exists);
}

#[tokio::test]
async fn test_systemd_unknown_service_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let systemd = Systemd::with_unit_dir(dir.path());

    assert_eq!(systemd.kind(), PlatformKind::Systemd);
    assert_missing(&systemd.status("velociraptor").await, "velociraptor");
}

#[tokio::test]
async fn test_launchd_unknown_service_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let launchd = Launchd::with_daemon_dir(dir.path());

    assert_missing(
        &launchd.status("com.velocidex.velociraptor").await,
        "com.velocidex.velociraptor",
    );
}

#[cfg(not(windows))]
#[tokio::test]
async fn test_windows_status_without_sc_is_missing() {
    let scm = WindowsScm::new();
    assert_missing(&scm.status("Velociraptor").await, "Velociraptor");
}

#[test]
fn test_status_serializes_for_the_cli() {
    let json = serde_json::to_value(ServiceStatus::missing("velociraptor")).unwrap();
    assert_eq!(json["exists"], false);
    assert_eq!(json["start_type"], "unknown");
}
