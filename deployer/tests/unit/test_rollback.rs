//! Rollback tests

use std::sync::Arc;

use velodeploy::deploy::rollback::RollbackManager;
use velodeploy::errors::DeployError;
use velodeploy::services::systemd::Systemd;
use velodeploy::storage::backup;

fn manager(dir: &std::path::Path) -> RollbackManager {
    RollbackManager::new(Arc::new(Systemd::with_unit_dir(dir)))
}

#[tokio::test]
async fn test_restore_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("server.config.yaml");
    let original: &[u8] = b"GUI:\n  bind_port: 8889 # keep\r\n\xef\xbb\xbfunusual: bytes\n";

    std::fs::write(&config_path, original).unwrap();
    backup::create_backup(&config_path).await.unwrap().unwrap();
    std::fs::write(&config_path, b"GUI:\n  bind_port: 1\n").unwrap();

    let restored = manager(dir.path()).restore(&config_path, None).await.unwrap();

    assert_eq!(std::fs::read(&config_path).unwrap(), original);
    assert_eq!(restored.source_path, config_path);
}

#[tokio::test]
async fn test_restore_uses_most_recent_backup() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("server.config.yaml");

    std::fs::write(&config_path, "first\n").unwrap();
    backup::create_backup(&config_path).await.unwrap();
    std::fs::write(&config_path, "second\n").unwrap();
    backup::create_backup(&config_path).await.unwrap();
    std::fs::write(&config_path, "broken\n").unwrap();

    manager(dir.path()).restore(&config_path, None).await.unwrap();
    assert_eq!(std::fs::read_to_string(&config_path).unwrap(), "second\n");
}

#[tokio::test]
async fn test_restore_without_backup_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("server.config.yaml");
    std::fs::write(&config_path, "live\n").unwrap();

    let err = manager(dir.path()).restore(&config_path, None).await.unwrap_err();

    assert!(matches!(err, DeployError::NoBackupError(_)));
    assert_eq!(std::fs::read_to_string(&config_path).unwrap(), "live\n");
}
