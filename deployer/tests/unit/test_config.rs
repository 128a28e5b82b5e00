//! Configuration generation tests, driven through a shell stand-in for the
//! server binary

#![cfg(unix)]

use velodeploy::config::generator::ConfigGenerator;
use velodeploy::config::patch::get_section_value;
use velodeploy::config::ConfigOverrides;
use velodeploy::errors::DeployError;
use velodeploy::storage::backup;

use crate::common::{fake_server_script, write_script, GENERATED_CONFIG};

#[tokio::test]
async fn test_gui_port_override_leaves_other_values() {
    let dir = tempfile::tempdir().unwrap();
    let binary = dir.path().join("velociraptor");
    write_script(&binary, &fake_server_script(0));
    let config_path = dir.path().join("server.config.yaml");

    let overrides = ConfigOverrides {
        gui_port: Some(9999),
        ..Default::default()
    };
    let report = ConfigGenerator::default()
        .generate(&binary, &config_path, &overrides)
        .await
        .unwrap();
    assert!(report.backup.is_none());

    let written = std::fs::read_to_string(&config_path).unwrap();
    assert_eq!(get_section_value(&written, "GUI", "bind_port").as_deref(), Some("9999"));
    assert_eq!(get_section_value(&written, "Frontend", "bind_port").as_deref(), Some("8000"));
    assert_eq!(
        get_section_value(&written, "Datastore", "location").as_deref(),
        Some("/var/tmp/velociraptor")
    );
    assert!(written.contains("https://localhost:8000/"));
}

#[tokio::test]
async fn test_regeneration_backs_up_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let binary = dir.path().join("velociraptor");
    write_script(&binary, &fake_server_script(0));
    let config_path = dir.path().join("server.config.yaml");
    std::fs::write(&config_path, "hand edited: true\n").unwrap();

    let report = ConfigGenerator::default()
        .generate(&binary, &config_path, &ConfigOverrides::default())
        .await
        .unwrap();

    let backup = report.backup.unwrap();
    assert_eq!(std::fs::read_to_string(&backup.backup_path).unwrap(), "hand edited: true\n");
    assert_eq!(std::fs::read_to_string(&config_path).unwrap(), GENERATED_CONFIG);
    assert_eq!(backup::list_backups(&config_path).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rejected_config_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let binary = dir.path().join("velociraptor");
    write_script(&binary, &fake_server_script(1));
    let config_path = dir.path().join("server.config.yaml");

    let err = ConfigGenerator::default()
        .generate(&binary, &config_path, &ConfigOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ConfigurationError(_)));
}
