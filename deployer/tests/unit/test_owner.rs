//! Handing files to the service account
#![cfg(unix)]

use std::os::unix::fs::MetadataExt;

use velodeploy::errors::DeployError;
use velodeploy::filesys::owner::{hand_over, Account};

fn current_account() -> Account {
    let name = users::get_current_username()
        .unwrap()
        .into_string()
        .unwrap();
    Account::lookup(&name).unwrap()
}

#[test]
fn test_lookup_resolves_current_user() {
    let account = current_account();
    assert_eq!(account.uid, users::get_current_uid());
}

#[test]
fn test_lookup_rejects_unknown_account() {
    let result = Account::lookup("velodeploy-no-such-account");
    assert!(matches!(result, Err(DeployError::ConfigurationError(_))));
}

#[tokio::test]
async fn test_hand_over_walks_directories() {
    let root = tempfile::tempdir().unwrap();
    let data = root.path().join("data");
    let nested = data.join("datastore").join("clients");
    std::fs::create_dir_all(&nested).unwrap();
    std::fs::write(nested.join("C.1234.db"), b"x").unwrap();
    let config = root.path().join("server.config.yaml");
    std::fs::write(&config, b"GUI: {}\n").unwrap();

    let account = current_account();
    hand_over(&[config.clone(), data.clone()], &account)
        .await
        .unwrap();

    for path in [config, data, nested.clone(), nested.join("C.1234.db")] {
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!((meta.uid(), meta.gid()), (account.uid, account.gid), "{:?}", path);
    }
}

#[tokio::test]
async fn test_hand_over_missing_path_fails() {
    let root = tempfile::tempdir().unwrap();
    let result = hand_over(&[root.path().join("missing")], &current_account()).await;
    assert!(matches!(result, Err(DeployError::IoError(_))));
}
