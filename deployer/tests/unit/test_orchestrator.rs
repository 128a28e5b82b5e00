//! End-to-end orchestrator tests against fake host, services and firewall

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use velodeploy::deploy::fsm::DeploymentState;
use velodeploy::deploy::orchestrator::{DeployContext, Orchestrator};
use velodeploy::deploy::profile::EnvironmentProfile;
use velodeploy::errors::DeployError;
use velodeploy::storage::settings::Settings;

use crate::common::{free_port, FakeFirewall, FakeHost, FakeServices};

fn settings(api_base_url: Option<String>) -> Settings {
    let mut settings = Settings::default();
    if let Some(url) = api_base_url {
        settings.release.api_base_url = url;
    }
    settings.retry.max_attempts = 1;
    settings
}

fn profile(root: &Path, gui_port: u16, frontend_port: u16) -> EnvironmentProfile {
    EnvironmentProfile {
        name: "staging".to_string(),
        install_dir: root.join("opt").join("velociraptor"),
        data_dir: root.join("var").join("velociraptor"),
        service_name: "velociraptor".to_string(),
        gui_port,
        frontend_port,
        readiness_timeout_secs: 10,
        readiness_scheme: "http".to_string(),
        require_elevation: false,
        ..EnvironmentProfile::default()
    }
}

fn context(profile: EnvironmentProfile) -> DeployContext {
    DeployContext::new(profile, SecretString::from("correct-horse-battery"))
}

fn orchestrator(settings: &Settings, services: Arc<FakeServices>, firewall: Arc<FakeFirewall>) -> Orchestrator {
    Orchestrator::new(settings)
        .unwrap()
        .with_host_probe(Arc::new(FakeHost))
        .with_service_manager(services)
        .with_firewall(firewall)
}

#[tokio::test]
async fn test_busy_port_fails_preflight_without_touching_disk() {
    let root = tempfile::tempdir().unwrap();
    let busy = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
    let gui_port = busy.local_addr().unwrap().port();
    let ctx = context(profile(root.path(), gui_port, free_port()));

    let services = Arc::new(FakeServices::new(gui_port));
    let firewall = Arc::new(FakeFirewall::default());
    let failure = orchestrator(&settings(None), services.clone(), firewall.clone())
        .deploy(&ctx)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, DeployError::PreflightError(_)));
    assert_eq!(failure.record.status, DeploymentState::Failed);
    assert_eq!(failure.record.failed_stage(), Some(DeploymentState::Preflight));
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    assert!(services.calls().is_empty());
    assert!(firewall.rules.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_held_lock_fails_preflight() {
    let root = tempfile::tempdir().unwrap();
    let ctx = context(profile(root.path(), free_port(), free_port()));

    std::fs::create_dir_all(&ctx.target.install_dir).unwrap();
    let config_path = ctx.target.config_path();
    std::fs::write(&config_path, b"live: true\n").unwrap();
    let lock_path = ctx.target.lock_path();
    std::fs::write(&lock_path, std::process::id().to_string()).unwrap();

    let services = Arc::new(FakeServices::new(ctx.profile.gui_port));
    let failure = orchestrator(&settings(None), services, Arc::new(FakeFirewall::default()))
        .deploy(&ctx)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, DeployError::LockContentionError(_)));
    assert_eq!(std::fs::read(&config_path).unwrap(), b"live: true\n");
    assert_eq!(
        std::fs::read_to_string(&lock_path).unwrap(),
        std::process::id().to_string()
    );
}

#[cfg(unix)]
mod with_fake_binary {
    use velodeploy::config::patch::get_section_value;
    use velodeploy::deploy::record::Outcome;
    use velodeploy::process::supervisor::ProcessSupervisor;
    use velodeploy::release::{Arch, Platform};

    use super::*;
    use crate::common::{fake_server_script, fake_server_script_with_frontend, write_script};

    fn feed_server_release(download_url: &str, size: usize) -> String {
        serde_json::json!({
            "tag_name": "v0.7.6",
            "assets": [{
                "name": "velociraptor-v0.7.6-linux-amd64",
                "browser_download_url": download_url,
                "size": size,
            }]
        })
        .to_string()
    }

    fn process_alive(pid: &str) -> bool {
        std::process::Command::new("sh")
            .args(["-c", &format!("kill -0 {} 2>/dev/null", pid)])
            .status()
            .unwrap()
            .success()
    }

    #[tokio::test]
    async fn test_fresh_deployment_reaches_ready() {
        let script = fake_server_script(0);
        let mut server = mockito::Server::new_async().await;
        let download_url = format!("{}/download/velociraptor-v0.7.5-linux-amd64", server.url());
        let feed = serde_json::json!({
            "tag_name": "v0.7.5",
            "assets": [{
                "name": "velociraptor-v0.7.5-linux-amd64",
                "browser_download_url": download_url,
                "size": script.len(),
            }]
        });
        server
            .mock("GET", "/repos/Velocidex/velociraptor/releases/latest")
            .with_body(feed.to_string())
            .create_async()
            .await;
        let download = server
            .mock("GET", "/download/velociraptor-v0.7.5-linux-amd64")
            .with_body(script.as_bytes())
            .expect(1)
            .create_async()
            .await;

        let root = tempfile::tempdir().unwrap();
        let (gui_port, frontend_port) = (free_port(), free_port());
        let ctx = context(profile(root.path(), gui_port, frontend_port));

        let services = Arc::new(FakeServices::new(gui_port));
        let firewall = Arc::new(FakeFirewall::default());
        let deployment = orchestrator(&settings(Some(server.url())), services.clone(), firewall.clone())
            .with_platform(Platform::Linux, Arch::Amd64)
            .deploy(&ctx)
            .await
            .unwrap();
        download.assert_async().await;

        let record = &deployment.record;
        assert_eq!(record.status, DeploymentState::Ready);
        assert_eq!(record.outcome(), Outcome::Succeeded);
        assert_eq!(record.url.as_deref(), Some(format!("http://127.0.0.1:{}/", gui_port).as_str()));
        assert_eq!(record.release_version.as_deref(), Some("v0.7.5"));
        assert!(record.binary_sha256.is_some());
        assert!(record.secret_applied);
        assert!(deployment.foreground.is_none());

        let config = std::fs::read_to_string(ctx.target.config_path()).unwrap();
        assert_eq!(
            get_section_value(&config, "GUI", "bind_port"),
            Some(gui_port.to_string())
        );
        assert_eq!(
            get_section_value(&config, "Frontend", "bind_port"),
            Some(frontend_port.to_string())
        );
        assert!(config.contains(&format!("https://localhost:{}/", frontend_port)));
        assert!(!config.contains("correct-horse-battery"));

        assert_eq!(services.calls(), vec!["install velociraptor", "start velociraptor"]);
        assert_eq!(
            *firewall.rules.lock().unwrap(),
            vec![
                (format!("velociraptor-staging-tcp-{}", gui_port), gui_port),
                (format!("velociraptor-staging-tcp-{}", frontend_port), frontend_port),
            ]
        );
        assert!(!ctx.target.lock_path().exists());
    }

    #[tokio::test]
    async fn test_production_failure_restores_previous_config() {
        let root = tempfile::tempdir().unwrap();
        let mut profile = profile(root.path(), free_port(), free_port());
        profile.production = true;
        let ctx = context(profile);

        write_script(&ctx.target.binary_path, &fake_server_script(1));
        let config_path = ctx.target.config_path();
        std::fs::write(&config_path, b"known: good\n").unwrap();

        let services = Arc::new(FakeServices::new(ctx.profile.gui_port));
        let failure = orchestrator(&settings(None), services.clone(), Arc::new(FakeFirewall::default()))
            .deploy(&ctx)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, DeployError::ConfigurationError(_)));
        assert_eq!(failure.record.status, DeploymentState::RolledBack);
        assert_eq!(failure.record.failed_stage(), Some(DeploymentState::Configuring));
        assert_eq!(std::fs::read(&config_path).unwrap(), b"known: good\n");
        assert_eq!(services.calls(), vec!["stop velociraptor", "start velociraptor"]);
        assert!(!ctx.target.lock_path().exists());
    }

    #[tokio::test]
    async fn test_staging_failure_keeps_generated_config() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(profile(root.path(), free_port(), free_port()));

        write_script(&ctx.target.binary_path, &fake_server_script(1));
        let config_path = ctx.target.config_path();
        std::fs::write(&config_path, b"known: good\n").unwrap();

        let services = Arc::new(FakeServices::new(ctx.profile.gui_port));
        let failure = orchestrator(&settings(None), services.clone(), Arc::new(FakeFirewall::default()))
            .deploy(&ctx)
            .await
            .unwrap_err();

        assert_eq!(failure.record.status, DeploymentState::Failed);
        assert_ne!(std::fs::read(&config_path).unwrap(), b"known: good\n");
        assert_eq!(
            velodeploy::storage::backup::list_backups(&config_path)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(services.calls().is_empty());
    }

    #[tokio::test]
    async fn test_direct_launch_that_exits_fails_service_start() {
        let root = tempfile::tempdir().unwrap();
        let mut profile = profile(root.path(), free_port(), free_port());
        profile.launch_mode = velodeploy::deploy::profile::LaunchMode::Direct;
        profile.manage_firewall = false;
        let ctx = context(profile);

        // The stand-in has no `frontend` verb and exits immediately.
        write_script(&ctx.target.binary_path, &fake_server_script(0));

        let services = Arc::new(FakeServices::new(ctx.profile.gui_port));
        let failure = orchestrator(&settings(None), services.clone(), Arc::new(FakeFirewall::default()))
            .with_supervisor(ProcessSupervisor::new(Duration::from_millis(500)))
            .deploy(&ctx)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, DeployError::ProcessError(_)));
        assert_eq!(failure.record.failed_stage(), Some(DeploymentState::ServiceStarting));
        assert!(failure.record.service_name.is_none());
        assert!(services.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_upgrade_download_leaves_service_running() {
        let mut server = mockito::Server::new_async().await;
        let download_url = format!("{}/download/velociraptor-v0.7.6-linux-amd64", server.url());
        server
            .mock("GET", "/repos/Velocidex/velociraptor/releases/latest")
            .with_body(feed_server_release(&download_url, 4096))
            .create_async()
            .await;
        server
            .mock("GET", "/download/velociraptor-v0.7.6-linux-amd64")
            .with_status(500)
            .create_async()
            .await;

        let root = tempfile::tempdir().unwrap();
        let mut profile = profile(root.path(), free_port(), free_port());
        profile.force_download = true;
        let ctx = context(profile);

        let old_binary = fake_server_script(0);
        write_script(&ctx.target.binary_path, &old_binary);

        let services = Arc::new(FakeServices::running(ctx.profile.gui_port));
        let failure = orchestrator(&settings(Some(server.url())), services.clone(), Arc::new(FakeFirewall::default()))
            .with_platform(Platform::Linux, Arch::Amd64)
            .deploy(&ctx)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, DeployError::DownloadError(_)));
        assert_eq!(failure.record.status, DeploymentState::Failed);
        assert!(!failure.record.stopped_for_upgrade);
        assert!(services.calls().is_empty());
        assert!(services.is_running());
        assert_eq!(std::fs::read_to_string(&ctx.target.binary_path).unwrap(), old_binary);
    }

    #[tokio::test]
    async fn test_upgrade_stops_service_only_to_swap_binary() {
        let new_binary = fake_server_script(0).replace("0.7.5", "0.7.6");
        let mut server = mockito::Server::new_async().await;
        let download_url = format!("{}/download/velociraptor-v0.7.6-linux-amd64", server.url());
        server
            .mock("GET", "/repos/Velocidex/velociraptor/releases/latest")
            .with_body(feed_server_release(&download_url, new_binary.len()))
            .create_async()
            .await;
        server
            .mock("GET", "/download/velociraptor-v0.7.6-linux-amd64")
            .with_body(new_binary.as_bytes())
            .create_async()
            .await;

        let root = tempfile::tempdir().unwrap();
        let mut profile = profile(root.path(), free_port(), free_port());
        profile.force_download = true;
        let ctx = context(profile);
        write_script(&ctx.target.binary_path, &fake_server_script(0));

        let services = Arc::new(FakeServices::running(ctx.profile.gui_port));
        let deployment = orchestrator(&settings(Some(server.url())), services.clone(), Arc::new(FakeFirewall::default()))
            .with_platform(Platform::Linux, Arch::Amd64)
            .deploy(&ctx)
            .await
            .unwrap();

        assert_eq!(deployment.record.status, DeploymentState::Ready);
        assert!(deployment.record.stopped_for_upgrade);
        assert_eq!(
            services.calls(),
            vec!["stop velociraptor", "install velociraptor", "start velociraptor"]
        );
        assert_eq!(std::fs::read_to_string(&ctx.target.binary_path).unwrap(), new_binary);
    }

    #[tokio::test]
    async fn test_direct_launch_killed_after_readiness_timeout() {
        let root = tempfile::tempdir().unwrap();
        let mut profile = profile(root.path(), free_port(), free_port());
        profile.launch_mode = velodeploy::deploy::profile::LaunchMode::Direct;
        profile.manage_firewall = false;
        profile.readiness_timeout_secs = 1;
        let ctx = context(profile);

        // Stays up without ever listening on the GUI port
        let pid_file = root.path().join("frontend.pid");
        let frontend = format!("echo $$ > {}; exec sleep 60", pid_file.display());
        write_script(&ctx.target.binary_path, &fake_server_script_with_frontend(0, &frontend));

        let services = Arc::new(FakeServices::new(ctx.profile.gui_port));
        let failure = orchestrator(&settings(None), services, Arc::new(FakeFirewall::default()))
            .with_supervisor(ProcessSupervisor::new(Duration::from_millis(200)))
            .deploy(&ctx)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, DeployError::ReadinessTimeout { .. }));
        assert_eq!(failure.record.failed_stage(), Some(DeploymentState::Verifying));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        assert!(!process_alive(pid.trim()));
    }

    #[tokio::test]
    async fn test_concurrent_deploys_one_wins_the_lock() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(profile(root.path(), free_port(), free_port()));
        write_script(&ctx.target.binary_path, &fake_server_script(0));

        let services = Arc::new(FakeServices::new(ctx.profile.gui_port));
        let settings = settings(None);
        let first = orchestrator(&settings, services.clone(), Arc::new(FakeFirewall::default()));
        let second = orchestrator(&settings, services.clone(), Arc::new(FakeFirewall::default()));

        let (a, b) = tokio::join!(first.deploy(&ctx), second.deploy(&ctx));

        let (won, lost) = match (a, b) {
            (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
            (a, b) => panic!("expected exactly one winner: {:?} / {:?}", a.is_ok(), b.is_ok()),
        };
        assert_eq!(won.record.status, DeploymentState::Ready);
        assert!(matches!(lost.error, DeployError::LockContentionError(_)));
        assert_eq!(lost.record.failed_stage(), Some(DeploymentState::Preflight));
        assert_eq!(services.calls(), vec!["install velociraptor", "start velociraptor"]);
        assert!(!ctx.target.lock_path().exists());
    }

    #[tokio::test]
    async fn test_unknown_service_account_fails_preflight() {
        let root = tempfile::tempdir().unwrap();
        let mut profile = profile(root.path(), free_port(), free_port());
        profile.run_as_user = Some("velodeploy-no-such-account".to_string());
        let ctx = context(profile);

        let services = Arc::new(FakeServices::new(ctx.profile.gui_port));
        let failure = orchestrator(&settings(None), services.clone(), Arc::new(FakeFirewall::default()))
            .deploy(&ctx)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, DeployError::PreflightError(_)));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        assert!(services.calls().is_empty());
    }

    #[tokio::test]
    async fn test_service_account_owns_config_and_data() {
        use std::os::unix::fs::MetadataExt;

        let account = users::get_current_username()
            .unwrap()
            .into_string()
            .unwrap();
        let root = tempfile::tempdir().unwrap();
        let mut profile = profile(root.path(), free_port(), free_port());
        profile.run_as_user = Some(account);
        let ctx = context(profile);
        write_script(&ctx.target.binary_path, &fake_server_script(0));

        let services = Arc::new(FakeServices::new(ctx.profile.gui_port));
        let deployment = orchestrator(&settings(None), services, Arc::new(FakeFirewall::default()))
            .deploy(&ctx)
            .await
            .unwrap();

        assert_eq!(deployment.record.status, DeploymentState::Ready);
        let uid = users::get_current_uid();
        assert_eq!(std::fs::metadata(ctx.target.config_path()).unwrap().uid(), uid);
        assert_eq!(std::fs::metadata(ctx.target.datastore_dir().path()).unwrap().uid(), uid);
    }
}
