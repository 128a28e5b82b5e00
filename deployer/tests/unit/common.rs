//! Fakes shared by the unit tests

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use velodeploy::deploy::firewall::{Firewall, FirewallChange};
use velodeploy::deploy::preflight::HostProbe;
use velodeploy::errors::DeployError;
use velodeploy::services::{PlatformKind, ServiceDescriptor, ServiceManager, ServiceStatus};

/// What `config generate` prints
pub const GENERATED_CONFIG: &str = "\
Client:
  server_urls:
  - https://localhost:8000/
GUI:
  bind_address: 127.0.0.1
  bind_port: 8889
Frontend:
  bind_address: 0.0.0.0
  bind_port: 8000
Datastore:
  implementation: FileBaseDataStore
  location: /var/tmp/velociraptor
  filestore_directory: /var/tmp/velociraptor
";

/// Shell stand-in for the server binary. `config show` exits with
/// `show_exit`; `frontend` exits at once.
pub fn fake_server_script(show_exit: i32) -> String {
    fake_server_script_with_frontend(show_exit, "exit 1")
}

/// Stand-in whose `--config <path> frontend` runs `frontend`
pub fn fake_server_script_with_frontend(show_exit: i32, frontend: &str) -> String {
    format!(
        r#"#!/bin/sh
if [ "$3" = "frontend" ]; then
  {frontend}
fi
case "$1 $2" in
  "version "*) echo "velociraptor 0.7.5"; exit 0 ;;
  "config generate") cat <<'YAML'
{config}YAML
    exit 0 ;;
  "config show") exit {show_exit} ;;
  "user add") exit 0 ;;
  "user show") exit 0 ;;
esac
exit 1
"#,
        config = GENERATED_CONFIG,
        show_exit = show_exit,
        frontend = frontend
    )
}

#[cfg(unix)]
pub fn write_script(path: &Path, contents: &str) {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A port nothing listens on right now
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// Answer every request on `listener` with 401, like a GUI behind a login
pub fn serve_unauthorized(listener: TcpListener) {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });
}

/// Elevated, online, plenty of disk; ports are probed for real
pub struct FakeHost;

#[async_trait]
impl HostProbe for FakeHost {
    async fn is_elevated(&self) -> bool {
        true
    }

    async fn can_reach(&self, _host: &str, _port: u16, _timeout: Duration) -> bool {
        true
    }

    fn available_space(&self, _path: &Path) -> Option<u64> {
        Some(u64::MAX)
    }
}

/// In-memory service manager. The first `start` brings up a 401 listener
/// on `gui_port`.
pub struct FakeServices {
    gui_port: u16,
    running: AtomicBool,
    listening: AtomicBool,
    pub calls: Mutex<Vec<String>>,
}

impl FakeServices {
    pub fn new(gui_port: u16) -> Self {
        Self {
            gui_port,
            running: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A service reported running before the deployment starts
    pub fn running(gui_port: u16) -> Self {
        let services = Self::new(gui_port);
        services.running.store(true, Ordering::SeqCst);
        services
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ServiceManager for FakeServices {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Systemd
    }

    async fn install(&self, descriptor: &ServiceDescriptor) -> Result<(), DeployError> {
        self.record(format!("install {}", descriptor.name));
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> Result<(), DeployError> {
        self.record(format!("uninstall {}", name));
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), DeployError> {
        self.record(format!("start {}", name));
        self.running.store(true, Ordering::SeqCst);
        if !self.listening.swap(true, Ordering::SeqCst) {
            let listener = TcpListener::bind(("127.0.0.1", self.gui_port)).await?;
            serve_unauthorized(listener);
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), DeployError> {
        self.record(format!("stop {}", name));
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self, name: &str) -> ServiceStatus {
        ServiceStatus {
            name: name.to_string(),
            running: self.running.load(Ordering::SeqCst),
            start_type: "auto".to_string(),
            exists: true,
        }
    }

    async fn logs(&self, _name: &str, _lines: usize) -> Result<Vec<String>, DeployError> {
        Ok(Vec::new())
    }

    fn settle_delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// Records the rules it was asked to create
#[derive(Default)]
pub struct FakeFirewall {
    pub rules: Mutex<Vec<(String, u16)>>,
}

#[async_trait]
impl Firewall for FakeFirewall {
    async fn allow_tcp(&self, rule_name: &str, port: u16) -> Result<FirewallChange, DeployError> {
        self.rules.lock().unwrap().push((rule_name.to_string(), port));
        Ok(FirewallChange::Created)
    }
}
