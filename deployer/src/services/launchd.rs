//! launchd backend

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::exec::{self, CommandOutput, COMMAND_TIMEOUT};
use crate::filesys::file::File;
use crate::services::{PlatformKind, ServiceDescriptor, ServiceManager, ServiceStatus};

const DEFAULT_DAEMON_DIR: &str = "/Library/LaunchDaemons";

/// Manages daemons in a LaunchDaemons directory; the service name is the
/// job label
#[derive(Debug, Clone)]
pub struct Launchd {
    daemon_dir: PathBuf,
}

impl Default for Launchd {
    fn default() -> Self {
        Self::new()
    }
}

impl Launchd {
    pub fn new() -> Self {
        Self::with_daemon_dir(DEFAULT_DAEMON_DIR)
    }

    pub fn with_daemon_dir(daemon_dir: impl Into<PathBuf>) -> Self {
        Self {
            daemon_dir: daemon_dir.into(),
        }
    }

    pub fn plist_path(&self, label: &str) -> PathBuf {
        self.daemon_dir.join(format!("{}.plist", label))
    }

    async fn launchctl(&self, args: &[&str]) -> Result<CommandOutput, DeployError> {
        exec::run("launchctl", args, COMMAND_TIMEOUT)
            .await
            .map_err(|e| DeployError::ServiceError(format!("Failed to run launchctl: {}", e)))
    }

    async fn launchctl_ok(&self, args: &[&str]) -> Result<(), DeployError> {
        let output = self.launchctl(args).await?;
        if !output.success() {
            return Err(DeployError::ServiceError(format!(
                "launchctl {} failed ({})",
                args.join(" "),
                output.describe()
            )));
        }
        Ok(())
    }

    fn plist_arg(&self, label: &str) -> String {
        self.plist_path(label).to_string_lossy().into_owned()
    }
}

/// Stdout/stderr files for a daemon
pub fn log_paths(descriptor: &ServiceDescriptor) -> (PathBuf, PathBuf) {
    let dir = descriptor.data_dir.join("logs");
    (
        dir.join(format!("{}.out.log", descriptor.name)),
        dir.join(format!("{}.err.log", descriptor.name)),
    )
}

/// Render the daemon property list for `descriptor`
pub fn render_plist(descriptor: &ServiceDescriptor) -> String {
    let (stdout_path, stderr_path) = log_paths(descriptor);
    let string = |value: &str| format!("    <string>{}</string>\n", xml_escape(value));
    let key = |name: &str| format!("    <key>{}</key>\n", name);

    let mut plist = String::new();
    plist.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    plist.push_str("<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n");
    plist.push_str("<plist version=\"1.0\">\n<dict>\n");

    plist.push_str(&key("Label"));
    plist.push_str(&string(&descriptor.name));

    plist.push_str(&key("ProgramArguments"));
    plist.push_str("    <array>\n");
    for arg in [
        &*descriptor.binary_path.to_string_lossy(),
        "--config",
        &*descriptor.config_path.to_string_lossy(),
        "frontend",
    ] {
        plist.push_str(&format!("    {}", string(arg)));
    }
    plist.push_str("    </array>\n");

    plist.push_str(&key("WorkingDirectory"));
    plist.push_str(&string(&descriptor.working_directory.to_string_lossy()));

    if let Some(user) = &descriptor.run_as_user {
        plist.push_str(&key("UserName"));
        plist.push_str(&string(user));
    }

    plist.push_str(&key("RunAtLoad"));
    plist.push_str("    <true/>\n");
    plist.push_str(&key("KeepAlive"));
    plist.push_str("    <true/>\n");

    plist.push_str(&key("StandardOutPath"));
    plist.push_str(&string(&stdout_path.to_string_lossy()));
    plist.push_str(&key("StandardErrorPath"));
    plist.push_str(&string(&stderr_path.to_string_lossy()));

    plist.push_str("</dict>\n</plist>\n");
    plist
}

/// The `<string>` following `<key>{key}</key>` in a rendered plist
pub fn plist_string_value(plist: &str, key: &str) -> Option<String> {
    let marker = format!("<key>{}</key>", key);
    let rest = &plist[plist.find(&marker)? + marker.len()..];
    let start = rest.find("<string>")? + "<string>".len();
    let end = rest[start..].find("</string>")?;
    Some(xml_unescape(&rest[start..start + end]))
}

/// PID from `launchctl list <label>` output, when the job is running
pub fn parse_list_pid(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        let line = line.trim();
        let value = line.strip_prefix("\"PID\" = ")?;
        value.trim_end_matches(';').trim().parse().ok()
    })
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

async fn tail_file(path: &Path, lines: usize) -> Result<Vec<String>, DeployError> {
    let file = File::new(path);
    if !file.exists().await {
        return Ok(Vec::new());
    }
    let contents = String::from_utf8_lossy(&file.read_bytes().await?).into_owned();
    let all: Vec<&str> = contents.lines().collect();
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].iter().map(|line| line.to_string()).collect())
}

#[async_trait]
impl ServiceManager for Launchd {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Launchd
    }

    async fn install(&self, descriptor: &ServiceDescriptor) -> Result<(), DeployError> {
        let plist_path = self.plist_path(&descriptor.name);
        info!("Writing launchd plist {:?}", plist_path);

        let (stdout_path, _) = log_paths(descriptor);
        if let Some(dir) = stdout_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        File::new(&plist_path)
            .write_atomic(render_plist(descriptor).as_bytes())
            .await
            .map_err(|e| DeployError::ServiceError(format!("Failed to write {:?}: {}", plist_path, e)))?;

        if descriptor.auto_start {
            let plist = self.plist_arg(&descriptor.name);
            self.launchctl_ok(&["load", "-w", plist.as_str()]).await?;
        }
        Ok(())
    }

    async fn uninstall(&self, name: &str) -> Result<(), DeployError> {
        let plist_path = self.plist_path(name);
        if !File::new(&plist_path).exists().await {
            debug!("Plist {:?} not present", plist_path);
            return Ok(());
        }

        let plist = self.plist_arg(name);
        if let Err(e) = self.launchctl_ok(&["unload", "-w", plist.as_str()]).await {
            warn!("Unloading {} failed: {}", name, e);
        }
        tokio::fs::remove_file(&plist_path).await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), DeployError> {
        if self.status(name).await.running {
            return Ok(());
        }
        let plist = self.plist_arg(name);
        self.launchctl_ok(&["load", "-w", plist.as_str()]).await
    }

    async fn stop(&self, name: &str) -> Result<(), DeployError> {
        // KeepAlive would respawn a merely stopped job, so the job is unloaded.
        let plist = self.plist_arg(name);
        self.launchctl_ok(&["unload", plist.as_str()]).await
    }

    async fn status(&self, name: &str) -> ServiceStatus {
        if !File::new(self.plist_path(name)).exists().await {
            return ServiceStatus::missing(name);
        }

        let running = match self.launchctl(&["list", name]).await {
            Ok(output) if output.success() => parse_list_pid(&output.stdout).is_some(),
            // Not loaded
            Ok(_) => false,
            Err(e) => {
                warn!("Status query for {} failed: {}", name, e);
                return ServiceStatus::missing(name);
            }
        };

        ServiceStatus {
            name: name.to_string(),
            running,
            start_type: "auto".to_string(),
            exists: true,
        }
    }

    async fn logs(&self, name: &str, lines: usize) -> Result<Vec<String>, DeployError> {
        let plist_path = self.plist_path(name);
        let plist = File::new(&plist_path)
            .read_string()
            .await
            .map_err(|e| DeployError::ServiceError(format!("Service {} not installed: {}", name, e)))?;

        let mut out = Vec::new();
        for key in ["StandardOutPath", "StandardErrorPath"] {
            if let Some(path) = plist_string_value(&plist, key) {
                out.extend(tail_file(Path::new(&path), lines).await?);
            }
        }
        let skip = out.len().saturating_sub(lines);
        Ok(out.split_off(skip))
    }
}
