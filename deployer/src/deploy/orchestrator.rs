//! Deployment orchestration
//!
//! One `deploy` call runs the stages in order, with no internal parallelism:
//! PREFLIGHT, DOWNLOADING, CONFIGURING, PROVISIONING, SERVICE_STARTING and
//! VERIFYING. Every collaborator the stages touch is held by the
//! [`Orchestrator`]; everything that varies per attempt travels in the
//! [`DeployContext`].

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::generator::ConfigGenerator;
use crate::config::ConfigOverrides;
use crate::deploy::firewall::{firewall_for, Firewall, FirewallChange};
use crate::deploy::fsm::DeploymentEvent;
use crate::deploy::lock::DeployLock;
use crate::deploy::preflight::{
    check_account, check_disk, check_network, check_ports, check_privileges, HostProbe, SystemHostProbe,
};
use crate::deploy::profile::{EnvironmentProfile, LaunchMode};
use crate::deploy::record::{DeploymentRecord, Warning};
use crate::deploy::rollback::RollbackManager;
use crate::errors::DeployError;
use crate::filesys::owner::{self, Account};
use crate::installer::artifact::{ArtifactInstaller, InstallOutcome, SmokeTest};
use crate::managed::ManagedBinary;
use crate::process::readiness::ReadinessProbe;
use crate::process::supervisor::{ProcessSupervisor, SupervisedProcess};
use crate::provision::PrincipalProvisioner;
use crate::release::{Arch, Platform, ReleaseResolver};
use crate::services::{service_manager, PlatformKind, ServiceManager};
use crate::storage::layout::InstallTarget;
use crate::storage::settings::{ReleaseFeedSettings, Settings};
use crate::utils::{retry, sha256_file, RetryPolicy};

const NETWORK_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Inputs of one deployment attempt
pub struct DeployContext {
    pub profile: EnvironmentProfile,
    pub target: InstallTarget,
    pub admin_secret: SecretString,
}

impl DeployContext {
    pub fn new(profile: EnvironmentProfile, admin_secret: SecretString) -> Self {
        let target = profile.install_target();
        Self {
            profile,
            target,
            admin_secret,
        }
    }
}

/// A deployment that reached READY
#[derive(Debug)]
pub struct Deployment {
    pub record: DeploymentRecord,

    /// The server process, in direct launch mode
    pub foreground: Option<SupervisedProcess>,
}

/// A deployment that did not reach READY. `error` is the failure that ended
/// the attempt, unchanged by any rollback.
#[derive(Debug)]
pub struct DeploymentFailure {
    pub record: DeploymentRecord,
    pub error: DeployError,
}

impl std::fmt::Display for DeploymentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deployment {} failed: {}", self.record.id, self.error)
    }
}

impl std::error::Error for DeploymentFailure {}

/// Sequences a deployment against one host
pub struct Orchestrator {
    host: Arc<dyn HostProbe>,
    services: Arc<dyn ServiceManager>,
    firewall: Arc<dyn Firewall>,
    resolver: ReleaseResolver,
    installer: ArtifactInstaller,
    generator: ConfigGenerator,
    provisioner: PrincipalProvisioner,
    supervisor: ProcessSupervisor,
    release: ReleaseFeedSettings,
    retry: RetryPolicy,
    platform: Platform,
    arch: Arch,
}

impl Orchestrator {
    /// Orchestrator for this host's platform
    pub fn new(settings: &Settings) -> Result<Self, DeployError> {
        let kind = PlatformKind::detect();
        let retry = settings.retry.to_policy();
        let release = settings.release.clone();

        Ok(Self {
            host: Arc::new(SystemHostProbe),
            services: service_manager(kind),
            firewall: firewall_for(kind),
            resolver: ReleaseResolver::new(
                &release.api_base_url,
                Duration::from_secs(release.request_timeout_secs),
            )?,
            installer: ArtifactInstaller::new(Duration::from_secs(release.download_timeout_secs), retry.clone())?,
            generator: ConfigGenerator::default(),
            provisioner: PrincipalProvisioner::default(),
            supervisor: ProcessSupervisor::default(),
            release,
            retry,
            platform: Platform::detect(),
            arch: Arch::detect(),
        })
    }

    pub fn with_host_probe(mut self, host: Arc<dyn HostProbe>) -> Self {
        self.host = host;
        self
    }

    pub fn with_service_manager(mut self, services: Arc<dyn ServiceManager>) -> Self {
        self.services = services;
        self
    }

    pub fn with_firewall(mut self, firewall: Arc<dyn Firewall>) -> Self {
        self.firewall = firewall;
        self
    }

    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Target another platform's release assets
    pub fn with_platform(mut self, platform: Platform, arch: Arch) -> Self {
        self.platform = platform;
        self.arch = arch;
        self
    }

    pub fn services(&self) -> Arc<dyn ServiceManager> {
        self.services.clone()
    }

    /// Run one deployment attempt for `ctx`
    pub async fn deploy(&self, ctx: &DeployContext) -> Result<Deployment, DeploymentFailure> {
        let service_name =
            (ctx.profile.launch_mode == LaunchMode::Service).then(|| ctx.profile.service_name.clone());
        let mut record = DeploymentRecord::new(&ctx.profile.name, ctx.target.config_path(), service_name);
        let span = info_span!(
            "deploy",
            environment = %ctx.profile.name,
            deployment_id = %record.id
        );

        match self.run(ctx, &mut record).instrument(span).await {
            Ok(foreground) => Ok(Deployment { record, foreground }),
            Err(error) => Err(DeploymentFailure { record, error }),
        }
    }

    async fn run(&self, ctx: &DeployContext, record: &mut DeploymentRecord) -> Result<Option<SupervisedProcess>, DeployError> {
        info!("Deploying to {:?}", ctx.target.install_dir);
        record.advance(DeploymentEvent::Begin)?;

        // A failed pre-flight has nothing to roll back.
        let lock = match self.preflight(ctx).await {
            Ok(lock) => lock,
            Err(e) => {
                error!("Pre-flight failed: {}", e);
                record.fail(&e);
                return Err(e);
            }
        };

        let mut foreground = None;
        let result = self.execute(ctx, record, &mut foreground).await;

        match result {
            Ok(()) => {
                drop(lock);
                info!("Deployment ready at {}", record.url.as_deref().unwrap_or("-"));
                Ok(foreground)
            }
            Err(e) => {
                error!("{:?} failed: {}", record.status, e);
                if let Some(process) = foreground.take() {
                    if let Err(kill_err) = process.terminate().await {
                        warn!("Failed to terminate server process: {}", kill_err);
                    }
                }
                record.fail(&e);
                if ctx.profile.production {
                    self.roll_back(record).await;
                } else if !record.config_modified {
                    self.restart_stopped(record).await;
                }
                drop(lock);
                Err(e)
            }
        }
    }

    async fn preflight(&self, ctx: &DeployContext) -> Result<DeployLock, DeployError> {
        let host = self.host.as_ref();
        let profile = &ctx.profile;

        check_privileges(host, profile).await?;
        check_account(profile)?;
        let lock = DeployLock::acquire(&ctx.target).await?;

        if self.needs_download(ctx).await {
            check_network(host, &self.release.api_base_url, NETWORK_CHECK_TIMEOUT).await?;
        } else {
            debug!("Binary present; release feed not needed");
        }
        check_disk(host, profile)?;

        if profile.launch_mode == LaunchMode::Service && self.services.status(&profile.service_name).await.running {
            // The ports belong to the service being redeployed.
            info!("{} is running; skipping port checks", profile.service_name);
        } else {
            check_ports(host, &profile.required_ports()).await?;
        }

        info!("Pre-flight checks passed");
        Ok(lock)
    }

    async fn execute(
        &self,
        ctx: &DeployContext,
        record: &mut DeploymentRecord,
        foreground: &mut Option<SupervisedProcess>,
    ) -> Result<(), DeployError> {
        let profile = &ctx.profile;
        let target = &ctx.target;
        let config_path = target.config_path();
        record.advance(DeploymentEvent::PreflightPassed)?;

        target.setup().await?;
        self.install_binary(ctx, record).await?;
        record.advance(DeploymentEvent::Downloaded)?;

        let overrides = ConfigOverrides::from(&profile.service_config(target));
        record.config_modified = true;
        let report = self
            .generator
            .generate(&target.binary_path, &config_path, &overrides)
            .await?;
        record.config_backup = report.backup.map(|backup| backup.backup_path);
        record.advance(DeploymentEvent::Configured)?;

        let provisioning = self
            .provisioner
            .create_admin_principal(&target.binary_path, &config_path, &profile.admin_username, &ctx.admin_secret)
            .await;
        record.secret_applied = provisioning.secret_applied();
        if let Some(warning) = provisioning.warning() {
            record.warn(Warning::Provisioning(warning.clone()));
        }
        record.advance(DeploymentEvent::Provisioned)?;

        if let Some(user) = &profile.run_as_user {
            let account = Account::lookup(user)?;
            owner::hand_over(&[config_path.clone(), target.data_dir.clone()], &account).await?;
        }

        self.open_firewall(profile, record).await;
        match profile.launch_mode {
            LaunchMode::Service => self.start_service(ctx, record).await?,
            LaunchMode::Direct => {
                let args = ManagedBinary::frontend_args(&config_path);
                *foreground = Some(self.supervisor.start(&target.binary_path, &args).await?);
            }
        }
        record.advance(DeploymentEvent::ServiceStarted)?;

        let probe = ReadinessProbe::new(&profile.readiness_scheme)?;
        let readiness = probe
            .wait_for_readiness(profile.gui_port, profile.readiness_timeout())
            .await;
        if !readiness.ready {
            return Err(DeployError::ReadinessTimeout {
                port: profile.gui_port,
                timeout_secs: profile.readiness_timeout_secs,
            });
        }
        record.url = Some(readiness.url);
        record.advance(DeploymentEvent::Verified)?;
        Ok(())
    }

    async fn needs_download(&self, ctx: &DeployContext) -> bool {
        ctx.profile.force_download || !ctx.target.binary_file().exists().await
    }

    async fn install_binary(&self, ctx: &DeployContext, record: &mut DeploymentRecord) -> Result<(), DeployError> {
        let binary = ctx.target.binary_file();
        if !self.needs_download(ctx).await {
            info!("{:?} already installed", binary.path());
            record.binary_sha256 = Some(sha256_file(binary.path()).await?);
            return Ok(());
        }

        let version = self.release.version.as_deref();
        let asset = retry(&self.retry, "Release resolution", |_| {
            self.resolver
                .resolve_tag(&self.release.repo, version, self.platform, self.arch)
        })
        .await?;
        record.release_version = Some(asset.version.clone());

        // The running service keeps serving until the new binary is verified
        let installer = self.installer.clone().with_smoke_test(ctx.profile.smoke_test);
        let staged = installer.stage(&asset, binary.path()).await?;
        if binary.exists().await {
            self.stop_for_upgrade(ctx, record).await?;
        }

        match staged.commit().await? {
            InstallOutcome::Installed { sha256, smoke_test } => {
                record.binary_sha256 = Some(sha256);
                if let SmokeTest::Failed(detail) = smoke_test {
                    record.warn(Warning::SmokeTest(detail));
                }
            }
            InstallOutcome::Skipped => {}
        }
        Ok(())
    }

    async fn stop_for_upgrade(&self, ctx: &DeployContext, record: &mut DeploymentRecord) -> Result<(), DeployError> {
        if ctx.profile.launch_mode != LaunchMode::Service {
            return Ok(());
        }
        let name = &ctx.profile.service_name;
        if self.services.status(name).await.running {
            info!("Stopping {} to replace its binary", name);
            self.services.stop(name).await?;
            record.stopped_for_upgrade = true;
        }
        Ok(())
    }

    async fn open_firewall(&self, profile: &EnvironmentProfile, record: &mut DeploymentRecord) {
        if !profile.manage_firewall {
            debug!("Firewall management disabled for {}", profile.name);
            return;
        }

        for port in profile.required_ports() {
            let rule = profile.firewall_rule_name(port);
            match self.firewall.allow_tcp(&rule, port).await {
                Ok(FirewallChange::Created) | Ok(FirewallChange::AlreadyPresent) => {}
                Ok(FirewallChange::Unmanaged(reason)) => {
                    record.warn(Warning::Firewall(format!(
                        "open tcp/{:?} manually: {}",
                        profile.required_ports(),
                        reason
                    )));
                    return;
                }
                Err(e) => record.warn(Warning::Firewall(format!("{}: {}", rule, e))),
            }
        }
    }

    async fn start_service(&self, ctx: &DeployContext, record: &mut DeploymentRecord) -> Result<(), DeployError> {
        let descriptor = ctx.profile.service_descriptor(&ctx.target, self.services.kind());
        let name = descriptor.name.as_str();

        // A running service keeps its old configuration until restarted.
        let was_running = self.services.status(name).await.running;
        self.services.install(&descriptor).await?;
        if was_running {
            self.services.restart(name).await?;
        } else {
            self.services.start(name).await?;
        }

        let status = self.services.status(name).await;
        if !status.running {
            record.warn(Warning::Service(format!("{} not reported running after start", name)));
        }
        Ok(())
    }

    /// Production failure handling; never changes the error being reported
    async fn roll_back(&self, record: &mut DeploymentRecord) {
        if !record.config_modified {
            info!("Configuration untouched; nothing to roll back");
            self.restart_stopped(record).await;
            return;
        }

        warn!("Rolling back {:?}", record.config_path);
        let manager = RollbackManager::new(self.services.clone());
        match manager.rollback(record).await {
            Ok(backup) => {
                info!("Rolled back to {:?}", backup.backup_path);
                if let Err(e) = record.advance(DeploymentEvent::RolledBack) {
                    warn!("{}", e);
                }
            }
            Err(e) => record.warn(Warning::Rollback(e.to_string())),
        }
    }

    /// Bring back a service stopped for an upgrade that never completed
    async fn restart_stopped(&self, record: &mut DeploymentRecord) {
        if !record.stopped_for_upgrade {
            return;
        }
        if let Some(name) = record.service_name.clone() {
            info!("Restarting {} with its previous binary", name);
            if let Err(e) = self.services.start(&name).await {
                record.warn(Warning::Service(format!("restarting {} failed: {}", name, e)));
            }
        }
    }
}
