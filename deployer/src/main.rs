//! velodeploy - Entry Point
//!
//! Deploys a Velociraptor server and manages it as an OS service.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand};
use colored::Colorize;
use secrecy::{ExposeSecret, SecretString};
use tracing::{error, info};

use velodeploy::deploy::orchestrator::{DeployContext, Orchestrator};
use velodeploy::deploy::record::{DeploymentRecord, Outcome};
use velodeploy::deploy::rollback::RollbackManager;
use velodeploy::filesys::file::File;
use velodeploy::logs::{init_logging, LogLevel, LogOptions};
use velodeploy::process::supervisor::SupervisedProcess;
use velodeploy::services::{service_manager, PlatformKind, ServiceDescriptor, ServiceManager};
use velodeploy::storage::settings::Settings;
use velodeploy::utils::{generate_secret, version_info};

/// Environment variable holding the administrator password
const ADMIN_PASSWORD_ENV: &str = "VELODEPLOY_ADMIN_PASSWORD";

#[derive(Parser)]
#[command(name = "velodeploy")]
#[command(about = "Deploy and manage a Velociraptor server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (JSON); built-in defaults when omitted
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install, configure and start the server for an environment
    Deploy(DeployArgs),

    /// Register an installed binary as a service
    Install(InstallArgs),

    /// Remove the service registration
    Uninstall(ServiceName),

    Start(ServiceName),

    Stop(ServiceName),

    /// Stop, wait, start
    Restart(ServiceName),

    /// Print the service status as JSON
    Status(ServiceName),

    /// Print recent service log lines
    Logs {
        #[command(flatten)]
        service: ServiceName,

        /// Number of lines
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Restore the most recent configuration backup
    Rollback {
        /// Live configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Service to restart afterwards
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Print version information as JSON
    Version,
}

#[derive(Args)]
struct DeployArgs {
    /// Environment profile
    #[arg(short, long, default_value = "staging")]
    environment: String,

    /// Release tag to install instead of the latest release
    #[arg(long)]
    version: Option<String>,

    /// Download the binary even when one is installed
    #[arg(long)]
    force_download: bool,
}

#[derive(Args)]
struct ServiceName {
    /// Service name
    #[arg(short, long, default_value = "velociraptor")]
    name: String,
}

#[derive(Args)]
struct InstallArgs {
    #[command(flatten)]
    service: ServiceName,

    /// Server binary
    #[arg(long)]
    binary: PathBuf,

    /// Server configuration file
    #[arg(long)]
    config: PathBuf,

    /// Working directory; defaults to the binary's directory
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Writable data directory; defaults to the working directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Account the service runs as
    #[arg(long)]
    run_as_user: Option<String>,

    /// Start at boot
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    auto_start: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{}", e),
        }
        return ExitCode::SUCCESS;
    }

    let settings = match load_settings(cli.settings.as_deref()).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    // Logs go to stderr; stdout carries summaries and JSON output.
    let log_options = LogOptions {
        log_level: cli.log_level.clone().unwrap_or_else(|| settings.log_level.clone()),
        log_dir: settings.log_dir.clone(),
        json_format: settings.json_logs,
        ..Default::default()
    };
    let _guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let result = match cli.command {
        Commands::Deploy(args) => deploy(settings, args).await,
        command => manage(command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    Settings::load(path)
        .await
        .with_context(|| format!("Unable to read settings file {:?}", path.unwrap_or(Path::new("-"))))
}

async fn deploy(mut settings: Settings, args: DeployArgs) -> anyhow::Result<()> {
    if args.version.is_some() {
        settings.release.version = args.version.clone();
    }
    let mut profile = settings
        .profile(&args.environment)
        .ok_or_else(|| anyhow!("Unknown environment '{}'", args.environment))?;
    if args.force_download {
        profile.force_download = true;
    }

    let (secret, generated) = admin_secret();
    let admin_username = profile.admin_username.clone();
    let ctx = DeployContext::new(profile, secret);
    let orchestrator = Orchestrator::new(&settings)?;

    // Dropping the deployment releases its lock, removes partial downloads
    // and kills any child it started.
    let outcome = tokio::select! {
        result = orchestrator.deploy(&ctx) => result,
        _ = await_shutdown_signal() => bail!("Deployment interrupted"),
    };

    let generated_secret = generated.then_some(&ctx.admin_secret);
    match outcome {
        Ok(mut deployment) => {
            print_summary(&deployment.record, &admin_username, generated_secret);
            if let Some(process) = deployment.foreground.take() {
                run_foreground(process).await?;
            }
            Ok(())
        }
        Err(failure) => {
            print_summary(&failure.record, &admin_username, generated_secret);
            Err(failure.into())
        }
    }
}

async fn run_foreground(mut process: SupervisedProcess) -> anyhow::Result<()> {
    info!("Server running in the foreground (pid {}); Ctrl+C stops it", process.pid());

    let exited = tokio::select! {
        handle = process.wait() => Some(handle?),
        _ = await_shutdown_signal() => None,
    };

    match exited {
        Some(handle) => bail!("Server exited unexpectedly with {:?}", handle.exit_code),
        None => {
            process.terminate().await?;
            Ok(())
        }
    }
}

/// Service verbs other than deploy
async fn manage(command: Commands) -> anyhow::Result<()> {
    let services = service_manager(PlatformKind::detect());

    match command {
        Commands::Install(args) => install(services.as_ref(), args).await?,
        Commands::Uninstall(service) => {
            services.uninstall(&service.name).await?;
            println!("{} uninstalled", service.name);
        }
        Commands::Start(service) => {
            services.start(&service.name).await?;
            println!("{} started", service.name);
        }
        Commands::Stop(service) => {
            services.stop(&service.name).await?;
            println!("{} stopped", service.name);
        }
        Commands::Restart(service) => {
            services.restart(&service.name).await?;
            println!("{} restarted", service.name);
        }
        Commands::Status(service) => {
            let status = services.status(&service.name).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Logs { service, lines } => {
            for line in services.logs(&service.name, lines).await? {
                println!("{}", line);
            }
        }
        Commands::Rollback { config, name } => {
            let backup = RollbackManager::new(services.clone())
                .restore(&config, name.as_deref())
                .await?;
            println!("Restored {:?} from {:?}", config, backup.backup_path);
        }
        Commands::Deploy(_) | Commands::Version => bail!("Not a service command"),
    }
    Ok(())
}

async fn install(services: &dyn ServiceManager, args: InstallArgs) -> anyhow::Result<()> {
    if !File::new(&args.binary).exists().await {
        bail!("Binary {:?} does not exist", args.binary);
    }
    let working_directory = match args.working_dir {
        Some(dir) => dir,
        None => args
            .binary
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("Cannot derive a working directory from {:?}", args.binary))?,
    };

    let descriptor = ServiceDescriptor {
        name: args.service.name.clone(),
        platform_kind: services.kind(),
        run_as_user: args.run_as_user,
        data_dir: args.data_dir.unwrap_or_else(|| working_directory.clone()),
        working_directory,
        binary_path: args.binary,
        config_path: args.config,
        auto_start: args.auto_start,
        description: "Velociraptor server".to_string(),
    };
    services.install(&descriptor).await?;
    println!("{} installed", descriptor.name);
    Ok(())
}

/// Password from the environment, or a generated one
fn admin_secret() -> (SecretString, bool) {
    match std::env::var(ADMIN_PASSWORD_ENV) {
        Ok(value) if !value.is_empty() => (SecretString::from(value), false),
        _ => (SecretString::from(generate_secret()), true),
    }
}

fn print_summary(record: &DeploymentRecord, admin_username: &str, generated_secret: Option<&SecretString>) {
    let status = match record.outcome() {
        Outcome::Succeeded => record.status.as_str().green().bold(),
        Outcome::SucceededWithWarnings => format!("{} (with warnings)", record.status.as_str())
            .yellow()
            .bold(),
        Outcome::Failed => record.status.as_str().red().bold(),
    };

    println!();
    println!("{} {}", "Deployment".bold(), status);
    println!("  environment: {}", record.environment);
    println!("  id:          {}", record.id);
    if let Some(version) = &record.release_version {
        println!("  release:     {}", version);
    }
    if let Some(sha256) = &record.binary_sha256 {
        println!("  sha256:      {}", sha256);
    }
    println!("  config:      {}", record.config_path.display());
    if let Some(url) = &record.url {
        println!("  url:         {}", url.cyan());
    }
    for warning in &record.warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }
    for error in &record.errors {
        println!("  {} {}", "error:".red(), error);
    }

    if record.secret_applied {
        match generated_secret {
            Some(secret) => {
                println!("  admin:       {} / {}", admin_username, secret.expose_secret());
                println!(
                    "  {}",
                    "This password was generated; change it after the first login.".yellow()
                );
            }
            None => println!("  admin:       {} (password from {})", admin_username, ADMIN_PASSWORD_ENV),
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down...");
        }
    }
}
