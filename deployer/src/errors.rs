//! Error types for the deployer

use thiserror::Error;

/// Main error type for the deployer
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Release feed could not be queried
    #[error("Transport error: {0}")]
    TransportError(String),

    /// No release asset matched the requested platform
    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    /// Downloaded artifact is empty or has the wrong size
    #[error("Verification error: {0}")]
    VerificationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Readiness timeout: service on port {port} not ready after {timeout_secs}s")]
    ReadinessTimeout { port: u16, timeout_secs: u64 },

    #[error("Lock contention: {0}")]
    LockContentionError(String),

    #[error("No backup available: {0}")]
    NoBackupError(String),

    #[error("Pre-flight check failed: {0}")]
    PreflightError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Invalid state transition: {0}")]
    StateError(String),
}

impl DeployError {
    /// Whether a bounded retry of the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeployError::TransportError(_)
                | DeployError::DownloadError(_)
                | DeployError::VerificationError(_)
                | DeployError::HttpError(_)
        )
    }

    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::IoError(_) => "io",
            DeployError::JsonError(_) => "json",
            DeployError::HttpError(_) => "http",
            DeployError::TransportError(_) => "transport",
            DeployError::NotFoundError(_) => "not_found",
            DeployError::DownloadError(_) => "download",
            DeployError::VerificationError(_) => "verification",
            DeployError::ConfigurationError(_) => "configuration",
            DeployError::ServiceError(_) => "service",
            DeployError::ReadinessTimeout { .. } => "readiness_timeout",
            DeployError::LockContentionError(_) => "lock_contention",
            DeployError::NoBackupError(_) => "no_backup",
            DeployError::PreflightError(_) => "preflight",
            DeployError::ProcessError(_) => "process",
            DeployError::StateError(_) => "state",
        }
    }
}
