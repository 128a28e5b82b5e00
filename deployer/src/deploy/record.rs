//! Deployment records and the warning channel

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use crate::errors::DeployError;
use crate::provision::ProvisioningWarning;

/// A non-fatal condition met during a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Warning {
    /// `version` on the installed binary did not succeed
    SmokeTest(String),
    Provisioning(ProvisioningWarning),
    Firewall(String),
    Rollback(String),
    Service(String),
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::SmokeTest(detail) => write!(f, "smoke test: {}", detail),
            Warning::Provisioning(w) => write!(f, "provisioning: {}", w),
            Warning::Firewall(detail) => write!(f, "firewall: {}", detail),
            Warning::Rollback(detail) => write!(f, "rollback: {}", detail),
            Warning::Service(detail) => write!(f, "service: {}", detail),
        }
    }
}

/// Summary of how an attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    SucceededWithWarnings,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: DeploymentState,
    pub to: DeploymentState,
    pub at: DateTime<Utc>,
}

/// History of one deployment attempt
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub environment: String,
    pub config_path: PathBuf,

    /// Set when the server runs as a registered service; rollback restarts it
    pub service_name: Option<String>,
    pub status: DeploymentState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<Transition>,
    pub warnings: Vec<Warning>,
    pub errors: Vec<String>,
    pub release_version: Option<String>,
    pub binary_sha256: Option<String>,

    /// Whether this attempt started rewriting the live configuration
    pub config_modified: bool,

    /// Backup taken before the configuration was regenerated
    pub config_backup: Option<PathBuf>,

    /// The running service was stopped so its binary could be replaced
    pub stopped_for_upgrade: bool,

    /// GUI address confirmed by the readiness probe
    pub url: Option<String>,

    /// Whether the administrative secret supplied to this attempt is in effect
    pub secret_applied: bool,

    #[serde(skip)]
    fsm: DeploymentFsm,
}

impl DeploymentRecord {
    pub fn new(environment: &str, config_path: impl Into<PathBuf>, service_name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            environment: environment.to_string(),
            config_path: config_path.into(),
            service_name,
            status: DeploymentState::Init,
            started_at: now,
            updated_at: now,
            finished_at: None,
            transitions: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            release_version: None,
            binary_sha256: None,
            config_modified: false,
            config_backup: None,
            stopped_for_upgrade: false,
            url: None,
            secret_applied: false,
            fsm: DeploymentFsm::new(),
        }
    }

    /// Apply `event` and record the transition
    pub fn advance(&mut self, event: DeploymentEvent) -> Result<DeploymentState, DeployError> {
        let from = self.fsm.state();
        let to = self.fsm.process(event)?;
        let now = Utc::now();

        debug!("Deployment state {:?} -> {:?}", from, to);
        self.transitions.push(Transition { from, to, at: now });
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(to)
    }

    /// Move to FAILED, keeping `error` in the record
    pub fn fail(&mut self, error: &DeployError) {
        self.errors.push(error.to_string());
        if let Err(e) = self.advance(DeploymentEvent::Fail(error.to_string())) {
            debug!("Failure not recorded as a transition: {}", e);
        }
    }

    pub fn warn(&mut self, warning: Warning) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }

    /// Stage the failure happened in, when the attempt failed
    pub fn failed_stage(&self) -> Option<DeploymentState> {
        self.transitions
            .iter()
            .find(|t| t.to == DeploymentState::Failed)
            .map(|t| t.from)
    }

    pub fn outcome(&self) -> Outcome {
        match self.status {
            DeploymentState::Ready if self.warnings.is_empty() => Outcome::Succeeded,
            DeploymentState::Ready => Outcome::SucceededWithWarnings,
            _ => Outcome::Failed,
        }
    }
}
