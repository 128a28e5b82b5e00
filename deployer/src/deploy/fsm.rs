//! Finite State Machine for a deployment attempt

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    /// Created, nothing checked yet
    Init,

    /// Privilege, lock, network, disk and port checks
    Preflight,

    /// Resolving and installing the binary
    Downloading,

    /// Generating and patching the server configuration
    Configuring,

    /// Creating the administrative principal
    Provisioning,

    /// Firewall rules, service registration or direct launch
    ServiceStarting,

    /// Waiting for the GUI to answer
    Verifying,

    /// Service verified reachable
    Ready,

    /// Attempt failed
    Failed,

    /// Attempt failed and the previous configuration was restored
    RolledBack,
}

impl DeploymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Init => "INIT",
            DeploymentState::Preflight => "PREFLIGHT",
            DeploymentState::Downloading => "DOWNLOADING",
            DeploymentState::Configuring => "CONFIGURING",
            DeploymentState::Provisioning => "PROVISIONING",
            DeploymentState::ServiceStarting => "SERVICE_STARTING",
            DeploymentState::Verifying => "VERIFYING",
            DeploymentState::Ready => "READY",
            DeploymentState::Failed => "FAILED",
            DeploymentState::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Ready | DeploymentState::Failed | DeploymentState::RolledBack
        )
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Start the attempt
    Begin,

    PreflightPassed,

    /// Binary installed or already present
    Downloaded,

    Configured,

    Provisioned,

    /// Service registered and started, or process launched
    ServiceStarted,

    /// Readiness confirmed
    Verified,

    /// Stage failed
    Fail(String),

    /// Rollback succeeded
    RolledBack,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentState,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in the initial state
    pub fn new() -> Self {
        Self {
            state: DeploymentState::Init,
            error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentState, DeployError> {
        let new_state = match (self.state, &event) {
            (DeploymentState::Init, DeploymentEvent::Begin) => DeploymentState::Preflight,
            (DeploymentState::Preflight, DeploymentEvent::PreflightPassed) => DeploymentState::Downloading,
            (DeploymentState::Downloading, DeploymentEvent::Downloaded) => DeploymentState::Configuring,
            (DeploymentState::Configuring, DeploymentEvent::Configured) => DeploymentState::Provisioning,
            (DeploymentState::Provisioning, DeploymentEvent::Provisioned) => DeploymentState::ServiceStarting,
            (DeploymentState::ServiceStarting, DeploymentEvent::ServiceStarted) => DeploymentState::Verifying,
            (DeploymentState::Verifying, DeploymentEvent::Verified) => DeploymentState::Ready,

            // Any stage may fail
            (state, DeploymentEvent::Fail(err)) if !state.is_terminal() => {
                self.error = Some(err.clone());
                DeploymentState::Failed
            }

            (DeploymentState::Failed, DeploymentEvent::RolledBack) => DeploymentState::RolledBack,

            // Invalid transitions
            (state, event) => {
                return Err(DeployError::StateError(format!(
                    "Invalid transition: {:?} -> {:?}",
                    state, event
                )));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
