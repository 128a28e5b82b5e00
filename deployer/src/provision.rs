//! Administrative principal provisioning
//!
//! Best effort: a failed `user add` never fails a deployment. When it does
//! fail, `user show` is used to tell an existing account apart from a real
//! problem.

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::exec::COMMAND_TIMEOUT;
use crate::managed::ManagedBinary;

/// Why provisioning did not verifiably create the account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningWarning {
    pub username: String,
    pub detail: String,
}

impl std::fmt::Display for ProvisioningWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "principal '{}' not verified: {}", self.username, self.detail)
    }
}

/// Result of provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningResult {
    /// The account was created with the supplied secret
    Created,

    /// `user add` failed but the account is present; its secret is unchanged
    AlreadyExists(ProvisioningWarning),

    /// `user add` failed and the account could not be found
    Unverified(ProvisioningWarning),
}

impl ProvisioningResult {
    pub fn warning(&self) -> Option<&ProvisioningWarning> {
        match self {
            ProvisioningResult::Created => None,
            ProvisioningResult::AlreadyExists(w) | ProvisioningResult::Unverified(w) => Some(w),
        }
    }

    /// Whether the supplied secret is now the account's secret
    pub fn secret_applied(&self) -> bool {
        matches!(self, ProvisioningResult::Created)
    }
}

/// Creates the administrative account through the binary's user commands
#[derive(Debug, Clone)]
pub struct PrincipalProvisioner {
    command_timeout: Duration,
}

impl Default for PrincipalProvisioner {
    fn default() -> Self {
        Self {
            command_timeout: COMMAND_TIMEOUT,
        }
    }
}

impl PrincipalProvisioner {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    pub async fn create_admin_principal(
        &self,
        binary_path: &Path,
        config_path: &Path,
        username: &str,
        secret: &SecretString,
    ) -> ProvisioningResult {
        let binary = ManagedBinary::new(binary_path).with_timeout(self.command_timeout);
        info!("Provisioning administrator '{}'", username);

        let detail = match binary.add_admin_user(username, secret, config_path).await {
            Ok(output) if output.success() => {
                info!("Administrator '{}' created", username);
                return ProvisioningResult::Created;
            }
            // stderr may echo the command line, so only the exit code is kept.
            Ok(output) => format!("user add exited with {:?}", output.code),
            Err(e) => e.to_string(),
        };

        let warning = ProvisioningWarning {
            username: username.to_string(),
            detail,
        };

        match binary.show_user(username, config_path).await {
            Ok(output) if output.success() => {
                warn!("Administrator '{}' already exists; secret left unchanged", username);
                ProvisioningResult::AlreadyExists(warning)
            }
            _ => {
                warn!("{}", warning);
                ProvisioningResult::Unverified(warning)
            }
        }
    }
}
