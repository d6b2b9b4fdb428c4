//! Deployment primitives: targets, command issuing, readiness polling and
//! health probing against a Cloud Run style CLI.

pub mod executor;
pub mod gcloud;
pub mod health;
pub mod issuer;
pub mod poller;
pub mod target;

pub use executor::{CommandExecutor, CommandOutput, ProcessExecutor};
pub use health::{HealthCheckConfig, HealthCheckMode, HealthChecker, HealthProbe, HealthProbeResult};
pub use issuer::{CommandIssuer, DeployMode};
pub use poller::{DeploymentPoller, PollSettings};
pub use target::{DeploymentTarget, ImageRef};

use std::time::Duration;

use thiserror::Error;

/// Errors raised while deploying one target
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeployError {
    #[error("Missing required configuration: {}", .fields.join(", "))]
    MissingConfig { fields: Vec<String> },

    #[error("Invalid deployment target: {0}")]
    InvalidTarget(String),

    #[error("Failed to spawn {program}: {message}")]
    SpawnFailed { program: String, message: String },

    #[error("Command failed ({exit_info}): {stderr}")]
    CommandFailed {
        exit_info: String,
        stdout: String,
        stderr: String,
    },

    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("Command output exceeded {limit} bytes")]
    OutputLimitExceeded { limit: usize },

    #[error("Deployment '{resource}' not ready after {attempts} attempts")]
    PollTimeout { resource: String, attempts: u32 },

    #[error("No URL reported for '{0}'")]
    UrlUnavailable(String),

    #[error("Health check failed for {0}")]
    HealthCheckFailed(String),
}

impl DeployError {
    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::MissingConfig { .. } => "missing_config",
            DeployError::InvalidTarget(_) => "invalid_target",
            DeployError::SpawnFailed { .. } => "spawn_failed",
            DeployError::CommandFailed { .. } => "command_failed",
            DeployError::CommandTimeout(_) => "command_timeout",
            DeployError::OutputLimitExceeded { .. } => "output_limit_exceeded",
            DeployError::PollTimeout { .. } => "poll_timeout",
            DeployError::UrlUnavailable(_) => "url_unavailable",
            DeployError::HealthCheckFailed(_) => "health_check_failed",
        }
    }

    /// Captured stderr, when the failure came from a command
    pub fn stderr(&self) -> Option<&str> {
        match self {
            DeployError::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}
