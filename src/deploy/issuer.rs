use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::executor::{CommandExecutor, CommandOutput};
use super::gcloud::{generate_deploy_args, generate_update_args};
use super::target::DeploymentTarget;
use super::DeployError;

/// Whether a step creates a service or updates an existing one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    #[default]
    Deploy,
    Update,
}

impl fmt::Display for DeployMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployMode::Deploy => write!(f, "deploy"),
            DeployMode::Update => write!(f, "update"),
        }
    }
}

impl FromStr for DeployMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deploy" => Ok(DeployMode::Deploy),
            "update" => Ok(DeployMode::Update),
            other => Err(format!("unknown deploy mode '{}'", other)),
        }
    }
}

/// Issues create/update commands for deployment targets
#[derive(Clone)]
pub struct CommandIssuer {
    executor: Arc<dyn CommandExecutor>,
    program: String,
}

impl CommandIssuer {
    pub fn new(executor: Arc<dyn CommandExecutor>, program: impl Into<String>) -> Self {
        Self {
            executor,
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument vector that `issue` would run
    pub fn command_for(&self, target: &DeploymentTarget, mode: DeployMode) -> Vec<String> {
        match mode {
            DeployMode::Deploy => generate_deploy_args(target),
            DeployMode::Update => generate_update_args(target),
        }
    }

    /// Validate the target, then run its deploy or update command
    pub async fn issue(
        &self,
        target: &DeploymentTarget,
        mode: DeployMode,
    ) -> Result<CommandOutput, DeployError> {
        target.validate()?;

        let args = self.command_for(target, mode);
        info!(
            service = %target.name,
            image = %target.image,
            region = %target.region,
            %mode,
            "Issuing deployment"
        );

        self.executor.run(&self.program, &args).await
    }
}
