//! Readiness polling
//!
//! A deployment is ready once the platform reports its first condition as
//! `True`. The poller sleeps only between attempts, so a service that is
//! ready on the first query costs no wait at all.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::executor::CommandExecutor;
use super::gcloud::{generate_ready_args, generate_url_args, parse_ready_flag, parse_service_url};
use super::target::DeploymentTarget;
use super::DeployError;

/// Bounded polling schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct DeploymentPoller {
    executor: Arc<dyn CommandExecutor>,
    program: String,
}

impl DeploymentPoller {
    pub fn new(executor: Arc<dyn CommandExecutor>, program: impl Into<String>) -> Self {
        Self {
            executor,
            program: program.into(),
        }
    }

    /// One readiness query. A failed query counts as not ready.
    async fn is_ready(&self, target: &DeploymentTarget) -> bool {
        match self.executor.run(&self.program, &generate_ready_args(target)).await {
            Ok(output) => parse_ready_flag(&output.stdout),
            Err(e) => {
                warn!(service = %target.name, error = %e, "Readiness query failed");
                false
            }
        }
    }

    /// Wait until the target is ready, then return its public URL
    pub async fn await_ready(
        &self,
        target: &DeploymentTarget,
        settings: PollSettings,
    ) -> Result<String, DeployError> {
        let mut ready = false;

        for attempt in 1..=settings.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(settings.interval).await;
            }

            if self.is_ready(target).await {
                info!(service = %target.name, attempt, "Deployment ready");
                ready = true;
                break;
            }

            debug!(
                service = %target.name,
                attempt,
                max_attempts = settings.max_attempts,
                "Deployment not ready yet"
            );
        }

        if !ready {
            return Err(DeployError::PollTimeout {
                resource: target.name.clone(),
                attempts: settings.max_attempts,
            });
        }

        let output = self
            .executor
            .run(&self.program, &generate_url_args(target))
            .await?;

        parse_service_url(&output.stdout).ok_or_else(|| DeployError::UrlUnavailable(target.name.clone()))
    }
}
