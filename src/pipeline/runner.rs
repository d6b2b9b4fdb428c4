//! Sequential pipeline execution

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::{PipelineFile, StepDefinition};

use super::envelope::{ConfigEnvelope, PipelineMessage};
use super::step::{ConfigStep, PipelineStep, ServiceStep, StepContext, StepPlan};

/// Outcome of a whole pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<PipelineMessage>,
    /// Envelope emitted by the last step
    pub config: ConfigEnvelope,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(|m| m.payload.is_success())
    }

    pub fn message(&self, step: &str) -> Option<&PipelineMessage> {
        self.steps.iter().find(|m| m.step == step)
    }
}

/// Dry-run entry for one step
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    pub step: String,
    #[serde(flatten)]
    pub plan: StepPlan,
}

/// Owns an ordered list of steps and runs them one after another
pub struct PipelineRunner {
    steps: Vec<Arc<dyn PipelineStep>>,
}

impl PipelineRunner {
    pub fn new(steps: Vec<Arc<dyn PipelineStep>>) -> Self {
        Self { steps }
    }

    /// Instantiate every step of a pipeline definition
    pub fn from_definition(pipeline: &PipelineFile, ctx: &StepContext) -> Self {
        let steps = pipeline
            .steps
            .iter()
            .map(|def| -> Arc<dyn PipelineStep> {
                match def {
                    StepDefinition::Config(def) => {
                        Arc::new(ConfigStep::new(def.clone(), ctx.env.clone()))
                    }
                    StepDefinition::Service(def) => {
                        Arc::new(ServiceStep::new(def.clone(), ctx.clone()))
                    }
                }
            })
            .collect();
        Self::new(steps)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order. Each step starts only after its predecessor
    /// has emitted, and receives that predecessor's envelope.
    pub async fn run(&self, seed: ConfigEnvelope) -> PipelineReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, steps = self.steps.len(), "Pipeline started");

        let mut envelope = seed;
        let mut messages = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let message = step.run(envelope).await;
            debug_assert!(message.trace.last().is_some_and(|s| s.is_terminal()));
            info!(
                %run_id,
                step = %message.step,
                status = message.payload.status(),
                "Step finished"
            );
            envelope = message.config.clone();
            messages.push(message);
        }

        let report = PipelineReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            steps: messages,
            config: envelope,
        };
        info!(%run_id, succeeded = report.succeeded(), "Pipeline finished");
        report
    }

    /// Plan every step without running anything
    pub fn plan(&self, seed: ConfigEnvelope) -> Vec<PlannedStep> {
        let mut envelope = seed;
        self.steps
            .iter()
            .map(|step| {
                let (next, plan) = step.plan(&envelope);
                envelope = next;
                PlannedStep {
                    step: step.name().to_string(),
                    plan,
                }
            })
            .collect()
    }
}
