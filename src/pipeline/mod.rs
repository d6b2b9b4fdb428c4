//! Deployment pipeline: ordered steps passing a configuration envelope.

pub mod envelope;
pub mod runner;
pub mod standard;
pub mod step;

pub use envelope::{ConfigEnvelope, PipelineMessage, StepResult};
pub use runner::{PipelineReport, PipelineRunner, PlannedStep};
pub use standard::standard_pipeline;
pub use step::{
    build_target, ConfigStep, PipelineStep, ServiceStep, StepContext, StepPlan, StepState,
    PLACEHOLDER_MARKER,
};
