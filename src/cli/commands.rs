//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, printing is handled by the caller

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::{DeployArgs, ServeArgs};
use crate::config::{load_pipeline_file, ConfigError, Environment, PipelineFile, Settings};
use crate::deploy::{HealthChecker, ProcessExecutor};
use crate::pipeline::{standard_pipeline, ConfigEnvelope, PipelineRunner, StepContext};
use crate::relay::RelayError;
use crate::server::{create_router, AppState};
use crate::store::memory::default_persist_path;
use crate::store::{connect_store, StoreError};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Pipeline commands
// ============================================================================

/// Process environment, overlaid with an optional .env file
pub fn load_environment(env_file: Option<&Path>) -> Result<Environment, ConfigError> {
    let env = Environment::from_process();
    match env_file {
        Some(path) => env.with_env_file(path),
        None => Ok(env),
    }
}

/// Pipeline from a file, or the standard pipeline
pub fn load_pipeline(path: Option<&Path>, env: &Environment) -> Result<PipelineFile, ConfigError> {
    match path {
        Some(path) => load_pipeline_file(path),
        None => Ok(standard_pipeline(env)),
    }
}

/// Envelope seeded from `--set` pairs
pub fn seed_envelope(pairs: &[(String, String)]) -> ConfigEnvelope {
    let mut envelope = ConfigEnvelope::new();
    for (key, value) in pairs {
        envelope.insert(key.clone(), value.clone());
    }
    envelope
}

/// Runner wired to the real `gcloud` executor and HTTP health checks
pub fn build_runner(pipeline: &PipelineFile, env: &Environment) -> PipelineRunner {
    let settings = Settings::from_env(env);
    let ctx = StepContext::new(
        Arc::new(ProcessExecutor::from_settings(&settings.deploy)),
        Arc::new(HealthChecker::new()),
        env.clone(),
        settings.deploy,
    );
    PipelineRunner::from_definition(pipeline, &ctx)
}

/// Rendered outcome of `deploy`
#[derive(Debug)]
pub struct DeployOutput {
    pub text: String,
    pub succeeded: bool,
}

pub async fn deploy(args: &DeployArgs, env: &Environment) -> CommandResult<DeployOutput> {
    let pipeline = load_pipeline(args.pipeline.as_deref(), env)?;
    let runner = build_runner(&pipeline, env);
    let seed = seed_envelope(&args.set);

    if args.dry_run {
        let plan = runner.plan(seed);
        let text = if args.json {
            serde_json::to_string_pretty(&plan)?
        } else {
            super::format_plan(&plan)
        };
        return Ok(DeployOutput {
            text,
            succeeded: true,
        });
    }

    info!(steps = ?runner.step_names(), "Running pipeline");
    let report = runner.run(seed).await;
    let text = if args.json {
        serde_json::to_string_pretty(&report)?
    } else {
        super::format_report(&report)
    };

    Ok(DeployOutput {
        text,
        succeeded: report.succeeded(),
    })
}

/// Parse and validate a pipeline file
pub fn validate_pipeline_file(path: &Path) -> ValidationResult {
    match load_pipeline_file(path) {
        Ok(pipeline) => ValidationResult {
            valid: true,
            steps: pipeline.step_names().into_iter().map(String::from).collect(),
            error: None,
        },
        Err(e) => ValidationResult {
            valid: false,
            steps: Vec::new(),
            error: Some(e.to_string()),
        },
    }
}

/// Result of validating a pipeline file
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub steps: Vec<String>,
    pub error: Option<String>,
}

// ============================================================================
// Server command
// ============================================================================

/// Build the server state from the environment
pub async fn build_state(args: &ServeArgs, env: &Environment) -> CommandResult<AppState> {
    let mut settings = Settings::from_env(env);
    if args.persist_store && settings.store.persist_path.is_none() {
        settings.store.persist_path = default_persist_path();
        if settings.store.persist_path.is_none() {
            warn!("No user data directory; the in-memory store will not persist");
        }
    }

    let store = connect_store(&settings.store).await?;
    Ok(AppState::new(store, settings.relay)?)
}

pub async fn serve(args: &ServeArgs, env: &Environment) -> CommandResult<()> {
    let state = build_state(args, env).await?;
    let addr = format!("{}:{}", args.bind_addr, args.port);

    info!(
        backend = state.backend(),
        upstream = state.relay.upstream(),
        "Starting cloudflow relay on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET    /health              - Health check");
    info!("  GET    /api/ping            - Store backend check");
    info!("  PUT    /api/keys            - Issue an API key");
    info!("  GET    /api/keys            - List API keys");
    info!("  DELETE /api/keys            - Revoke an API key");
    info!("  GET    /v1/models           - Model list");
    info!("  POST   /v1/chat/completions - OpenAI-compatible chat endpoint");

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
