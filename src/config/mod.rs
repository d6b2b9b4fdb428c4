pub mod definition;
pub mod environment;
pub mod resolver;
pub mod settings;

pub use definition::{
    parse_pipeline_json, parse_pipeline_yaml, strip_jsonc_comments, validate_pipeline,
    ConfigStepDefinition, HealthOverride, PipelineFile, PipelineFileError, PollOverride,
    ServiceStepDefinition, StepDefinition,
};
pub use environment::Environment;
pub use resolver::{resolve, ConfigMap, ConfigValue, EffectiveConfig, KeySpec};
pub use settings::{DeploySettings, RateLimitPolicy, RelaySettings, Settings, StoreSettings};

use std::path::Path;
use thiserror::Error;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Pipeline error: {0}")]
    PipelineError(#[from] PipelineFileError),

    #[error("Failed to load env file {0}")]
    EnvFile(String),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and parse a pipeline file from disk.
///
/// `.yaml`/`.yml` files are read as YAML; everything else as JSON or JSONC.
pub fn load_pipeline_file(path: &Path) -> Result<PipelineFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

    let pipeline = if is_yaml {
        PipelineFile::from_yaml(&content)?
    } else {
        PipelineFile::from_json(&content)?
    };
    Ok(pipeline)
}
