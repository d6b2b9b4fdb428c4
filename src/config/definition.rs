//! Pipeline file structure and validation
//!
//! A pipeline file lists its steps in execution order. Steps are declarative:
//! the keys they recognise, their defaults, and the templates used to build
//! the deployment target.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deploy::{DeployMode, HealthCheckConfig, HealthCheckMode, PollSettings};

use super::resolver::{ConfigMap, KeySpec, TEMPLATE_PATTERN};

/// Errors that can occur during pipeline file parsing and validation
#[derive(Error, Debug, PartialEq)]
pub enum PipelineFileError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Pipeline has no steps")]
    NoSteps,

    #[error("Duplicate step name: '{0}'")]
    DuplicateStepName(String),

    #[error("Step '{0}' must publish at least one URL key")]
    NoPublishedUrl(String),

    #[error("Step '{step}' references unknown key '{key}'")]
    UnknownKey { step: String, key: String },
}

/// The complete pipeline file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub steps: Vec<StepDefinition>,
}

/// One step of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepDefinition {
    /// Seeds the configuration envelope; performs no external action
    Config(ConfigStepDefinition),
    /// Deploys or updates one service and publishes its URL
    Service(ServiceStepDefinition),
}

impl StepDefinition {
    pub fn name(&self) -> &str {
        match self {
            StepDefinition::Config(def) => &def.name,
            StepDefinition::Service(def) => &def.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigStepDefinition {
    pub name: String,
    #[serde(default)]
    pub keys: Vec<KeySpec>,
    #[serde(default)]
    pub defaults: ConfigMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStepDefinition {
    pub name: String,

    /// Name of the managed service
    pub service: String,

    #[serde(default)]
    pub action: DeployMode,

    /// Image template, e.g. `{dockerRegistry}/proxy:{proxyVersion}`
    pub image: String,

    #[serde(default = "default_region_template")]
    pub region: String,

    pub port: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    #[serde(default = "default_allow_unauthenticated")]
    pub allow_unauthenticated: bool,

    #[serde(default)]
    pub keys: Vec<KeySpec>,

    #[serde(default)]
    pub defaults: ConfigMap,

    #[serde(default)]
    pub required: Vec<String>,

    /// Environment variable templates injected into the service
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Composite key whose entries are appended to the service environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_from: Option<String>,

    /// Upstream URL key that must hold a real URL before this step acts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<String>,

    /// Envelope keys set to the deployed URL; the first is the primary one
    pub publish: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollOverride>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthOverride>,
}

fn default_region_template() -> String {
    "{region}".to_string()
}

fn default_allow_unauthenticated() -> bool {
    true
}

/// Per-step polling overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
}

impl PollOverride {
    pub fn apply(&self, base: PollSettings) -> PollSettings {
        PollSettings {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            interval: self
                .interval_secs
                .map(Duration::from_secs)
                .unwrap_or(base.interval),
        }
    }
}

/// Per-step health check overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<HealthCheckMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl HealthOverride {
    pub fn apply(&self, base: &HealthCheckConfig) -> HealthCheckConfig {
        HealthCheckConfig {
            path: self.path.clone().unwrap_or_else(|| base.path.clone()),
            mode: self.mode.unwrap_or(base.mode),
            timeout: self
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(base.timeout),
            attempts: self.attempts.or(base.attempts),
        }
    }
}

/// Keys referenced by `{key}` placeholders in a template
pub fn template_keys(template: &str) -> Vec<String> {
    TEMPLATE_PATTERN
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

impl ServiceStepDefinition {
    /// Keys this step resolves: declared keys plus the prerequisite key
    pub fn recognised_keys(&self) -> Vec<KeySpec> {
        let mut keys = self.keys.clone();
        if let Some(requires) = &self.requires {
            if !keys.iter().any(|k| &k.name == requires) {
                keys.push(KeySpec::new(requires));
            }
        }
        keys
    }

    pub fn primary_url_key(&self) -> Option<&str> {
        self.publish.first().map(String::as_str)
    }

    fn templates(&self) -> impl Iterator<Item = &str> {
        [self.image.as_str(), self.region.as_str(), self.port.as_str()]
            .into_iter()
            .chain(self.project.as_deref())
            .chain(self.env.values().map(String::as_str))
    }
}

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

/// Strip C-style comments from JSONC content.
pub fn strip_jsonc_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }

        if c == '\\' && in_string {
            result.push(c);
            escape_next = true;
            continue;
        }

        if c == '"' {
            in_string = !in_string;
            result.push(c);
            continue;
        }

        if !in_string && c == '/' {
            if chars.peek() == Some(&'/') {
                chars.next();
                for nc in chars.by_ref() {
                    if nc == '\n' {
                        result.push('\n');
                        break;
                    }
                }
                continue;
            } else if chars.peek() == Some(&'*') {
                chars.next();
                let mut prev = ' ';
                for nc in chars.by_ref() {
                    if prev == '*' && nc == '/' {
                        break;
                    }
                    prev = nc;
                }
                continue;
            }
        }

        result.push(c);
    }

    result
}

/// Parse a JSON or JSONC pipeline
pub fn parse_pipeline_json(content: &str) -> Result<PipelineFile, PipelineFileError> {
    let stripped = strip_jsonc_comments(content);
    serde_json::from_str(&stripped).map_err(|e| PipelineFileError::ParseError(e.to_string()))
}

/// Parse a YAML pipeline
pub fn parse_pipeline_yaml(content: &str) -> Result<PipelineFile, PipelineFileError> {
    serde_yaml::from_str(content).map_err(|e| PipelineFileError::ParseError(e.to_string()))
}

/// Validate a pipeline for consistency.
pub fn validate_pipeline(pipeline: &PipelineFile) -> Result<(), PipelineFileError> {
    if pipeline.steps.is_empty() {
        return Err(PipelineFileError::NoSteps);
    }

    let mut names = HashSet::new();
    for step in &pipeline.steps {
        if !names.insert(step.name()) {
            return Err(PipelineFileError::DuplicateStepName(step.name().to_string()));
        }

        let StepDefinition::Service(def) = step else {
            continue;
        };

        if def.publish.is_empty() {
            return Err(PipelineFileError::NoPublishedUrl(def.name.clone()));
        }

        let known: HashSet<String> = def
            .recognised_keys()
            .into_iter()
            .map(|k| k.name)
            .collect();

        let referenced = def
            .templates()
            .flat_map(template_keys)
            .chain(def.required.iter().cloned())
            .chain(def.env_from.iter().cloned());

        for key in referenced {
            if !known.contains(&key) {
                return Err(PipelineFileError::UnknownKey {
                    step: def.name.clone(),
                    key,
                });
            }
        }
    }

    Ok(())
}

impl PipelineFile {
    /// Parse and validate JSON/JSONC content
    pub fn from_json(content: &str) -> Result<Self, PipelineFileError> {
        let pipeline = parse_pipeline_json(content)?;
        validate_pipeline(&pipeline)?;
        Ok(pipeline)
    }

    /// Parse and validate YAML content
    pub fn from_yaml(content: &str) -> Result<Self, PipelineFileError> {
        let pipeline = parse_pipeline_yaml(content)?;
        validate_pipeline(&pipeline)?;
        Ok(pipeline)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(StepDefinition::name).collect()
    }
}
