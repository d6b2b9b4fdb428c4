//! Deployment targets
//!
//! A target identifies one managed service and everything needed to deploy
//! it. Targets are built per invocation from an effective configuration and
//! are never persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::DeployError;

static SERVICE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]([-a-z0-9]{0,61}[a-z0-9])?$").expect("valid service name pattern"));

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid env name pattern"));

/// Container image reference: `registry/repository:tag`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
}

impl ImageRef {
    pub fn new(registry: Option<&str>, repository: &str, tag: Option<&str>) -> Self {
        Self {
            registry: registry.map(String::from),
            repository: repository.to_string(),
            tag: tag.map(String::from),
        }
    }

    /// Split a full image reference into its parts
    pub fn parse(reference: &str) -> Result<Self, DeployError> {
        let reference = reference.trim();
        if reference.is_empty() || reference.chars().any(char::is_whitespace) {
            return Err(DeployError::InvalidTarget(format!(
                "invalid image reference '{}'",
                reference
            )));
        }

        let (registry, rest) = match reference.rsplit_once('/') {
            Some((registry, rest)) => (Some(registry), rest),
            None => (None, reference),
        };

        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.is_empty() => (repo, Some(tag)),
            _ => (rest, None),
        };

        if repository.is_empty() || registry.is_some_and(str::is_empty) {
            return Err(DeployError::InvalidTarget(format!(
                "invalid image reference '{}'",
                reference
            )));
        }

        Ok(Self::new(registry, repository, tag))
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{}/", registry)?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        Ok(())
    }
}

/// One external service to create or update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentTarget {
    pub name: String,
    pub image: ImageRef,
    pub region: String,
    pub port: u16,
    pub allow_unauthenticated: bool,
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl DeploymentTarget {
    /// Check every field that ends up on a command line
    pub fn validate(&self) -> Result<(), DeployError> {
        if !SERVICE_NAME.is_match(&self.name) {
            return Err(DeployError::InvalidTarget(format!(
                "invalid service name '{}'",
                self.name
            )));
        }

        if self.region.is_empty() || self.region.chars().any(|c| c.is_whitespace()) {
            return Err(DeployError::InvalidTarget(format!(
                "invalid region '{}'",
                self.region
            )));
        }

        if self.port == 0 {
            return Err(DeployError::InvalidTarget("port must be non-zero".to_string()));
        }

        if let Some(bad) = self.env.keys().find(|k| !ENV_NAME.is_match(k)) {
            return Err(DeployError::InvalidTarget(format!(
                "invalid environment variable name '{}'",
                bad
            )));
        }

        Ok(())
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

const ALTERNATE_DELIMITERS: [char; 6] = ['|', '@', '#', '~', ';', '+'];

/// Format an env mapping as a single `KEY=VALUE,...` argument.
///
/// When a value contains a comma, gcloud's alternate delimiter syntax
/// (`^D^KEY=VALUE{D}KEY=VALUE`) is used with a delimiter absent from the data.
pub fn format_env_vars(env: &BTreeMap<String, String>) -> String {
    let pairs: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

    if !env.values().any(|v| v.contains(',')) {
        return pairs.join(",");
    }

    let delimiter = ALTERNATE_DELIMITERS
        .into_iter()
        .find(|d| !pairs.iter().any(|p| p.contains(*d)))
        .unwrap_or('\u{1f}');

    format!("^{}^{}", delimiter, pairs.join(&delimiter.to_string()))
}
