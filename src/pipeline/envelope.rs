//! Messages exchanged between pipeline steps

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigMap, ConfigValue};

use super::step::StepState;

/// Configuration carried from step to step.
///
/// Steps may add or overwrite entries but never remove them, so keys a step
/// does not understand still reach the steps after it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigEnvelope {
    values: ConfigMap,
}

impl ConfigEnvelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(ConfigValue::to_text)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Add or overwrite every entry of `other`
    pub fn merge(&mut self, other: &ConfigMap) {
        for (key, value) in other {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn values(&self) -> &ConfigMap {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Resolved URLs: text entries whose key ends in `Url` or `_URL`
    pub fn urls(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .filter(|(k, _)| k.ends_with("Url") || k.ends_with("_URL"))
            .filter_map(|(k, v)| v.to_text().map(|t| (k.clone(), t)))
            .filter(|(_, v)| !v.is_empty())
            .collect()
    }
}

impl From<ConfigMap> for ConfigEnvelope {
    fn from(values: ConfigMap) -> Self {
        Self { values }
    }
}

/// Outcome of one step invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepResult {
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        action: String,
        output: String,
    },
    Error {
        error: String,
        kind: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
        /// URLs already known when the step failed
        urls: BTreeMap<String, String>,
    },
    Pending {
        message: String,
    },
}

impl StepResult {
    pub fn status(&self) -> &'static str {
        match self {
            StepResult::Success { .. } => "success",
            StepResult::Error { .. } => "error",
            StepResult::Pending { .. } => "pending",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success { .. })
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            StepResult::Success { url, .. } => url.as_deref(),
            _ => None,
        }
    }
}

/// What a step emits when it finishes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineMessage {
    pub step: String,
    pub config: ConfigEnvelope,
    pub payload: StepResult,
    /// States visited, in order
    pub trace: Vec<StepState>,
}
