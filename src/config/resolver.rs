//! Effective configuration resolution
//!
//! A step's effective configuration is layered from, in decreasing priority:
//! the inbound message's configuration envelope, the step's own defaults, the
//! process environment, and finally the key's built-in fallback.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::environment::Environment;

/// A single configuration value: text, number, flag or string mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
    Map(#[serde(deserialize_with = "de_string_map")] BTreeMap<String, String>),
}

/// Flat configuration mapping keyed by configuration name
pub type ConfigMap = BTreeMap<String, ConfigValue>;

impl ConfigValue {
    pub fn text(value: impl Into<String>) -> Self {
        ConfigValue::Text(value.into())
    }

    /// Scalar rendering; `None` for mappings
    pub fn to_text(&self) -> Option<String> {
        match self {
            ConfigValue::Text(s) => Some(s.clone()),
            ConfigValue::Number(n) => Some(n.to_string()),
            ConfigValue::Flag(b) => Some(b.to_string()),
            ConfigValue::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            ConfigValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Empty strings and empty mappings carry no value
    pub fn is_blank(&self) -> bool {
        match self {
            ConfigValue::Text(s) => s.trim().is_empty(),
            ConfigValue::Map(m) => m.is_empty(),
            _ => false,
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Text(value)
    }
}

impl From<u16> for ConfigValue {
    fn from(value: u16) -> Self {
        ConfigValue::Number(value.into())
    }
}

impl From<BTreeMap<String, String>> for ConfigValue {
    fn from(value: BTreeMap<String, String>) -> Self {
        ConfigValue::Map(value)
    }
}

/// Mappings accept scalar values of any JSON/YAML type and keep them as text
fn de_string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
    let mut map = BTreeMap::new();
    for (key, value) in raw {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "mapping value for '{}' must be a scalar, got {}",
                    key, other
                )))
            }
        };
        map.insert(key, text);
    }
    Ok(map)
}

/// A configuration key recognised by a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySpec {
    pub name: String,

    /// Environment variable consulted when neither the message nor the
    /// step defaults provide a value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,

    /// Last-resort value used when every layer is empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<ConfigValue>,

    /// Composite keys hold a string mapping merged entry by entry
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub composite: bool,
}

impl KeySpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            env: None,
            fallback: None,
            composite: false,
        }
    }

    pub fn env(mut self, var: &str) -> Self {
        self.env = Some(var.to_string());
        self
    }

    pub fn fallback(mut self, value: impl Into<ConfigValue>) -> Self {
        self.fallback = Some(value.into());
        self
    }

    pub fn composite(name: &str) -> Self {
        Self {
            composite: true,
            ..Self::new(name)
        }
    }
}

// ============================================================================
// SBIO: Pure resolution (no I/O)
// ============================================================================

fn present(value: Option<&ConfigValue>) -> Option<&ConfigValue> {
    value.filter(|v| !v.is_blank())
}

/// Merge a composite mapping entry by entry: inbound entries win over defaults
fn merge_composite(defaults: Option<&ConfigValue>, inbound: Option<&ConfigValue>) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for layer in [defaults, inbound].into_iter().flatten() {
        if let Some(map) = layer.as_map() {
            for (k, v) in map {
                if !v.is_empty() {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
    }
    merged
}

/// Resolve the effective configuration for one step invocation.
///
/// Inputs are borrowed and never modified. Keys that resolve to nothing are
/// absent from the result rather than null-filled.
pub fn resolve(
    keys: &[KeySpec],
    step_defaults: &ConfigMap,
    inbound: &ConfigMap,
    env: &Environment,
) -> EffectiveConfig {
    let mut values = ConfigMap::new();

    for key in keys {
        if key.composite {
            let mut merged = key
                .fallback
                .as_ref()
                .and_then(ConfigValue::as_map)
                .cloned()
                .unwrap_or_default();
            merged.extend(merge_composite(
                step_defaults.get(&key.name),
                inbound.get(&key.name),
            ));
            if !merged.is_empty() {
                values.insert(key.name.clone(), ConfigValue::Map(merged));
            }
            continue;
        }

        let value = present(inbound.get(&key.name))
            .or_else(|| present(step_defaults.get(&key.name)))
            .cloned()
            .or_else(|| {
                key.env
                    .as_deref()
                    .and_then(|var| env.get(var))
                    .map(ConfigValue::text)
            })
            .or_else(|| key.fallback.clone());

        if let Some(value) = value {
            values.insert(key.name.clone(), value);
        }
    }

    EffectiveConfig { values }
}

/// `{key}` placeholders in templates
pub(crate) static TEMPLATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_.-]+)\}").expect("valid template pattern"));

/// The fully merged settings for one step invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EffectiveConfig {
    values: ConfigMap,
}

impl EffectiveConfig {
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(ConfigValue::to_text)
    }

    pub fn map(&self, key: &str) -> Option<&BTreeMap<String, String>> {
        self.values.get(key).and_then(ConfigValue::as_map)
    }

    pub fn values(&self) -> &ConfigMap {
        &self.values
    }

    pub fn into_values(self) -> ConfigMap {
        self.values
    }

    /// Required keys that did not resolve, in the order given
    pub fn missing(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|k| !self.values.contains_key(k.as_str()))
            .cloned()
            .collect()
    }

    /// Substitute `{key}` placeholders.
    ///
    /// Returns the names of unresolved keys when any placeholder cannot be
    /// filled; mapping values never substitute.
    pub fn render(&self, template: &str) -> Result<String, Vec<String>> {
        let mut missing = Vec::new();
        let rendered = TEMPLATE_PATTERN.replace_all(template, |caps: &regex::Captures| {
            let key = &caps[1];
            match self.text(key) {
                Some(v) => v,
                None => {
                    missing.push(key.to_string());
                    String::new()
                }
            }
        });

        if missing.is_empty() {
            Ok(rendered.into_owned())
        } else {
            Err(missing)
        }
    }
}

impl From<ConfigMap> for EffectiveConfig {
    fn from(values: ConfigMap) -> Self {
        Self { values }
    }
}
