//! Process environment snapshot
//!
//! The environment is captured once at startup and handed to every component
//! that needs it, so nothing reads `std::env` after construction.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::Path;

use super::ConfigError;

/// Immutable snapshot of environment variables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Capture the current process environment. Variables whose name or
    /// value is not UTF-8 are skipped.
    pub fn from_process() -> Self {
        Self::from_os_pairs(std::env::vars_os())
    }

    fn from_os_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        Self {
            vars: pairs
                .into_iter()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        }
    }

    /// Build an environment from explicit pairs (used by tests and `--set`)
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Look up a variable; empty values count as unset
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Look up a variable and parse it, ignoring unparsable values
    pub fn parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or(default).to_string()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Overlay variables from a .env file without touching the process env
    pub fn with_env_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        let iter = dotenvy::from_path_iter(path)
            .map_err(|e| ConfigError::EnvFile(format!("{}: {}", path.display(), e)))?;
        for item in iter {
            let (key, value) =
                item.map_err(|e| ConfigError::EnvFile(format!("{}: {}", path.display(), e)))?;
            self.vars.insert(key, value);
        }
        Ok(self)
    }
}
