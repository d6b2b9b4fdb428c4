//! Typed settings derived from the environment snapshot

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::{HealthCheckConfig, HealthCheckMode, PollSettings};

use super::environment::Environment;

/// Settings shared by every deployment step
#[derive(Debug, Clone, PartialEq)]
pub struct DeploySettings {
    /// CLI used to talk to the deployment platform
    pub gcloud_bin: String,
    /// Process-level timeout for a single command
    pub command_timeout: Duration,
    /// Per-stream output limit for a single command
    pub max_output_bytes: usize,
    pub poll: PollSettings,
    pub health: HealthCheckConfig,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            gcloud_bin: "gcloud".to_string(),
            command_timeout: Duration::from_secs(600),
            max_output_bytes: 10 * 1024 * 1024,
            poll: PollSettings::default(),
            health: HealthCheckConfig::default(),
        }
    }
}

/// Key store backend selection inputs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSettings {
    pub redis_url: Option<String>,
    pub rest_domain: Option<String>,
    pub rest_token: Option<String>,
    /// File used to persist the in-memory backend between runs
    pub persist_path: Option<PathBuf>,
}

impl StoreSettings {
    /// REST credentials are only usable as a pair
    pub fn rest_credentials(&self) -> Option<(&str, &str)> {
        match (&self.rest_domain, &self.rest_token) {
            (Some(domain), Some(token)) => Some((domain.as_str(), token.as_str())),
            _ => None,
        }
    }
}

/// Request budget for one identity class
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitPolicy {
    pub limit: u64,
    pub window: Duration,
}

/// Chat relay and HTTP surface settings
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub upstream_url: String,
    pub upstream_token: Option<String>,
    pub model_name: String,
    /// Longest silence tolerated from the upstream
    pub request_timeout: Duration,
    pub token_limit: RateLimitPolicy,
    pub ip_limit: RateLimitPolicy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            upstream_url: "http://localhost:3000".to_string(),
            upstream_token: None,
            model_name: "LMR-Hermes-2-Theta-Llama-3-8B".to_string(),
            request_timeout: Duration::from_secs(300),
            token_limit: RateLimitPolicy {
                limit: 500,
                window: Duration::from_secs(60),
            },
            ip_limit: RateLimitPolicy {
                limit: 5,
                window: Duration::from_secs(10),
            },
        }
    }
}

/// All runtime settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub deploy: DeploySettings,
    pub store: StoreSettings,
    pub relay: RelaySettings,
}

impl Settings {
    pub fn from_env(env: &Environment) -> Self {
        let deploy_defaults = DeploySettings::default();
        let relay_defaults = RelaySettings::default();

        let poll = PollSettings {
            max_attempts: env
                .parse("POLL_MAX_ATTEMPTS")
                .unwrap_or(deploy_defaults.poll.max_attempts),
            interval: env
                .parse("POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(deploy_defaults.poll.interval),
        };

        let health = HealthCheckConfig {
            mode: env
                .parse::<HealthCheckMode>("HEALTH_CHECK_MODE")
                .unwrap_or(deploy_defaults.health.mode),
            timeout: env
                .parse("HEALTH_CHECK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(deploy_defaults.health.timeout),
            ..deploy_defaults.health.clone()
        };

        let deploy = DeploySettings {
            gcloud_bin: env.get_or("GCLOUD_BIN", &deploy_defaults.gcloud_bin),
            command_timeout: env
                .parse("COMMAND_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(deploy_defaults.command_timeout),
            max_output_bytes: deploy_defaults.max_output_bytes,
            poll,
            health,
        };

        let store = StoreSettings {
            redis_url: env.get("REDIS_URL").map(String::from),
            rest_domain: env.get("UPSTASH_REST_API_DOMAIN").map(String::from),
            rest_token: env.get("UPSTASH_REST_API_TOKEN").map(String::from),
            persist_path: env
                .get("MOCK_STORE_PATH")
                .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned())),
        };

        let policy = |limit_var: &str, window_var: &str, default: RateLimitPolicy| RateLimitPolicy {
            limit: env.parse(limit_var).unwrap_or(default.limit),
            window: env
                .parse(window_var)
                .map(Duration::from_secs)
                .unwrap_or(default.window),
        };

        let relay = RelaySettings {
            upstream_url: env.get_or("BASEIMAGE_PROXY_URL", &relay_defaults.upstream_url),
            upstream_token: env.get("BASEIMAGE_AUTH_TOKEN").map(String::from),
            model_name: env.get_or("MODEL_NAME", &relay_defaults.model_name),
            request_timeout: relay_defaults.request_timeout,
            token_limit: policy(
                "RATE_LIMIT_TOKEN_REQUESTS",
                "RATE_LIMIT_TOKEN_WINDOW_SECS",
                relay_defaults.token_limit,
            ),
            ip_limit: policy(
                "RATE_LIMIT_IP_REQUESTS",
                "RATE_LIMIT_IP_WINDOW_SECS",
                relay_defaults.ip_limit,
            ),
        };

        Self {
            deploy,
            store,
            relay,
        }
    }
}
