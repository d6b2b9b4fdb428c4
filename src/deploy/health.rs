//! HTTP health probing for freshly deployed services

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::debug;

/// How a health response is judged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMode {
    /// HTTP 200 is required
    #[default]
    Strict,
    /// Body must mention "healthy", any status
    Lenient,
}

impl FromStr for HealthCheckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(HealthCheckMode::Strict),
            "lenient" => Ok(HealthCheckMode::Lenient),
            other => Err(format!("unknown health check mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckConfig {
    /// Path appended to the service URL
    pub path: String,
    pub mode: HealthCheckMode,
    /// Per-probe timeout
    pub timeout: Duration,
    /// Probes before giving up; `None` reuses the poll budget
    pub attempts: Option<u32>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            mode: HealthCheckMode::Strict,
            timeout: Duration::from_secs(5),
            attempts: None,
        }
    }
}

/// Result of a single health probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthProbeResult {
    pub healthy: bool,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Join a base URL and a health path with exactly one slash
pub fn health_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Judge a completed response
pub fn evaluate(mode: HealthCheckMode, status: u16, body: &str) -> bool {
    match mode {
        HealthCheckMode::Strict => status == 200,
        HealthCheckMode::Lenient => body.to_lowercase().contains("healthy"),
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe once. Never fails; network errors and timeouts are unhealthy.
    async fn probe(&self, base_url: &str, config: &HealthCheckConfig) -> HealthProbeResult;
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone, Default)]
pub struct HealthChecker {
    client: Client,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HealthChecker {
    async fn probe(&self, base_url: &str, config: &HealthCheckConfig) -> HealthProbeResult {
        let url = health_url(base_url, &config.path);
        let start = Instant::now();

        let result = timeout(config.timeout, async {
            let response = self.client.get(&url).send().await?;
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Ok::<_, reqwest::Error>((status, body))
        })
        .await;

        let latency_ms = start.elapsed().as_millis() as u64;

        let probe = match result {
            Ok(Ok((status, body))) => {
                let healthy = evaluate(config.mode, status, &body);
                HealthProbeResult {
                    healthy,
                    status_code: Some(status),
                    latency_ms,
                    error: if healthy {
                        None
                    } else {
                        Some(format!("HTTP {}", status))
                    },
                }
            }
            Ok(Err(e)) => HealthProbeResult {
                healthy: false,
                status_code: None,
                latency_ms,
                error: Some(e.to_string()),
            },
            Err(_) => HealthProbeResult {
                healthy: false,
                status_code: None,
                latency_ms: config.timeout.as_millis() as u64,
                error: Some("Timeout".to_string()),
            },
        };

        debug!(url = %url, healthy = probe.healthy, latency_ms = probe.latency_ms, "Health probe");
        probe
    }
}
