//! Pipeline steps
//!
//! A service step runs `Idle -> Resolving -> Issuing -> Polling ->
//! HealthChecking` and ends in exactly one of `Succeeded`, `Failed` or
//! `Skipped`. Every terminal state emits one [`PipelineMessage`] that carries
//! the envelope forward, so a failing step never stops downstream steps from
//! reporting their own state.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{
    resolve, ConfigStepDefinition, DeploySettings, EffectiveConfig, Environment,
    ServiceStepDefinition,
};
use crate::deploy::{
    health::health_url, CommandExecutor, CommandIssuer, DeployError, DeploymentPoller,
    DeploymentTarget, HealthProbe, ImageRef,
};

use super::envelope::{ConfigEnvelope, PipelineMessage, StepResult};

/// Sentinel marking a URL that an upstream step has not produced yet
pub const PLACEHOLDER_MARKER: &str = "placeholder";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepState {
    Idle,
    Resolving,
    Issuing,
    Polling,
    HealthChecking,
    Succeeded,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Skipped
        )
    }
}

/// What a step would do, computed without side effects
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "plan", rename_all = "kebab-case")]
pub enum StepPlan {
    /// Configuration step: keys it would seed
    Seed { keys: Vec<String> },
    /// Service step: the command it would run
    Issue { program: String, args: Vec<String> },
    Skip { message: String },
    Invalid { error: String },
}

/// The composition unit of a pipeline
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &str;

    /// Run to completion. Never fails: errors become an error payload.
    async fn run(&self, inbound: ConfigEnvelope) -> PipelineMessage;

    /// Compute the outbound envelope and intended action without I/O
    fn plan(&self, inbound: &ConfigEnvelope) -> (ConfigEnvelope, StepPlan);
}

/// Collaborators shared by every service step
#[derive(Clone)]
pub struct StepContext {
    pub issuer: CommandIssuer,
    pub poller: DeploymentPoller,
    pub health: Arc<dyn HealthProbe>,
    pub env: Environment,
    pub settings: DeploySettings,
}

impl StepContext {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        health: Arc<dyn HealthProbe>,
        env: Environment,
        settings: DeploySettings,
    ) -> Self {
        Self {
            issuer: CommandIssuer::new(executor.clone(), settings.gcloud_bin.clone()),
            poller: DeploymentPoller::new(executor, settings.gcloud_bin.clone()),
            health,
            env,
            settings,
        }
    }
}

/// Records visited states
#[derive(Debug, Default)]
struct Trace(Vec<StepState>);

impl Trace {
    fn new() -> Self {
        Self(vec![StepState::Idle])
    }

    fn enter(&mut self, step: &str, state: StepState) {
        debug!(step, state = ?state, "Step transition");
        self.0.push(state);
    }

    fn finish(mut self, step: &str, state: StepState) -> Vec<StepState> {
        self.enter(step, state);
        self.0
    }
}

// ============================================================================
// Configuration step
// ============================================================================

/// Seeds the envelope from defaults and the environment
pub struct ConfigStep {
    def: ConfigStepDefinition,
    env: Environment,
}

impl ConfigStep {
    pub fn new(def: ConfigStepDefinition, env: Environment) -> Self {
        Self { def, env }
    }

    fn outbound(&self, inbound: &ConfigEnvelope) -> (ConfigEnvelope, EffectiveConfig) {
        let effective = resolve(&self.def.keys, &self.def.defaults, inbound.values(), &self.env);
        let mut outbound = inbound.clone();
        outbound.merge(effective.values());
        (outbound, effective)
    }
}

#[async_trait]
impl PipelineStep for ConfigStep {
    fn name(&self) -> &str {
        &self.def.name
    }

    async fn run(&self, inbound: ConfigEnvelope) -> PipelineMessage {
        let mut trace = Trace::new();
        trace.enter(&self.def.name, StepState::Resolving);

        let (config, effective) = self.outbound(&inbound);
        info!(step = %self.def.name, keys = effective.values().len(), "Configuration resolved");

        PipelineMessage {
            step: self.def.name.clone(),
            config,
            payload: StepResult::Success {
                url: None,
                action: "config".to_string(),
                output: format!("resolved {} keys", effective.values().len()),
            },
            trace: trace.finish(&self.def.name, StepState::Succeeded),
        }
    }

    fn plan(&self, inbound: &ConfigEnvelope) -> (ConfigEnvelope, StepPlan) {
        let (config, effective) = self.outbound(inbound);
        let keys = effective.values().keys().cloned().collect();
        (config, StepPlan::Seed { keys })
    }
}

// ============================================================================
// Service step
// ============================================================================

/// Deploys or updates one service and publishes its URL
pub struct ServiceStep {
    def: ServiceStepDefinition,
    ctx: StepContext,
}

enum Resolution {
    Skip(String),
    Ready(DeploymentTarget),
}

impl ServiceStep {
    pub fn new(def: ServiceStepDefinition, ctx: StepContext) -> Self {
        Self { def, ctx }
    }

    pub fn definition(&self) -> &ServiceStepDefinition {
        &self.def
    }

    fn effective(&self, inbound: &ConfigEnvelope) -> EffectiveConfig {
        resolve(
            &self.def.recognised_keys(),
            &self.def.defaults,
            inbound.values(),
            &self.ctx.env,
        )
    }

    /// Prerequisite check, required-key validation and target construction
    fn resolve_target(&self, effective: &EffectiveConfig) -> Result<Resolution, DeployError> {
        if let Some(requires) = &self.def.requires {
            match effective.text(requires) {
                Some(url) if !url.contains(PLACEHOLDER_MARKER) => {}
                _ => {
                    return Ok(Resolution::Skip(format!(
                        "Waiting for {}: upstream URL not available yet",
                        requires
                    )))
                }
            }
        }

        let missing = effective.missing(&self.def.required);
        if !missing.is_empty() {
            return Err(DeployError::MissingConfig { fields: missing });
        }

        build_target(&self.def, effective).map(Resolution::Ready)
    }

    fn failure(
        &self,
        err: DeployError,
        config: ConfigEnvelope,
        trace: Trace,
    ) -> PipelineMessage {
        warn!(step = %self.def.name, kind = err.kind(), error = %err, "Step failed");
        PipelineMessage {
            step: self.def.name.clone(),
            payload: StepResult::Error {
                error: err.to_string(),
                kind: err.kind().to_string(),
                stderr: err.stderr().map(String::from),
                urls: config.urls(),
            },
            config,
            trace: trace.finish(&self.def.name, StepState::Failed),
        }
    }

    /// Probe until healthy or the attempt budget runs out
    async fn verify_health(&self, url: &str) -> Result<(), DeployError> {
        let poll = self.poll_settings();
        let health = match &self.def.health {
            Some(over) => over.apply(&self.ctx.settings.health),
            None => self.ctx.settings.health.clone(),
        };
        let attempts = health.attempts.unwrap_or(poll.max_attempts).max(1);

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(poll.interval).await;
            }
            let result = self.ctx.health.probe(url, &health).await;
            if result.healthy {
                return Ok(());
            }
            debug!(step = %self.def.name, attempt, error = ?result.error, "Service not healthy yet");
        }

        Err(DeployError::HealthCheckFailed(health_url(url, &health.path)))
    }

    fn poll_settings(&self) -> crate::deploy::PollSettings {
        match &self.def.poll {
            Some(over) => over.apply(self.ctx.settings.poll),
            None => self.ctx.settings.poll,
        }
    }

    fn publish(&self, config: &mut ConfigEnvelope, url: &str) {
        for key in &self.def.publish {
            config.insert(key.clone(), url);
        }
    }
}

#[async_trait]
impl PipelineStep for ServiceStep {
    fn name(&self) -> &str {
        &self.def.name
    }

    async fn run(&self, inbound: ConfigEnvelope) -> PipelineMessage {
        let name = self.def.name.as_str();
        let mut trace = Trace::new();
        trace.enter(name, StepState::Resolving);

        let effective = self.effective(&inbound);
        let mut config = inbound;
        config.merge(effective.values());

        let target = match self.resolve_target(&effective) {
            Ok(Resolution::Ready(target)) => target,
            Ok(Resolution::Skip(message)) => {
                info!(step = name, %message, "Step skipped");
                return PipelineMessage {
                    step: name.to_string(),
                    config,
                    payload: StepResult::Pending { message },
                    trace: trace.finish(name, StepState::Skipped),
                };
            }
            Err(e) => return self.failure(e, config, trace),
        };

        trace.enter(name, StepState::Issuing);
        let output = match self.ctx.issuer.issue(&target, self.def.action).await {
            Ok(output) => output,
            Err(e) => return self.failure(e, config, trace),
        };

        trace.enter(name, StepState::Polling);
        let url = match self.ctx.poller.await_ready(&target, self.poll_settings()).await {
            Ok(url) => url,
            Err(e) => return self.failure(e, config, trace),
        };

        trace.enter(name, StepState::HealthChecking);
        if let Err(e) = self.verify_health(&url).await {
            return self.failure(e, config, trace);
        }

        self.publish(&mut config, &url);
        info!(step = name, service = %target.name, %url, "Service deployed");

        PipelineMessage {
            step: name.to_string(),
            config,
            payload: StepResult::Success {
                url: Some(url),
                action: self.def.action.to_string(),
                output: if output.stdout.is_empty() {
                    output.stderr
                } else {
                    output.stdout
                },
            },
            trace: trace.finish(name, StepState::Succeeded),
        }
    }

    fn plan(&self, inbound: &ConfigEnvelope) -> (ConfigEnvelope, StepPlan) {
        let effective = self.effective(inbound);
        let mut config = inbound.clone();
        config.merge(effective.values());

        let plan = match self.resolve_target(&effective) {
            Ok(Resolution::Ready(target)) => match target.validate() {
                Ok(()) => {
                    let url = format!("https://{}.dry-run.invalid", target.name);
                    self.publish(&mut config, &url);
                    StepPlan::Issue {
                        program: self.ctx.issuer.program().to_string(),
                        args: self.ctx.issuer.command_for(&target, self.def.action),
                    }
                }
                Err(e) => StepPlan::Invalid {
                    error: e.to_string(),
                },
            },
            Ok(Resolution::Skip(message)) => StepPlan::Skip { message },
            Err(e) => StepPlan::Invalid {
                error: e.to_string(),
            },
        };

        (config, plan)
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

fn render(effective: &EffectiveConfig, template: &str) -> Result<String, DeployError> {
    effective
        .render(template)
        .map_err(|fields| DeployError::MissingConfig { fields })
}

/// Build the deployment target from a definition and its effective config.
///
/// Env templates that reference an absent key, or render empty, are omitted,
/// and so is an unresolved project.
/// Entries of the `env_from` mapping are applied last and win.
pub fn build_target(
    def: &ServiceStepDefinition,
    effective: &EffectiveConfig,
) -> Result<DeploymentTarget, DeployError> {
    let image = ImageRef::parse(&render(effective, &def.image)?)?;
    let region = render(effective, &def.region)?;

    let port_text = render(effective, &def.port)?;
    let port = port_text
        .trim()
        .parse::<u16>()
        .map_err(|_| DeployError::InvalidTarget(format!("invalid port '{}'", port_text)))?;

    // Optional: an unresolved project falls back to the CLI's active project
    let project = def
        .project
        .as_deref()
        .and_then(|tpl| effective.render(tpl).ok())
        .filter(|p| !p.is_empty());

    let mut env = BTreeMap::new();
    for (var, template) in &def.env {
        match effective.render(template) {
            Ok(value) if !value.is_empty() => {
                env.insert(var.clone(), value);
            }
            Ok(_) => {}
            Err(keys) => debug!(var = %var, missing = ?keys, "Omitting env var"),
        }
    }
    if let Some(map) = def.env_from.as_deref().and_then(|key| effective.map(key)) {
        for (var, value) in map {
            env.insert(var.clone(), value.clone());
        }
    }

    Ok(DeploymentTarget {
        name: def.service.clone(),
        image,
        region,
        port,
        allow_unauthenticated: def.allow_unauthenticated,
        env,
        project,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigValue, KeySpec, StepDefinition};
    use crate::deploy::executor::mock::ScriptedExecutor;
    use crate::deploy::gcloud::READY_FORMAT;
    use crate::deploy::{CommandOutput, HealthCheckConfig, HealthProbeResult, PollSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedProbe {
        healthy: bool,
        calls: AtomicUsize,
    }

    impl FixedProbe {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn probe(&self, _base_url: &str, _config: &HealthCheckConfig) -> HealthProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            HealthProbeResult {
                healthy: self.healthy,
                status_code: Some(if self.healthy { 200 } else { 503 }),
                latency_ms: 1,
                error: None,
            }
        }
    }

    fn cloud_run() -> Arc<ScriptedExecutor> {
        Arc::new(ScriptedExecutor::new(|args| {
            if args.iter().any(|a| a == READY_FORMAT) {
                Ok(CommandOutput::stdout("True"))
            } else if args.get(2).map(String::as_str) == Some("describe") {
                Ok(CommandOutput::stdout("https://webapp-node-abc.a.run.app"))
            } else {
                Ok(CommandOutput::stdout("Service deployed"))
            }
        }))
    }

    fn settings() -> DeploySettings {
        DeploySettings {
            poll: PollSettings {
                max_attempts: 3,
                interval: Duration::ZERO,
            },
            ..Default::default()
        }
    }

    fn webapp_def() -> ServiceStepDefinition {
        let json = r#"{
            "kind": "service",
            "name": "webapp",
            "service": "webapp-node",
            "image": "{dockerRegistry}/openai-morpheus-webapp:{version}",
            "port": "8080",
            "keys": [
                {"name": "region", "fallback": "us-west1"},
                {"name": "dockerRegistry", "env": "DOCKER_REGISTRY"},
                {"name": "version", "fallback": "latest"},
                {"name": "modelName"}
            ],
            "required": ["dockerRegistry"],
            "env": {"PROXY_URL": "{proxyUrl}", "MODEL_NAME": "{modelName}"},
            "requires": "proxyUrl",
            "publish": ["webappUrl"]
        }"#;
        match serde_json::from_str::<StepDefinition>(json).unwrap() {
            StepDefinition::Service(def) => def,
            StepDefinition::Config(_) => panic!("expected service step"),
        }
    }

    fn step_with(executor: Arc<ScriptedExecutor>, probe: Arc<FixedProbe>, env: Environment) -> ServiceStep {
        ServiceStep::new(webapp_def(), StepContext::new(executor, probe, env, settings()))
    }

    fn envelope(pairs: &[(&str, &str)]) -> ConfigEnvelope {
        let mut envelope = ConfigEnvelope::new();
        for (k, v) in pairs {
            envelope.insert(*k, *v);
        }
        envelope
    }

    #[tokio::test]
    async fn test_success_publishes_url() {
        let executor = cloud_run();
        let step = step_with(executor.clone(), FixedProbe::new(true), Environment::default());

        let message = step
            .run(envelope(&[
                ("proxyUrl", "https://nfa-proxy.a.run.app"),
                ("dockerRegistry", "srt0422"),
                ("walletKey", "opaque"),
            ]))
            .await;

        assert_eq!(message.payload.url(), Some("https://webapp-node-abc.a.run.app"));
        assert_eq!(
            message.config.text("webappUrl").as_deref(),
            Some("https://webapp-node-abc.a.run.app")
        );
        assert_eq!(message.config.text("walletKey").as_deref(), Some("opaque"));
        assert_eq!(
            message.trace,
            vec![
                StepState::Idle,
                StepState::Resolving,
                StepState::Issuing,
                StepState::Polling,
                StepState::HealthChecking,
                StepState::Succeeded
            ]
        );

        let deploy = &executor.calls()[0];
        assert_eq!(&deploy[..3], &["run", "deploy", "webapp-node"]);
        assert!(deploy.contains(&"srt0422/openai-morpheus-webapp:latest".to_string()));
        // MODEL_NAME has no value and is omitted
        assert!(deploy.contains(&"PROXY_URL=https://nfa-proxy.a.run.app".to_string()));
    }

    #[tokio::test]
    async fn test_placeholder_prerequisite_skips_without_calls() {
        let executor = cloud_run();
        let probe = FixedProbe::new(true);
        let step = step_with(executor.clone(), probe.clone(), Environment::default());

        let message = step
            .run(envelope(&[("proxyUrl", "http://placeholder-proxy-url")]))
            .await;

        assert_eq!(message.payload.status(), "pending");
        assert_eq!(message.trace.last(), Some(&StepState::Skipped));
        assert_eq!(executor.call_count(), 0);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

        let message = step.run(ConfigEnvelope::new()).await;
        assert_eq!(message.payload.status(), "pending");
    }

    #[tokio::test]
    async fn test_missing_required_field_never_issues() {
        let executor = cloud_run();
        let step = step_with(executor.clone(), FixedProbe::new(true), Environment::default());

        let message = step
            .run(envelope(&[("proxyUrl", "https://nfa-proxy.a.run.app")]))
            .await;

        match &message.payload {
            StepResult::Error { kind, error, urls, .. } => {
                assert_eq!(kind, "missing_config");
                assert!(error.contains("dockerRegistry"));
                assert_eq!(urls["proxyUrl"], "https://nfa-proxy.a.run.app");
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(message.trace, vec![StepState::Idle, StepState::Resolving, StepState::Failed]);
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_environment_fills_gaps() {
        let executor = cloud_run();
        let env = Environment::from_pairs([("DOCKER_REGISTRY", "gcr.io/demo")]);
        let step = step_with(executor.clone(), FixedProbe::new(true), env);

        let message = step
            .run(envelope(&[("proxyUrl", "https://nfa-proxy.a.run.app")]))
            .await;

        assert!(message.payload.is_success());
        assert!(executor.calls()[0].contains(&"gcr.io/demo/openai-morpheus-webapp:latest".to_string()));
    }

    #[tokio::test]
    async fn test_command_failure_keeps_envelope() {
        let executor = Arc::new(ScriptedExecutor::new(|_| {
            Err(DeployError::CommandFailed {
                exit_info: "exit code 1".to_string(),
                stdout: String::new(),
                stderr: "quota exceeded".to_string(),
            })
        }));
        let step = step_with(executor, FixedProbe::new(true), Environment::default());

        let message = step
            .run(envelope(&[
                ("proxyUrl", "https://nfa-proxy.a.run.app"),
                ("dockerRegistry", "srt0422"),
            ]))
            .await;

        match &message.payload {
            StepResult::Error { kind, stderr, .. } => {
                assert_eq!(kind, "command_failed");
                assert_eq!(stderr.as_deref(), Some("quota exceeded"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(message.trace.last(), Some(&StepState::Failed));
        assert!(message.config.text("webappUrl").is_none());
    }

    #[tokio::test]
    async fn test_health_failure_uses_poll_budget() {
        let probe = FixedProbe::new(false);
        let step = step_with(cloud_run(), probe.clone(), Environment::default());

        let message = step
            .run(envelope(&[
                ("proxyUrl", "https://nfa-proxy.a.run.app"),
                ("dockerRegistry", "srt0422"),
            ]))
            .await;

        match &message.payload {
            StepResult::Error { kind, error, .. } => {
                assert_eq!(kind, "health_check_failed");
                assert!(error.contains("https://webapp-node-abc.a.run.app/health"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert!(message.trace.contains(&StepState::HealthChecking));
    }

    #[test]
    fn test_plan_without_side_effects() {
        let executor = cloud_run();
        let step = step_with(executor.clone(), FixedProbe::new(true), Environment::default());

        let (config, plan) = step.plan(&envelope(&[
            ("proxyUrl", "https://nfa-proxy.a.run.app"),
            ("dockerRegistry", "srt0422"),
        ]));

        match plan {
            StepPlan::Issue { program, args } => {
                assert_eq!(program, "gcloud");
                assert_eq!(&args[..3], &["run", "deploy", "webapp-node"]);
            }
            other => panic!("expected issue plan, got {:?}", other),
        }
        assert!(config.text("webappUrl").unwrap().contains("dry-run"));
        assert_eq!(executor.call_count(), 0);
    }

    #[test]
    fn test_build_target_env_from_wins() {
        let mut def = webapp_def();
        def.keys.push(KeySpec::composite("env"));
        def.env_from = Some("env".to_string());

        let mut values = crate::config::ConfigMap::new();
        values.insert("dockerRegistry".to_string(), "srt0422".into());
        values.insert("region".to_string(), "us-west1".into());
        values.insert("version".to_string(), "v1".into());
        values.insert("proxyUrl".to_string(), "https://p".into());
        values.insert(
            "env".to_string(),
            ConfigValue::Map(BTreeMap::from([("PROXY_URL".to_string(), "https://override".to_string())])),
        );

        let target = build_target(&def, &EffectiveConfig::from(values)).unwrap();
        assert_eq!(target.env["PROXY_URL"], "https://override");
        assert_eq!(target.image.to_string(), "srt0422/openai-morpheus-webapp:v1");
        assert_eq!(target.port, 8080);
    }

    #[test]
    fn test_build_target_bad_port() {
        let mut def = webapp_def();
        def.port = "eighty".to_string();
        let mut values = crate::config::ConfigMap::new();
        values.insert("dockerRegistry".to_string(), "srt0422".into());
        values.insert("region".to_string(), "us-west1".into());
        values.insert("version".to_string(), "v1".into());

        let err = build_target(&def, &EffectiveConfig::from(values)).unwrap_err();
        assert_eq!(err.kind(), "invalid_target");
    }
}
