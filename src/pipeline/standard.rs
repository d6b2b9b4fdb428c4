//! The built-in four-step pipeline: config, proxy, consumer, webapp.
//!
//! Expressed with the same step definitions a pipeline file would use.

use std::collections::BTreeMap;

use crate::config::{
    ConfigMap, ConfigStepDefinition, Environment, HealthOverride, KeySpec, PipelineFile,
    ServiceStepDefinition, StepDefinition,
};
use crate::deploy::{DeployMode, HealthCheckMode};

pub const PROXY_SERVICE: &str = "nfa-proxy";
pub const CONSUMER_SERVICE: &str = "consumer-node";
pub const WEBAPP_SERVICE: &str = "webapp-node";

fn service(name: &str, service: &str, image: &str, port: &str) -> ServiceStepDefinition {
    ServiceStepDefinition {
        name: name.to_string(),
        service: service.to_string(),
        action: DeployMode::Deploy,
        image: image.to_string(),
        region: "{region}".to_string(),
        port: port.to_string(),
        project: Some("{projectId}".to_string()),
        allow_unauthenticated: true,
        keys: Vec::new(),
        defaults: ConfigMap::new(),
        required: Vec::new(),
        env: BTreeMap::new(),
        env_from: None,
        requires: None,
        publish: Vec::new(),
        poll: None,
        health: None,
    }
}

fn env_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn region() -> KeySpec {
    KeySpec::new("region").env("REGION").fallback("us-west1")
}

fn project() -> KeySpec {
    KeySpec::new("projectId").env("PROJECT_ID")
}

/// Seeds registry, images, ports, project, region, zone and the shared env mapping
pub fn config_step(env: &Environment) -> ConfigStepDefinition {
    let proxy_version = env.get("NFA_PROXY_VERSION").unwrap_or("latest");
    let session = env.get("SESSION_DURATION").unwrap_or("1h");
    let marketplace_port = env.get("MARKETPLACE_PORT").unwrap_or("3333");

    ConfigStepDefinition {
        name: "config".to_string(),
        keys: vec![
            KeySpec::new("dockerRegistry").env("DOCKER_REGISTRY"),
            KeySpec::new("proxyImage").fallback(format!("openai-morpheus-proxy:{}", proxy_version)),
            KeySpec::new("consumerImage").fallback("openai-morpheus-consumer:latest"),
            KeySpec::new("proxyPort").fallback(8080u16),
            KeySpec::new("consumerPort").env("MARKETPLACE_PORT").fallback(3333u16),
            project(),
            region(),
            KeySpec::new("zone").env("ZONE"),
            KeySpec {
                fallback: Some(
                    env_map(&[
                        ("MARKETPLACE_PORT", marketplace_port),
                        ("SESSION_DURATION", session),
                    ])
                    .into(),
                ),
                ..KeySpec::composite("env")
            },
        ],
        defaults: ConfigMap::new(),
    }
}

/// Deploys the OpenAI-compatible proxy and publishes `proxyUrl`/`OPENAI_API_URL`
pub fn proxy_step() -> ServiceStepDefinition {
    let mut def = service(
        "proxy",
        PROXY_SERVICE,
        "{dockerRegistry}/openai-morpheus-proxy:{proxyVersion}",
        "{internalApiPort}",
    );
    def.keys = vec![
        project(),
        region(),
        KeySpec::new("dockerRegistry").env("DOCKER_REGISTRY"),
        KeySpec::new("proxyVersion").env("NFA_PROXY_VERSION"),
        KeySpec::new("internalApiPort").env("INTERNAL_API_PORT").fallback("8080"),
        KeySpec::new("marketplacePort").env("MARKETPLACE_PORT").fallback("3333"),
        KeySpec::new("sessionDuration").env("SESSION_DURATION").fallback("1h"),
        KeySpec::new("marketplaceBaseUrl").env("MARKETPLACE_BASE_URL"),
        KeySpec::new("marketplaceUrl").env("MARKETPLACE_URL"),
        KeySpec::new("consumerUsername").env("CONSUMER_USERNAME").fallback("proxy"),
        KeySpec::new("consumerPassword").env("CONSUMER_PASSWORD"),
        KeySpec::new("consumerNodeUrl").env("CONSUMER_NODE_URL"),
    ];
    def.required = strings(&[
        "projectId",
        "region",
        "dockerRegistry",
        "proxyVersion",
        "marketplaceUrl",
    ]);
    def.env = env_map(&[
        ("INTERNAL_API_PORT", "{internalApiPort}"),
        ("MARKETPLACE_PORT", "{marketplacePort}"),
        ("MARKETPLACE_BASE_URL", "{marketplaceBaseUrl}"),
        ("MARKETPLACE_URL", "{marketplaceUrl}"),
        ("CONSUMER_USERNAME", "{consumerUsername}"),
        ("CONSUMER_PASSWORD", "{consumerPassword}"),
        ("CONSUMER_NODE_URL", "{consumerNodeUrl}"),
        ("SESSION_DURATION", "{sessionDuration}"),
    ]);
    def.publish = strings(&["proxyUrl", "OPENAI_API_URL"]);
    def
}

/// Deploys the consumer node once the proxy URL is known
pub fn consumer_step() -> ServiceStepDefinition {
    let mut def = service(
        "consumer",
        CONSUMER_SERVICE,
        "{dockerRegistry}/{consumerImage}",
        "8082",
    );
    // Wallet and chain fields are opaque pass-through strings
    def.keys = vec![
        project(),
        region(),
        KeySpec::new("dockerRegistry").env("DOCKER_REGISTRY"),
        KeySpec::new("consumerImage").fallback("openai-morpheus-consumer:latest"),
        KeySpec::new("walletKey").env("WALLET_PRIVATE_KEY"),
        KeySpec::new("contractAddress").env("DIAMOND_CONTRACT_ADDRESS"),
        KeySpec::new("morTokenAddress").env("MOR_TOKEN_ADDRESS"),
        KeySpec::new("blockchainWsUrl").env("BLOCKCHAIN_WS_URL"),
        KeySpec::new("blockchainHttpUrl").env("BLOCKCHAIN_HTTP_URL"),
        KeySpec::new("explorerApiUrl").env("EXPLORER_API_URL"),
        KeySpec::new("ethNodeChainId").env("ETH_NODE_CHAIN_ID"),
        KeySpec::new("webPublicUrl").env("WEB_PUBLIC_URL").fallback("http://consumer-service:9000"),
        KeySpec::new("environment").env("ENVIRONMENT"),
        KeySpec::new("logLevel").env("LOG_LEVEL"),
        KeySpec::composite("env"),
    ];
    def.required = strings(&["region", "dockerRegistry", "consumerImage"]);
    def.env = env_map(&[
        ("PROXY_URL", "{proxyUrl}/v1"),
        ("WALLET_PRIVATE_KEY", "{walletKey}"),
        ("DIAMOND_CONTRACT_ADDRESS", "{contractAddress}"),
        ("MOR_TOKEN_ADDRESS", "{morTokenAddress}"),
        ("BLOCKCHAIN_WS_URL", "{blockchainWsUrl}"),
        ("BLOCKCHAIN_HTTP_URL", "{blockchainHttpUrl}"),
        ("ETH_NODE_ADDRESS", "{blockchainHttpUrl}"),
        ("EXPLORER_API_URL", "{explorerApiUrl}"),
        ("ETH_NODE_CHAIN_ID", "{ethNodeChainId}"),
        ("WEB_PUBLIC_URL", "{webPublicUrl}"),
        ("ENVIRONMENT", "{environment}"),
        ("LOG_LEVEL", "{logLevel}"),
    ]);
    def.env_from = Some("env".to_string());
    def.requires = Some("proxyUrl".to_string());
    def.publish = strings(&["consumerUrl"]);
    def.health = Some(HealthOverride {
        mode: Some(HealthCheckMode::Lenient),
        ..Default::default()
    });
    def
}

/// Deploys the web front end pointed at the proxy
pub fn webapp_step() -> ServiceStepDefinition {
    let mut def = service(
        "webapp",
        WEBAPP_SERVICE,
        "{dockerRegistry}/openai-morpheus-webapp:{version}",
        "8080",
    );
    def.keys = vec![
        project(),
        region(),
        KeySpec::new("dockerRegistry").env("DOCKER_REGISTRY").fallback("srt0422"),
        KeySpec::new("version").env("VERSION").fallback("latest"),
        KeySpec::new("modelName").env("MODEL_NAME").fallback("Default Model"),
        KeySpec::new("OPENAI_API_URL").env("OPENAI_API_URL"),
    ];
    def.required = strings(&["region", "dockerRegistry"]);
    def.env = env_map(&[
        ("PROXY_URL", "{proxyUrl}"),
        ("MODEL_NAME", "{modelName}"),
        ("OPENAI_API_URL", "{OPENAI_API_URL}"),
    ]);
    def.requires = Some("proxyUrl".to_string());
    def.publish = strings(&["webappUrl"]);
    def
}

/// The complete standard pipeline
pub fn standard_pipeline(env: &Environment) -> PipelineFile {
    PipelineFile {
        name: Some("standard".to_string()),
        steps: vec![
            StepDefinition::Config(config_step(env)),
            StepDefinition::Service(proxy_step()),
            StepDefinition::Service(consumer_step()),
            StepDefinition::Service(webapp_step()),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, validate_pipeline, ConfigValue};

    #[test]
    fn test_standard_pipeline_is_valid() {
        let pipeline = standard_pipeline(&Environment::default());
        validate_pipeline(&pipeline).unwrap();
        assert_eq!(
            pipeline.step_names(),
            vec!["config", "proxy", "consumer", "webapp"]
        );
    }

    #[test]
    fn test_config_step_defaults() {
        let env = Environment::from_pairs([
            ("NFA_PROXY_VERSION", "v0.0.31"),
            ("PROJECT_ID", "demo"),
        ]);
        let def = config_step(&env);
        let effective = resolve(&def.keys, &def.defaults, &ConfigMap::new(), &env);

        assert_eq!(
            effective.text("proxyImage").as_deref(),
            Some("openai-morpheus-proxy:v0.0.31")
        );
        assert_eq!(effective.text("proxyPort").as_deref(), Some("8080"));
        assert_eq!(effective.text("consumerPort").as_deref(), Some("3333"));
        assert_eq!(effective.text("region").as_deref(), Some("us-west1"));
        assert_eq!(effective.text("projectId").as_deref(), Some("demo"));
        assert!(effective.get("zone").is_none());

        let shared = effective.map("env").unwrap();
        assert_eq!(shared["MARKETPLACE_PORT"], "3333");
        assert_eq!(shared["SESSION_DURATION"], "1h");
    }

    #[test]
    fn test_config_step_keeps_inbound_env_entries() {
        let env = Environment::default();
        let def = config_step(&env);
        let mut inbound = ConfigMap::new();
        inbound.insert(
            "env".to_string(),
            ConfigValue::Map(env_map(&[("SESSION_DURATION", "2h"), ("EXTRA", "1")])),
        );

        let effective = resolve(&def.keys, &def.defaults, &inbound, &env);
        let shared = effective.map("env").unwrap();
        assert_eq!(shared["SESSION_DURATION"], "2h");
        assert_eq!(shared["EXTRA"], "1");
        assert_eq!(shared["MARKETPLACE_PORT"], "3333");
    }

    #[test]
    fn test_proxy_has_no_embedded_credentials() {
        let def = proxy_step();
        let password = def.keys.iter().find(|k| k.name == "consumerPassword").unwrap();
        assert!(password.fallback.is_none());
        assert_eq!(def.primary_url_key(), Some("proxyUrl"));
    }
}
