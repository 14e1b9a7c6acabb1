use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use relaygate_billing::EstimationConfig;
use relaygate_egress::{AnthropicConfig, HttpClientConfig, OAuthConfig, OpenAiConfig};
use relaygate_ingress::IngressConfig;
use relaygate_observability::LoggingConfig;
use relaygate_routing::{AffinityConfig, DEFAULT_COOLDOWN_SECS, ScoringWeights};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Accounts, API keys, tenant balances and prices
    #[serde(default = "default_gateway_file")]
    pub gateway_file: PathBuf,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub routing: RoutingSettings,

    #[serde(default)]
    pub upstream: UpstreamSettings,

    #[serde(default)]
    pub billing: BillingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSettings {
    #[serde(default)]
    pub weights: ScoringWeights,

    #[serde(default)]
    pub affinity: AffinityConfig,

    /// Cooldown applied when an upstream 429 carries no usable reset hint
    #[serde(default = "default_cooldown_secs")]
    pub fallback_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    #[serde(default)]
    pub anthropic: AnthropicConfig,

    #[serde(default)]
    pub openai: OpenAiConfig,

    #[serde(default)]
    pub oauth: OAuthConfig,

    #[serde(default)]
    pub http: HttpClientConfig,

    /// Refresh OAuth tokens this many seconds before they expire
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingSettings {
    #[serde(default)]
    pub estimation: EstimationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            gateway_file: default_gateway_file(),
            logging: LoggingConfig::default(),
            ingress: IngressConfig::default(),
            routing: RoutingSettings::default(),
            upstream: UpstreamSettings::default(),
            billing: BillingSettings::default(),
        }
    }
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            affinity: AffinityConfig::default(),
            fallback_cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            anthropic: AnthropicConfig::default(),
            openai: OpenAiConfig::default(),
            oauth: OAuthConfig::default(),
            http: HttpClientConfig::default(),
            refresh_skew_secs: default_refresh_skew_secs(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading server config {}", path.display()))?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&contents)
                .with_context(|| format!("parsing TOML server config {}", path.display()))?
        } else {
            // Default to YAML
            serde_yaml::from_str(&contents)
                .with_context(|| format!("parsing YAML server config {}", path.display()))?
        };

        Ok(config)
    }

    /// Merge environment variables into config (env vars take precedence)
    pub fn merge_env(&mut self) {
        self.merge_vars(|name| std::env::var(name).ok());
    }

    fn merge_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("RELAYGATE_HOST") {
            self.host = val;
        }

        if let Some(val) = var("RELAYGATE_PORT") {
            match val.parse::<u16>() {
                Ok(port) => self.port = port,
                Err(_) => warn!("Ignoring invalid RELAYGATE_PORT '{}'", val),
            }
        }

        if let Some(val) = var("RELAYGATE_LOG_LEVEL") {
            self.logging.level = val;
        }

        if let Some(val) = var("RELAYGATE_LOG_JSON") {
            match val.parse::<bool>() {
                Ok(json) => self.logging.json = json,
                Err(_) => warn!("Ignoring invalid RELAYGATE_LOG_JSON '{}'", val),
            }
        }

        if let Some(val) = var("RELAYGATE_GATEWAY_FILE") {
            self.gateway_file = PathBuf::from(val);
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_gateway_file() -> PathBuf {
    PathBuf::from("~/.relaygate/gateway.yaml")
}

fn default_cooldown_secs() -> u64 {
    DEFAULT_COOLDOWN_SECS
}

fn default_refresh_skew_secs() -> i64 {
    60
}
