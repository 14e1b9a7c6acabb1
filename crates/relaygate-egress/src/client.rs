//! Shared HTTP client utilities

use crate::{EgressError, Result};
use dashmap::DashMap;
use relaygate_core::ProxyConfig;
use reqwest::{Client, ClientBuilder, Proxy};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Request timeout in seconds
    /// Note: This applies to the entire request including streaming responses.
    pub timeout_secs: u64,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Maximum number of idle connections per host
    pub pool_max_idle_per_host: usize,

    /// Maximum number of retries for connection failures
    pub max_retries: u32,

    /// User agent string
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            // Long streams (extended thinking) stay open for minutes.
            timeout_secs: 600,
            connect_timeout_secs: 10,
            pool_max_idle_per_host: 32,
            max_retries: 2,
            user_agent: format!("RelayGate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Create a configured HTTP client, optionally routed through an outbound proxy
pub fn create_client(config: &HttpClientConfig, proxy: Option<&ProxyConfig>) -> Result<Client> {
    let mut builder = ClientBuilder::new()
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        // Expire idle connections before upstream servers close them
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(&config.user_agent)
        .use_rustls_tls()
        .tcp_keepalive(Duration::from_secs(60));

    if let Some(proxy) = proxy {
        builder = builder.proxy(build_proxy(proxy)?);
    }

    builder
        .build()
        .map_err(|e| EgressError::ConfigError(format!("Failed to create HTTP client: {}", e)))
}

fn build_proxy(config: &ProxyConfig) -> Result<Proxy> {
    let mut proxy = Proxy::all(&config.url)
        .map_err(|e| EgressError::ConfigError(format!("Invalid proxy url: {}", e)))?;
    if let Some(username) = config.username.as_deref() {
        proxy = proxy.basic_auth(username, config.password.as_deref().unwrap_or(""));
    }
    Ok(proxy)
}

/// Clients keyed by outbound proxy, so connection pools are reused per route
pub struct ClientPool {
    config: HttpClientConfig,
    direct: Client,
    proxied: DashMap<String, Client>,
}

impl ClientPool {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let direct = create_client(&config, None)?;
        Ok(Self {
            config,
            direct,
            proxied: DashMap::new(),
        })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Client for an account's proxy (or the direct client)
    pub fn client_for(&self, proxy: Option<&ProxyConfig>) -> Result<Client> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };

        let key = format!(
            "{}|{}",
            proxy.url,
            proxy.username.as_deref().unwrap_or_default()
        );
        if let Some(client) = self.proxied.get(&key) {
            return Ok(client.clone());
        }

        let client = create_client(&self.config, Some(proxy))?;
        debug!(proxy_url = %proxy.url, "Created proxied HTTP client");
        Ok(self.proxied.entry(key).or_insert(client).clone())
    }
}

/// Retry policy for connection-level failures
///
/// Only failures where the request never reached the upstream are retried;
/// upstream responses, including 429 and 5xx, are surfaced once.
pub async fn with_retry<F, Fut, T>(max_retries: u32, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(EgressError::HttpError(e)) if e.is_connect() && attempt < max_retries => {
                attempt += 1;
                let backoff_ms = 2u64.pow(attempt - 1) * 100;
                warn!(
                    "Connection failed (attempt {}/{}), retrying in {}ms: {}",
                    attempt, max_retries, backoff_ms, e
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
