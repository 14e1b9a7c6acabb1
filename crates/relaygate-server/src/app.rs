//! Gateway wiring
//!
//! Connects the seeded collaborator backends, the egress clients, the billing
//! guard and the account pool into one dispatch pipeline, and mounts it next to
//! the health endpoints.

use anyhow::Context;
use async_trait::async_trait;
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use relaygate_billing::QuotaGuard;
use relaygate_config_file::GatewayBackends;
use relaygate_core::{Clock, InMemoryAccountStore, Platform};
use relaygate_egress::{
    ClaudeClient, ClientPool, CredentialRefresher, HttpTokenRefresher, OpenAiCompatClient,
    PlatformClients, RateLimitPolicy,
};
use relaygate_ingress::{DispatchPipeline, PipelineComponents, router};
use relaygate_observability::{
    HealthState, Metrics, PlatformStatus, ReadinessChecker, health_router,
};
use relaygate_routing::{AccountPool, InMemoryTtlCache, RateLimitController, SessionAffinityCache};

use crate::config::ServerConfig;

/// Fully wired gateway
pub struct Gateway {
    pub router: Router,
    pub pipeline: DispatchPipeline,
    pub metrics: Arc<Metrics>,
}

/// Build the HTTP application
///
/// Every request's cancellation token is a child of `shutdown`.
pub fn build_gateway(
    config: &ServerConfig,
    backends: &GatewayBackends,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) -> anyhow::Result<Gateway> {
    let metrics = Arc::new(Metrics::new().context("registering metrics")?);

    let clients = Arc::new(
        ClientPool::new(config.upstream.http.clone()).context("building HTTP client pool")?,
    );
    let rate_limit_policy =
        RateLimitPolicy::new(clock.clone(), config.routing.fallback_cooldown_secs);
    let upstream = PlatformClients::new(
        ClaudeClient::new(
            config.upstream.anthropic.clone(),
            clients.clone(),
            rate_limit_policy.clone(),
        ),
        OpenAiCompatClient::new(
            config.upstream.openai.clone(),
            clients.clone(),
            rate_limit_policy,
        ),
    );

    let credentials = CredentialRefresher::new(
        backends.accounts.clone(),
        Arc::new(HttpTokenRefresher::new(
            config.upstream.oauth.clone(),
            clients,
        )),
        clock.clone(),
    )
    .with_skew_secs(config.upstream.refresh_skew_secs);

    let affinity = SessionAffinityCache::new(
        Arc::new(InMemoryTtlCache::new(clock.clone())),
        &config.routing.affinity,
    );
    let rate_limits = RateLimitController::new(backends.accounts.clone(), clock.clone())
        .with_fallback_cooldown(config.routing.fallback_cooldown_secs);
    let pool = AccountPool::new(backends.accounts.clone(), affinity, rate_limits, clock.clone())
        .with_weights(config.routing.weights.clone());

    let quota = QuotaGuard::new(
        backends.pricing.clone(),
        backends.wallet.clone(),
        backends.api_keys.clone(),
        clock.clone(),
    )
    .with_estimation(config.billing.estimation.clone());

    let pipeline = DispatchPipeline::new(PipelineComponents {
        api_keys: backends.api_keys.clone(),
        pool,
        credentials: Arc::new(credentials),
        upstream: Arc::new(upstream),
        quota: Arc::new(quota),
        request_logs: backends.request_logs.clone(),
        clock: clock.clone(),
        metrics: Some(metrics.clone()),
    });

    let readiness = AccountReadiness {
        accounts: backends.accounts.clone(),
        clock,
    };
    let health = HealthState::with_readiness_checker(metrics.clone(), Arc::new(readiness));

    let router = router(pipeline.clone(), shutdown, &config.ingress).merge(health_router(health));
    info!(accounts = backends.accounts.len(), "Gateway wired");

    Ok(Gateway {
        router,
        pipeline,
        metrics,
    })
}

/// Readiness from the account store: ready while any account can be selected
pub struct AccountReadiness {
    pub accounts: Arc<InMemoryAccountStore>,
    pub clock: Arc<dyn Clock>,
}

#[async_trait]
impl ReadinessChecker for AccountReadiness {
    async fn platform_statuses(&self) -> Vec<PlatformStatus> {
        let now = self.clock.now();
        let accounts = self.accounts.all();

        Platform::ALL
            .iter()
            .map(|platform| {
                let on_platform = accounts.iter().filter(|a| a.platform == *platform);
                let (total, available) = on_platform.fold((0, 0), |(total, available), a| {
                    // Elapsed windows are cleared lazily on the next selection.
                    let usable = a.is_available(now) || a.rate_limit_expired(now);
                    (total + 1, available + usize::from(usable))
                });
                PlatformStatus {
                    name: platform.as_str().to_string(),
                    available_accounts: available,
                    total_accounts: total,
                }
            })
            .collect()
    }
}
