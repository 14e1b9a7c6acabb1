//! Shared fixtures for HTTP-level ingress tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{Router, body::Body, http::Response};
use chrono::{DateTime, TimeZone, Utc};
use mockall::mock;
use relaygate_billing::{ModelPrice, QuotaGuard, StaticPricingTable};
use relaygate_core::{
    Account, ApiKey, Decimal, InMemoryAccountStore, InMemoryApiKeyStore, InMemoryRequestLogStore,
    InMemoryWallet, ManualClock, Platform, ProxyConfig, TenantId, UpstreamClient, UpstreamContext,
    UpstreamError, UpstreamEventStream, UpstreamRequest, UpstreamResponse,
};
use relaygate_egress::{CredentialRefresher, EgressError, RefreshedToken, TokenRefresher};
use relaygate_ingress::{DispatchPipeline, IngressConfig, PipelineComponents, router};
use relaygate_routing::{AccountPool, RateLimitController, SessionAffinityCache};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mock! {
    pub Upstream {}

    #[async_trait]
    impl UpstreamClient for Upstream {
        async fn complete(
            &self,
            ctx: &UpstreamContext,
            request: UpstreamRequest,
        ) -> Result<UpstreamResponse, UpstreamError>;

        async fn stream_complete(
            &self,
            ctx: &UpstreamContext,
            request: UpstreamRequest,
        ) -> Result<UpstreamEventStream, UpstreamError>;
    }
}

struct NoRefresh;

#[async_trait]
impl TokenRefresher for NoRefresh {
    async fn refresh(
        &self,
        _refresh_token: &str,
        _proxy: Option<&ProxyConfig>,
    ) -> relaygate_egress::Result<RefreshedToken> {
        Err(EgressError::ConfigError("refresh disabled".into()))
    }
}

pub const API_KEY: &str = "rg-test-key";

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub fn tenant() -> TenantId {
    TenantId::new("tenant-1").unwrap()
}

pub fn account(id: &str, platform: Platform) -> Account {
    let mut account = Account::new(id, platform);
    account.api_key = Some(format!("sk-{id}"));
    account
}

pub struct TestApp {
    pub router: Router,
    pub clock: Arc<ManualClock>,
    pub accounts: Arc<InMemoryAccountStore>,
    pub wallet: Arc<InMemoryWallet>,
    pub logs: Arc<InMemoryRequestLogStore>,
    pub shutdown: CancellationToken,
}

pub fn app(accounts: Vec<Account>, key: ApiKey, upstream: MockUpstream) -> TestApp {
    let clock = Arc::new(ManualClock::new(start()));
    let account_store = Arc::new(InMemoryAccountStore::with_accounts(accounts));
    let keys = Arc::new(InMemoryApiKeyStore::with_keys([key]));
    let wallet = Arc::new(InMemoryWallet::new());
    wallet.set_balance(tenant(), dec("5"));
    let logs = Arc::new(InMemoryRequestLogStore::new());

    let pricing =
        StaticPricingTable::new(ModelPrice::new(dec("0.000003"), dec("0.000015"))).unwrap();
    let pipeline = DispatchPipeline::new(PipelineComponents {
        api_keys: keys.clone(),
        pool: AccountPool::new(
            account_store.clone(),
            SessionAffinityCache::in_memory(clock.clone()),
            RateLimitController::new(account_store.clone(), clock.clone()),
            clock.clone(),
        ),
        credentials: Arc::new(CredentialRefresher::new(
            account_store.clone(),
            Arc::new(NoRefresh),
            clock.clone(),
        )),
        upstream: Arc::new(upstream),
        quota: Arc::new(QuotaGuard::new(
            Arc::new(pricing),
            wallet.clone(),
            keys.clone(),
            clock.clone(),
        )),
        request_logs: logs.clone(),
        clock: clock.clone(),
        metrics: None,
    });

    let shutdown = CancellationToken::new();
    TestApp {
        router: router(pipeline, shutdown.clone(), &IngressConfig::default()),
        clock,
        accounts: account_store,
        wallet,
        logs,
        shutdown,
    }
}

pub fn default_key() -> ApiKey {
    ApiKey::new("key-1", API_KEY, tenant())
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
