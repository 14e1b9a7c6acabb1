//! Metrics collection with Prometheus
//!
//! This module provides Prometheus metrics for RelayGate:
//! - Request counts and latency by service and outcome
//! - Account selections by source (bound, sticky, scored)
//! - Rate-limit marks and credential refreshes
//! - Token usage and settled cost

use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for RelayGate
#[derive(Clone)]
pub struct Metrics {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Finished requests by service and outcome
    pub requests_total: IntCounterVec,
    /// End-to-end request duration
    pub request_duration_seconds: HistogramVec,

    /// Account selections by platform and source
    pub account_selections_total: IntCounterVec,
    /// Accounts put into cooldown after an upstream 429
    pub rate_limit_marks_total: IntCounterVec,
    /// OAuth credential lookups by outcome
    pub credential_refreshes_total: IntCounterVec,

    /// Tokens by model and kind (input, output, cache_creation, cache_read)
    pub tokens_total: IntCounterVec,
    /// Cost debited from tenant wallets, in the pricing currency
    pub settled_cost_total: CounterVec,
    /// Streams that ended before the upstream finished
    pub streams_aborted_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("relaygate_requests_total", "Total number of finished requests"),
            &["service", "outcome"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "relaygate_request_duration_seconds",
                "Request duration in seconds",
            )
            .buckets(vec![
                0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
            ]),
            &["service", "outcome"],
        )?;

        let account_selections_total = IntCounterVec::new(
            Opts::new(
                "relaygate_account_selections_total",
                "Accounts chosen for dispatch",
            ),
            &["platform", "source"],
        )?;

        let rate_limit_marks_total = IntCounterVec::new(
            Opts::new(
                "relaygate_rate_limit_marks_total",
                "Accounts marked rate limited",
            ),
            &["account_id"],
        )?;

        let credential_refreshes_total = IntCounterVec::new(
            Opts::new(
                "relaygate_credential_refreshes_total",
                "Credential lookups by outcome",
            ),
            &["outcome"],
        )?;

        let tokens_total = IntCounterVec::new(
            Opts::new("relaygate_tokens_total", "Tokens reported by upstreams"),
            &["model", "kind"],
        )?;

        let settled_cost_total = CounterVec::new(
            Opts::new("relaygate_settled_cost_total", "Cost debited from wallets"),
            &["model"],
        )?;

        let streams_aborted_total = IntCounterVec::new(
            Opts::new(
                "relaygate_streams_aborted_total",
                "Streams canceled or dropped before completion",
            ),
            &["service"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(account_selections_total.clone()))?;
        registry.register(Box::new(rate_limit_marks_total.clone()))?;
        registry.register(Box::new(credential_refreshes_total.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(settled_cost_total.clone()))?;
        registry.register(Box::new(streams_aborted_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            requests_total,
            request_duration_seconds,
            account_selections_total,
            rate_limit_marks_total,
            credential_refreshes_total,
            tokens_total,
            settled_cost_total,
            streams_aborted_total,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a finished request
    pub fn record_request(&self, service: &str, outcome: &str, duration_secs: f64) {
        self.requests_total
            .with_label_values(&[service, outcome])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[service, outcome])
            .observe(duration_secs);
    }

    pub fn record_selection(&self, platform: &str, source: &str) {
        self.account_selections_total
            .with_label_values(&[platform, source])
            .inc();
    }

    pub fn record_rate_limit_mark(&self, account_id: &str) {
        self.rate_limit_marks_total
            .with_label_values(&[account_id])
            .inc();
    }

    pub fn record_credential(&self, outcome: &str) {
        self.credential_refreshes_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Record token usage for one request
    pub fn record_tokens(
        &self,
        model: &str,
        input: u64,
        output: u64,
        cache_creation: u64,
        cache_read: u64,
    ) {
        for (kind, count) in [
            ("input", input),
            ("output", output),
            ("cache_creation", cache_creation),
            ("cache_read", cache_read),
        ] {
            if count > 0 {
                self.tokens_total
                    .with_label_values(&[model, kind])
                    .inc_by(count);
            }
        }
    }

    pub fn record_settled_cost(&self, model: &str, cost: f64) {
        if cost > 0.0 {
            self.settled_cost_total.with_label_values(&[model]).inc_by(cost);
        }
    }

    pub fn record_stream_aborted(&self, service: &str) {
        self.streams_aborted_total
            .with_label_values(&[service])
            .inc();
    }
}
