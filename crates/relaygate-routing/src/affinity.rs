//! Session affinity
//!
//! Maps a conversation fingerprint to the account that served it, so follow-up
//! turns land on the same upstream (and hit its prompt cache). Entries expire 30
//! minutes after they were written; each read pushes expiry to at least 15
//! minutes out.
//!
//! The cache is advisory. Two concurrent first requests for one session may both
//! write; the last writer wins.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};
use tracing::debug;

use relaygate_core::Clock;

/// Key-value store with per-entry expiry
#[async_trait]
pub trait TtlCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: String, ttl: Duration);

    /// Push the entry's expiry to at least `now + ttl`; never shortens it
    async fn extend(&self, key: &str, ttl: Duration);

    async fn remove(&self, key: &str);
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Default spacing between sweeps triggered by writes
pub const DEFAULT_SWEEP_INTERVAL_SECS: i64 = 60;

/// In-process [`TtlCache`]
///
/// Expired entries are dropped on read, and writes sweep the whole map at most
/// once per sweep interval so keys that are never read again do not pile up.
pub struct InMemoryTtlCache {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
    sweep_interval_secs: i64,
    last_sweep: AtomicI64,
}

impl InMemoryTtlCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let started = clock.now().timestamp();
        Self {
            entries: DashMap::new(),
            clock,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            last_sweep: AtomicI64::new(started),
        }
    }

    pub fn with_sweep_interval(mut self, secs: i64) -> Self {
        self.sweep_interval_secs = secs.max(0);
        self
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    fn maybe_sweep(&self, now: DateTime<Utc>) {
        let now_secs = now.timestamp();
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now_secs.saturating_sub(last) < self.sweep_interval_secs {
            return;
        }
        // One writer wins the sweep; the rest carry on.
        if self
            .last_sweep
            .compare_exchange(last, now_secs, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let before = self.entries.len();
            self.entries.retain(|_, entry| entry.expires_at > now);
            debug!(
                removed = before.saturating_sub(self.entries.len()),
                "Swept expired cache entries"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl TtlCache for InMemoryTtlCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        {
            let entry = self.entries.get(key)?;
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        // Guard released above; removing while holding it would deadlock the shard.
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let now = self.clock.now();
        self.maybe_sweep(now);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    async fn extend(&self, key: &str, ttl: Duration) {
        let target = self.clock.now() + ttl;
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = entry.expires_at.max(target);
        }
    }

    async fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Affinity timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityConfig {
    /// Lifetime of a freshly written mapping
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Minimum remaining lifetime after a read
    #[serde(default = "default_renewal_secs")]
    pub renewal_secs: u64,
}

fn default_ttl_secs() -> u64 {
    30 * 60
}

fn default_renewal_secs() -> u64 {
    15 * 60
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            renewal_secs: default_renewal_secs(),
        }
    }
}

/// Session hash to account id mapping
#[derive(Clone)]
pub struct SessionAffinityCache {
    cache: Arc<dyn TtlCache>,
    ttl: Duration,
    renewal: Duration,
}

impl SessionAffinityCache {
    pub fn new(cache: Arc<dyn TtlCache>, config: &AffinityConfig) -> Self {
        Self {
            cache,
            ttl: Duration::seconds(config.ttl_secs as i64),
            renewal: Duration::seconds(config.renewal_secs as i64),
        }
    }

    /// In-process cache with default timing
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(
            Arc::new(InMemoryTtlCache::new(clock)),
            &AffinityConfig::default(),
        )
    }

    fn key(session_hash: &str) -> String {
        format!("sticky_session:{session_hash}")
    }

    /// Mapped account for a session, renewing the entry on hit
    pub async fn get(&self, session_hash: &str) -> Option<String> {
        if session_hash.is_empty() {
            return None;
        }
        let key = Self::key(session_hash);
        let account_id = self.cache.get(&key).await?;
        self.cache.extend(&key, self.renewal).await;
        Some(account_id)
    }

    pub async fn set(&self, session_hash: &str, account_id: &str) {
        if session_hash.is_empty() {
            return;
        }
        self.cache
            .set(&Self::key(session_hash), account_id.to_string(), self.ttl)
            .await;
        debug!(session_hash = %session_hash, account_id = %account_id, "Session mapped");
    }

    pub async fn evict(&self, session_hash: &str) {
        if session_hash.is_empty() {
            return;
        }
        self.cache.remove(&Self::key(session_hash)).await;
        debug!(session_hash = %session_hash, "Session mapping evicted");
    }
}
