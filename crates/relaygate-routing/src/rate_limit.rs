//! Rate-limit cooldown
//!
//! Marking is a single store command (status, window end and last error in one
//! update). Nothing sweeps expired windows: availability is computed against the
//! current time on every read, and a stale `rate_limited` record is flipped back
//! to `active` the next time the pool sees it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use relaygate_core::{Account, AccountStatus, AccountStore, Clock, Result, cooldown_until};

/// Default cooldown when the upstream does not say how long to back off
pub const DEFAULT_COOLDOWN_SECS: u64 = 60;

#[derive(Clone)]
pub struct RateLimitController {
    store: Arc<dyn AccountStore>,
    clock: Arc<dyn Clock>,
    fallback_cooldown_secs: u64,
}

impl RateLimitController {
    pub fn new(store: Arc<dyn AccountStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            fallback_cooldown_secs: DEFAULT_COOLDOWN_SECS,
        }
    }

    pub fn with_fallback_cooldown(mut self, secs: u64) -> Self {
        self.fallback_cooldown_secs = secs;
        self
    }

    /// Put an account into cooldown until `until`
    pub async fn mark_limited(
        &self,
        account_id: &str,
        until: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<()> {
        warn!(
            account_id = %account_id,
            until = %until,
            error = last_error.as_deref().unwrap_or(""),
            "Marking account rate limited"
        );
        self.store
            .mark_rate_limited(account_id, until, last_error)
            .await
    }

    /// Window end for a throttling signal, using the fallback when none was given
    ///
    /// Hints longer than [`relaygate_core::MAX_COOLDOWN_SECS`] are capped.
    pub fn limited_until(&self, retry_after_secs: Option<u64>) -> DateTime<Utc> {
        cooldown_until(
            self.clock.now(),
            retry_after_secs.unwrap_or(self.fallback_cooldown_secs),
        )
    }

    /// Pure availability predicate
    pub fn is_available(account: &Account, now: DateTime<Utc>) -> bool {
        account.is_available(now)
    }

    /// Return an account whose cooldown has elapsed to `active`
    ///
    /// Updates the snapshot in place and issues a conditional clear to the store.
    /// Returns whether the snapshot was recovered.
    pub async fn recover_if_expired(&self, account: &mut Account, now: DateTime<Utc>) -> bool {
        if !account.rate_limit_expired(now) {
            return false;
        }

        match self.store.clear_rate_limit(&account.id, now).await {
            Ok(cleared) => {
                if cleared {
                    info!(account_id = %account.id, "Rate limit window elapsed, account active again");
                }
            }
            // The snapshot is still correct for this selection; the next read retries.
            Err(e) => warn!(account_id = %account.id, error = %e, "Failed to clear rate limit"),
        }

        account.status = AccountStatus::Active;
        account.rate_limited_until = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use relaygate_core::{InMemoryAccountStore, MAX_COOLDOWN_SECS, ManualClock, Platform};

    fn setup() -> (Arc<ManualClock>, Arc<InMemoryAccountStore>, RateLimitController) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryAccountStore::with_accounts([Account::new(
            "a",
            Platform::Claude,
        )]));
        let controller = RateLimitController::new(store.clone(), clock.clone());
        (clock, store, controller)
    }

    #[tokio::test]
    async fn test_mark_limited_sets_all_fields() {
        let (clock, store, controller) = setup();
        let until = controller.limited_until(Some(30));
        assert_eq!(until, clock.now() + Duration::seconds(30));

        controller
            .mark_limited("a", until, Some("slow down".into()))
            .await
            .unwrap();

        let account = store.get("a").unwrap();
        assert_eq!(account.status, AccountStatus::RateLimited);
        assert_eq!(account.rate_limited_until, Some(until));
        assert_eq!(account.last_error.as_deref(), Some("slow down"));
        assert!(!RateLimitController::is_available(&account, clock.now()));
    }

    #[tokio::test]
    async fn test_huge_retry_after_is_capped() {
        let (clock, _store, controller) = setup();
        let cap = clock.now() + Duration::seconds(MAX_COOLDOWN_SECS as i64);
        assert_eq!(controller.limited_until(Some(10_000_000_000_000)), cap);
        assert_eq!(controller.limited_until(Some(u64::MAX)), cap);
        assert_eq!(controller.limited_until(Some(0)), clock.now());
    }

    #[tokio::test]
    async fn test_fallback_cooldown() {
        let (clock, _store, controller) = setup();
        assert_eq!(
            controller.limited_until(None),
            clock.now() + Duration::seconds(60)
        );

        let controller = controller.with_fallback_cooldown(120);
        assert_eq!(
            controller.limited_until(None),
            clock.now() + Duration::seconds(120)
        );
    }

    #[tokio::test]
    async fn test_recover_after_window() {
        let (clock, store, controller) = setup();
        let until = clock.now() + Duration::seconds(30);
        controller.mark_limited("a", until, None).await.unwrap();

        let mut snapshot = store.get("a").unwrap();
        assert!(!controller.recover_if_expired(&mut snapshot, clock.now()).await);
        assert_eq!(snapshot.status, AccountStatus::RateLimited);

        clock.advance(Duration::seconds(31));
        assert!(controller.recover_if_expired(&mut snapshot, clock.now()).await);
        assert!(snapshot.is_available(clock.now()));
        assert_eq!(store.get("a").unwrap().status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn test_recover_leaves_extended_window() {
        let (clock, store, controller) = setup();
        controller
            .mark_limited("a", clock.now() + Duration::seconds(10), None)
            .await
            .unwrap();
        let mut stale = store.get("a").unwrap();

        clock.advance(Duration::seconds(11));
        // A concurrent request extended the window after our snapshot was taken.
        controller
            .mark_limited("a", clock.now() + Duration::seconds(100), None)
            .await
            .unwrap();

        controller.recover_if_expired(&mut stale, clock.now()).await;
        let stored = store.get("a").unwrap();
        assert_eq!(stored.status, AccountStatus::RateLimited);
    }
}
