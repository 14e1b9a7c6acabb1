//! Account scoring
//!
//! Lower scores win. The score favours preferred (low priority number), lightly
//! used, recently idle accounts and keeps traffic away from accounts whose last use
//! was close to their historical rate-limit window.
//!
//! ```text
//! score = priority * priority_weight
//!       + min(usage_count * usage_weight, usage_cap)
//!       + recency penalty (idle < 1m / < 5m / < 30m)
//!       + proximity_weight * (1 - idle / rate_limit_duration)   when that ratio < threshold
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relaygate_core::Account;

/// Tunable scoring constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub priority_weight: f64,
    pub usage_weight: f64,
    pub usage_cap: f64,
    /// Penalty when idle for less than a minute
    pub recency_under_1m: f64,
    pub recency_under_5m: f64,
    pub recency_under_30m: f64,
    pub proximity_weight: f64,
    /// Idle/duration ratio at or above which no proximity penalty applies
    pub proximity_threshold: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            priority_weight: 100.0,
            usage_weight: 0.5,
            usage_cap: 50.0,
            recency_under_1m: 100.0,
            recency_under_5m: 50.0,
            recency_under_30m: 20.0,
            proximity_weight: 200.0,
            proximity_threshold: 0.8,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("priority_weight", self.priority_weight),
            ("usage_weight", self.usage_weight),
            ("usage_cap", self.usage_cap),
            ("recency_under_1m", self.recency_under_1m),
            ("recency_under_5m", self.recency_under_5m),
            ("recency_under_30m", self.recency_under_30m),
            ("proximity_weight", self.proximity_weight),
            ("proximity_threshold", self.proximity_threshold),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{name} must be a finite, non-negative number"));
            }
        }
        Ok(())
    }
}

/// Score one account at `now`
pub fn score(account: &Account, now: DateTime<Utc>, weights: &ScoringWeights) -> f64 {
    let mut score = f64::from(account.priority) * weights.priority_weight;

    score += (account.usage_count as f64 * weights.usage_weight).min(weights.usage_cap);

    if let Some(last_used) = account.last_used_at {
        // Clock skew can put last use in the future; treat that as "just used".
        let idle_secs = (now - last_used).num_milliseconds().max(0) as f64 / 1000.0;

        score += recency_penalty(idle_secs, weights);

        if account.rate_limit_duration_secs > 0 {
            let ratio = idle_secs / account.rate_limit_duration_secs as f64;
            if ratio < weights.proximity_threshold {
                score += weights.proximity_weight * (1.0 - ratio);
            }
        }
    }

    score
}

fn recency_penalty(idle_secs: f64, weights: &ScoringWeights) -> f64 {
    if idle_secs < 60.0 {
        weights.recency_under_1m
    } else if idle_secs < 5.0 * 60.0 {
        weights.recency_under_5m
    } else if idle_secs < 30.0 * 60.0 {
        weights.recency_under_30m
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use relaygate_core::Platform;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn account(priority: i32) -> Account {
        let mut a = Account::new("a", Platform::Claude);
        a.priority = priority;
        a
    }

    #[test]
    fn test_fresh_account_scores_priority_only() {
        let w = ScoringWeights::default();
        assert_eq!(score(&account(10), now(), &w), 1000.0);
        assert_eq!(score(&account(0), now(), &w), 0.0);
    }

    #[test]
    fn test_usage_component_is_capped() {
        let w = ScoringWeights::default();
        let mut a = account(1);
        a.usage_count = 40;
        assert_eq!(score(&a, now(), &w), 120.0);
        a.usage_count = 1_000;
        assert_eq!(score(&a, now(), &w), 150.0);
    }

    #[test]
    fn test_recency_bands() {
        let w = ScoringWeights::default();
        let mut a = account(0);
        let cases = [
            (Duration::seconds(10), 100.0),
            (Duration::minutes(2), 50.0),
            (Duration::minutes(10), 20.0),
            (Duration::minutes(45), 0.0),
        ];
        for (idle, expected) in cases {
            a.last_used_at = Some(now() - idle);
            assert_eq!(score(&a, now(), &w), expected, "idle {idle}");
        }
    }

    #[test]
    fn test_rate_limit_proximity_penalty() {
        let w = ScoringWeights::default();
        let mut a = account(0);
        a.rate_limit_duration_secs = 3600;

        // Idle 36 minutes: ratio 0.6 -> 200 * 0.4 = 80, plus no recency penalty
        a.last_used_at = Some(now() - Duration::minutes(36));
        let s = score(&a, now(), &w);
        assert!((s - 80.0).abs() < 1e-9, "{s}");

        // Idle 50 minutes: ratio >= 0.8 -> no proximity penalty
        a.last_used_at = Some(now() - Duration::minutes(50));
        assert_eq!(score(&a, now(), &w), 0.0);
    }

    #[test]
    fn test_proximity_requires_last_use() {
        let w = ScoringWeights::default();
        let mut a = account(0);
        a.rate_limit_duration_secs = 3600;
        assert_eq!(score(&a, now(), &w), 0.0);
    }

    #[test]
    fn test_custom_weights_and_validation() {
        let w = ScoringWeights {
            priority_weight: 1.0,
            ..Default::default()
        };
        assert_eq!(score(&account(7), now(), &w), 7.0);
        assert!(w.validate().is_ok());

        let bad = ScoringWeights {
            usage_weight: -1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_weights_deserialize_partial() {
        let w: ScoringWeights = serde_yaml::from_str("priority_weight: 10\n").unwrap();
        assert_eq!(w.priority_weight, 10.0);
        assert_eq!(w.proximity_threshold, 0.8);
    }
}
