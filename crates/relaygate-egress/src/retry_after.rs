//! Retry-After header parsing utilities
//!
//! Providers say how long to back off in one of three ways:
//! 1. `retry-after: 60` (seconds)
//! 2. `retry-after: Wed, 21 Oct 2015 07:28:00 GMT` (HTTP-date, RFC 7231)
//! 3. `anthropic-ratelimit-unified-reset: 1735689600` (epoch seconds when the window resets)

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use tracing::debug;

/// Epoch-seconds reset header sent by Claude subscription endpoints
pub const UNIFIED_RESET_HEADER: &str = "anthropic-ratelimit-unified-reset";

/// Parse the `retry-after` HTTP header value relative to the current time.
///
/// # Examples
/// ```
/// use relaygate_egress::parse_retry_after;
///
/// assert_eq!(parse_retry_after("60"), Some(60));
/// assert_eq!(parse_retry_after("invalid"), None);
/// assert_eq!(parse_retry_after(""), None);
/// ```
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    parse_retry_after_at(header_value, Utc::now())
}

/// Parse the `retry-after` HTTP header value relative to `now`.
pub fn parse_retry_after_at(header_value: &str, now: DateTime<Utc>) -> Option<u64> {
    if let Ok(seconds) = header_value.trim().parse::<u64>() {
        debug!(
            retry_after_seconds = seconds,
            "Parsed retry-after header (numeric format)"
        );
        return Some(seconds);
    }

    if let Ok(target_time) = DateTime::parse_from_rfc2822(header_value.trim()) {
        // Past dates mean "retry now"
        let seconds = target_time
            .signed_duration_since(now)
            .num_seconds()
            .max(0) as u64;
        debug!(
            retry_after_seconds = seconds,
            target_time = %target_time,
            "Parsed retry-after header (HTTP-date format)"
        );
        return Some(seconds);
    }

    debug!(
        header_value = header_value,
        "Failed to parse retry-after header"
    );
    None
}

/// Seconds until an epoch-seconds reset timestamp
pub fn parse_unified_reset_at(header_value: &str, now: DateTime<Utc>) -> Option<u64> {
    let reset = header_value.trim().parse::<i64>().ok()?;
    Some(reset.saturating_sub(now.timestamp()).max(0) as u64)
}

/// Back-off derived from response headers, preferring `retry-after`
pub fn retry_after_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<u64> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    header("retry-after")
        .and_then(|v| parse_retry_after_at(v, now))
        .or_else(|| header(UNIFIED_RESET_HEADER).and_then(|v| parse_unified_reset_at(v, now)))
}
