use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::core::config::LaneConfig;

/// `base * 2^attempt`, capped. Used for in-process retries (hand-off,
/// publish, reconnect) where the budget is a handful of attempts.
pub fn capped_exponential(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
}

/// Per-record backoff for the compensation lanes. The lane interval is the
/// base; the ceiling keeps a long-failing record from disappearing for days.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    pub exponential: bool,
}

impl BackoffPolicy {
    pub fn for_lane(lane: &LaneConfig, ceiling_seconds: u64) -> Self {
        Self {
            base: Duration::from_secs(lane.interval_seconds),
            ceiling: Duration::from_secs(ceiling_seconds.max(lane.interval_seconds)),
            exponential: lane.exponential_backoff,
        }
    }

    pub fn delay(&self, retries: u32) -> Duration {
        if !self.exponential {
            return self.base.min(self.ceiling);
        }
        let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let ceiling_ms = self.ceiling.as_millis().min(u64::MAX as u128) as u64;
        capped_exponential(base_ms, ceiling_ms, retries)
    }

    /// A record touched at `last_attempt` with `retries` failures is due
    /// again once the backoff delay has elapsed. Fresh records wait one base
    /// interval so an in-flight hand-off is not published twice.
    pub fn is_due(&self, retries: u32, last_attempt: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let elapsed = (now - last_attempt).to_std().unwrap_or(Duration::ZERO);
        elapsed >= self.delay(retries)
    }
}
