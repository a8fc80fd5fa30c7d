use chrono::{DateTime, Utc};
use serde::Serialize;

const CYCLE_TIME_DECAY: f64 = 0.7;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompensationStats {
    pub running: bool,
    pub initialized: bool,
    pub total_cycles: u64,
    pub failed_cycles: u64,
    pub producer_compensated: u64,
    pub consumer_requeued: u64,
    pub consumer_discarded: u64,
    pub notifications_resent: u64,
    pub notifications_expired: u64,
    pub total_errors: u64,
    pub last_execution: Option<DateTime<Utc>>,
    pub average_cycle_ms: f64,
    /// Percentage of cycles that finished without a lane error.
    pub success_rate: f64,
}

/// Counts folded into the rolling stats after each cycle.
#[derive(Debug, Clone, Default)]
pub(crate) struct CycleCounts {
    pub producer_compensated: u64,
    pub consumer_requeued: u64,
    pub consumer_discarded: u64,
    pub notifications_resent: u64,
    pub notifications_expired: u64,
    pub errors: u64,
}

impl CompensationStats {
    pub(crate) fn record_cycle(&mut self, counts: &CycleCounts, duration_ms: f64, at: DateTime<Utc>) {
        self.total_cycles += 1;
        if counts.errors > 0 {
            self.failed_cycles += 1;
        }
        self.producer_compensated += counts.producer_compensated;
        self.consumer_requeued += counts.consumer_requeued;
        self.consumer_discarded += counts.consumer_discarded;
        self.notifications_resent += counts.notifications_resent;
        self.notifications_expired += counts.notifications_expired;
        self.total_errors += counts.errors;
        self.last_execution = Some(at);

        self.average_cycle_ms = if self.total_cycles == 1 {
            duration_ms
        } else {
            self.average_cycle_ms * CYCLE_TIME_DECAY + duration_ms * (1.0 - CYCLE_TIME_DECAY)
        };
        let ok = self.total_cycles - self.failed_cycles;
        self.success_rate = ok as f64 * 100.0 / self.total_cycles as f64;
    }

    pub fn health(&self) -> CompensationHealth {
        let mut score: i32 = 100;
        let mut issues = Vec::new();
        if !self.running {
            score -= 50;
            issues.push("compensation loop is not running".to_string());
        }
        if !self.initialized {
            score -= 30;
            issues.push("startup recovery has not completed".to_string());
        }
        if self.total_cycles > 0 && self.success_rate < 90.0 {
            score -= 20;
            issues.push(format!("cycle success rate is {:.1}%", self.success_rate));
        }
        if self.total_errors > 10 {
            score -= 15;
            issues.push(format!("{} lane errors so far", self.total_errors));
        }

        let level = if score >= 90 {
            HealthLevel::Healthy
        } else if score >= 70 {
            HealthLevel::Warning
        } else {
            HealthLevel::Critical
        };
        CompensationHealth {
            level,
            score,
            issues,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompensationHealth {
    pub level: HealthLevel,
    pub score: i32,
    pub issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_average_and_success_rate() {
        let mut stats = CompensationStats::default();
        let now = Utc::now();
        stats.record_cycle(&CycleCounts::default(), 100.0, now);
        assert_eq!(stats.average_cycle_ms, 100.0);
        stats.record_cycle(
            &CycleCounts {
                errors: 1,
                ..CycleCounts::default()
            },
            200.0,
            now,
        );
        assert!((stats.average_cycle_ms - 130.0).abs() < 1e-9);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.total_errors, 1);
    }

    #[test]
    fn health_levels() {
        let mut stats = CompensationStats {
            running: true,
            initialized: true,
            ..CompensationStats::default()
        };
        assert_eq!(stats.health().level, HealthLevel::Healthy);

        stats.total_cycles = 10;
        stats.success_rate = 80.0;
        let health = stats.health();
        assert_eq!(health.level, HealthLevel::Warning);
        assert_eq!(health.issues.len(), 1);

        stats.running = false;
        assert_eq!(stats.health().level, HealthLevel::Critical);
    }
}
