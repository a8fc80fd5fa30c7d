use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{error, info, warn};

use super::Transport;
use crate::core::error::PipelineError;

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub healthy: bool,
    pub connected: bool,
    pub consumers_alive: usize,
    pub consumers_expected: usize,
    pub main_queue_depth: Option<u64>,
    pub dead_letter_depth: Option<u64>,
    pub consecutive_failures: u32,
    pub repaired: bool,
    pub reconnects: u64,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Default)]
pub(super) struct HealthState {
    consecutive_failures: AtomicU32,
    reconnects: AtomicU64,
    last: Mutex<Option<ProbeReport>>,
}

impl HealthState {
    pub(super) fn last_report(&self) -> Option<ProbeReport> {
        self.last.lock().ok().and_then(|r| r.clone())
    }

    fn remember(&self, report: &ProbeReport) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(report.clone());
        }
    }
}

impl Transport {
    /// Check the connection, queue reachability and consumer liveness.
    /// After `unhealthy_probe_threshold` consecutive bad probes the
    /// connection is rebuilt and consumers restarted.
    pub async fn probe(&self) -> ProbeReport {
        let connected = self.is_connected();
        let (alive, expected) = self.consumer_counts();
        let (depths, mut error) = match self.queue_depths().await {
            Ok((main, dlq)) => ((Some(main), Some(dlq)), None),
            Err(e) => ((None, None), Some(e.to_string())),
        };
        if alive < expected && error.is_none() {
            error = Some(format!("{alive}/{expected} consumer worker(s) alive"));
        }
        let healthy = connected && error.is_none();

        let mut repaired = false;
        let failures = if healthy {
            self.health.consecutive_failures.store(0, Ordering::SeqCst);
            0
        } else {
            let failures = self.health.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                "Transport probe failed ({}/{}): {}",
                failures,
                self.config.unhealthy_probe_threshold,
                error.as_deref().unwrap_or("disconnected")
            );
            if failures >= self.config.unhealthy_probe_threshold {
                match self.self_repair().await {
                    Ok(()) => {
                        repaired = true;
                        self.health.consecutive_failures.store(0, Ordering::SeqCst);
                    }
                    Err(e) => error!("Transport self-repair failed: {}", e),
                }
            }
            failures
        };

        let report = ProbeReport {
            healthy,
            connected,
            consumers_alive: alive,
            consumers_expected: expected,
            main_queue_depth: depths.0,
            dead_letter_depth: depths.1,
            consecutive_failures: failures,
            repaired,
            reconnects: self.health.reconnects.load(Ordering::SeqCst),
            error,
            checked_at: Utc::now(),
        };
        self.health.remember(&report);
        report
    }

    async fn self_repair(&self) -> Result<(), PipelineError> {
        info!("Rebuilding transport connection and consumers");
        self.blocking(|b| b.reconnect()).await?;
        self.health.reconnects.fetch_add(1, Ordering::SeqCst);
        self.declare_topology().await?;
        self.restart_consumers()
    }
}
