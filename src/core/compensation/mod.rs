//! Periodic reconciliation of everything that fell through the real-time
//! path: unpublished alerts, dead letters and unacknowledged notifications.
//!
//! One cycle runs the three lanes concurrently and records a task log per
//! lane plus a MONITORING summary. Claims are conditional updates in the
//! store, so a record is only ever worked by one lane invocation.

pub mod backoff;
mod consumer;
mod notification;
mod producer;
mod stats;

pub use stats::{CompensationHealth, CompensationStats, HealthLevel};

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use self::backoff::BackoffPolicy;
use self::stats::CycleCounts;
use crate::core::config::{CompensationConfig, LaneConfig};
use crate::core::notify::NotificationManager;
use crate::core::state::CompensationTaskType;
use crate::core::store::AlertStore;
use crate::core::store::now_ms;
use crate::core::store::types::{CompensationTaskLog, TaskResult};
use crate::core::transport::Transport;

/// What one lane did in one cycle.
#[derive(Debug, Clone, Default)]
pub(crate) struct LaneOutcome {
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: Option<String>,
    pub error: Option<String>,
    pub details: serde_json::Value,
}

impl LaneOutcome {
    pub(crate) fn skipped(reason: &str) -> Self {
        Self {
            skipped: Some(reason.to_string()),
            ..Self::default()
        }
    }

    fn result(&self) -> TaskResult {
        if self.skipped.is_some() {
            TaskResult::Skipped
        } else if self.error.is_some() && self.success == 0 {
            TaskResult::Failed
        } else {
            TaskResult::from_counts(self.success, self.failed)
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub producer: LaneSummary,
    pub consumer: LaneSummary,
    pub notification: LaneSummary,
    pub errors: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LaneSummary {
    pub result: TaskResult,
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub details: serde_json::Value,
}

impl From<&LaneOutcome> for LaneSummary {
    fn from(o: &LaneOutcome) -> Self {
        Self {
            result: o.result(),
            processed: o.processed,
            success: o.success,
            failed: o.failed,
            details: o.details.clone(),
        }
    }
}

pub struct CompensationOrchestrator {
    store: AlertStore,
    transport: Arc<Transport>,
    notifier: Arc<NotificationManager>,
    config: CompensationConfig,
    executor_host: String,
    stats: Mutex<CompensationStats>,
    cancel: CancellationToken,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CompensationOrchestrator {
    pub fn new(
        store: AlertStore,
        transport: Arc<Transport>,
        notifier: Arc<NotificationManager>,
        config: CompensationConfig,
    ) -> Arc<Self> {
        let executor_host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Arc::new(Self {
            store,
            transport,
            notifier,
            config,
            executor_host,
            stats: Mutex::new(CompensationStats::default()),
            cancel: CancellationToken::new(),
            handle: tokio::sync::Mutex::new(None),
        })
    }

    /// Release claims abandoned by a previous process, then start the
    /// cycle loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.config.enabled {
            info!("Compensation disabled by configuration");
            return Ok(());
        }
        let mut slot = self.handle.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        self.recover_stale_claims().await?;
        self.with_stats(|s| {
            s.initialized = true;
            s.running = true;
        });

        let this = self.clone();
        let cancel = self.cancel.clone();
        let interval = Duration::from_secs(self.config.cycle_interval_seconds.max(1));
        *slot = Some(tokio::spawn(async move {
            info!("Compensation loop started (every {}s)", interval.as_secs());
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                this.run_cycle().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            this.with_stats(|s| s.running = false);
            info!("Compensation loop stopped");
        }));
        Ok(())
    }

    pub async fn recover_stale_claims(&self) -> Result<()> {
        let older_than = now_ms() - (self.config.claim_timeout_seconds as i64) * 1000;
        let publish = self.store.release_stale_publish_claims(older_than).await?;
        let notifications = self
            .store
            .release_stale_notification_claims(older_than)
            .await?;
        if publish + notifications > 0 {
            warn!(
                "Released {} stale publish claim(s) and {} stale notification claim(s)",
                publish, notifications
            );
        }
        Ok(())
    }

    /// Signal the loop and wait up to the grace period, then abort it.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        let Some(mut handle) = handle else {
            return;
        };
        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!(
                "Compensation cycle still running after {}s, aborting",
                grace.as_secs()
            );
            handle.abort();
            self.with_stats(|s| s.running = false);
        }
    }

    fn with_stats(&self, f: impl FnOnce(&mut CompensationStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    pub fn stats(&self) -> CompensationStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn health(&self) -> CompensationHealth {
        self.stats().health()
    }

    fn created_after_ms(&self) -> i64 {
        now_ms() - (self.config.max_age_hours as i64) * 3_600_000
    }

    fn policy(&self, lane: &LaneConfig) -> BackoffPolicy {
        BackoffPolicy::for_lane(lane, self.config.backoff_ceiling_seconds)
    }

    /// One reconciliation pass over all enabled lanes.
    pub async fn run_cycle(&self) -> CycleReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let created_after = self.created_after_ms();
        let cfg = &self.config;

        let (producer, consumer, notification) = tokio::join!(
            lane(
                &cfg.producer,
                producer::run(
                    &self.store,
                    &self.transport,
                    self.policy(&cfg.producer),
                    cfg.producer.batch_size,
                    created_after,
                    started_at,
                )
            ),
            lane(
                &cfg.consumer,
                consumer::run(
                    &self.store,
                    &self.transport,
                    &cfg.dead_letter,
                    cfg.consumer.batch_size,
                    started_at,
                )
            ),
            lane(
                &cfg.notification,
                notification::run(
                    &self.store,
                    &self.notifier,
                    self.policy(&cfg.notification),
                    cfg.notification.batch_size,
                    created_after,
                    started_at,
                )
            ),
        );

        let duration_ms = clock.elapsed().as_millis() as u64;
        let completed_at = Utc::now();
        let lanes = [
            (CompensationTaskType::Producer, &producer),
            (CompensationTaskType::Consumer, &consumer),
            (CompensationTaskType::Notification, &notification),
        ];
        let errors = lanes.iter().filter(|(_, o)| o.error.is_some()).count() as u64;

        for (task_type, outcome) in lanes {
            self.write_log(task_type, outcome, started_at, completed_at, duration_ms)
                .await;
        }

        let counts = CycleCounts {
            producer_compensated: producer.success,
            consumer_requeued: detail(&consumer, "requeued"),
            consumer_discarded: detail(&consumer, "discarded"),
            notifications_resent: notification.success,
            notifications_expired: detail(&notification, "expired"),
            errors,
        };
        let report = CycleReport {
            started_at,
            duration_ms,
            producer: LaneSummary::from(&producer),
            consumer: LaneSummary::from(&consumer),
            notification: LaneSummary::from(&notification),
            errors,
        };

        let summary = LaneOutcome {
            processed: producer.processed + consumer.processed + notification.processed,
            success: producer.success + consumer.success + notification.success,
            failed: producer.failed + consumer.failed + notification.failed,
            skipped: None,
            error: (errors > 0).then(|| format!("{errors} lane(s) reported errors")),
            details: serde_json::to_value(&report).unwrap_or_default(),
        };
        self.write_log(
            CompensationTaskType::Monitoring,
            &summary,
            started_at,
            completed_at,
            duration_ms,
        )
        .await;

        self.with_stats(|s| s.record_cycle(&counts, duration_ms as f64, completed_at));
        if summary.processed > 0 || errors > 0 {
            info!(
                "Compensation cycle: {} processed, {} recovered, {} failed, {} error(s) in {}ms",
                summary.processed, summary.success, summary.failed, errors, duration_ms
            );
        }
        report
    }

    async fn write_log(
        &self,
        task_type: CompensationTaskType,
        outcome: &LaneOutcome,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
    ) {
        let log = CompensationTaskLog {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_type,
            result: outcome.result().as_str().to_string(),
            processed_count: outcome.processed,
            success_count: outcome.success,
            failed_count: outcome.failed,
            started_at,
            completed_at,
            duration_ms,
            error_message: outcome.error.clone().or_else(|| outcome.skipped.clone()),
            executor_host: self.executor_host.clone(),
            details: Some(outcome.details.clone()),
        };
        if let Err(e) = self.store.insert_task_log(&log).await {
            error!("Failed to write {} task log: {}", task_type.as_str(), e);
        }
    }
}

async fn lane<F>(config: &LaneConfig, work: F) -> LaneOutcome
where
    F: Future<Output = Result<LaneOutcome>>,
{
    if !config.enabled {
        return LaneOutcome::skipped("lane disabled");
    }
    match work.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Compensation lane failed: {}", e);
            LaneOutcome {
                error: Some(e.to_string()),
                ..LaneOutcome::default()
            }
        }
    }
}

fn detail(outcome: &LaneOutcome, key: &str) -> u64 {
    outcome.details.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::NotifyConfig;
    use crate::core::merge::AlertSink;
    use crate::core::notify::tests::meta;
    use crate::core::notify::SseFrame;
    use crate::core::state::{NotificationStatus, PublishStatus};
    use crate::core::store::test_store;
    use crate::core::store::types::AckOutcome;
    use crate::core::transport::broker::{Broker, DeadReason, DeathInfo, MessageHeaders};
    use crate::core::transport::message::tests::sample_alert;
    use crate::core::transport::testing::{FlakyBroker, test_transport_config};
    use crate::core::transport::AlertPublisher;

    fn quick_lane() -> LaneConfig {
        LaneConfig {
            interval_seconds: 0,
            ..LaneConfig::default()
        }
    }

    fn quick_config() -> CompensationConfig {
        CompensationConfig {
            cycle_interval_seconds: 1,
            shutdown_grace_seconds: 1,
            producer: quick_lane(),
            consumer: quick_lane(),
            notification: quick_lane(),
            ..CompensationConfig::default()
        }
    }

    struct Fixture {
        store: AlertStore,
        broker: Arc<FlakyBroker>,
        transport: Arc<Transport>,
        notifier: Arc<NotificationManager>,
        orchestrator: Arc<CompensationOrchestrator>,
    }

    async fn fixture(notify: NotifyConfig) -> Fixture {
        let store = test_store();
        let broker = Arc::new(FlakyBroker::new());
        let transport = Arc::new(Transport::new(broker.clone(), test_transport_config()));
        transport.declare_topology().await.unwrap();
        let notifier = NotificationManager::new(store.clone(), notify);
        let orchestrator = CompensationOrchestrator::new(
            store.clone(),
            transport.clone(),
            notifier.clone(),
            quick_config(),
        );
        Fixture {
            store,
            broker,
            transport,
            notifier,
            orchestrator,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn outage_exhausts_producer_retries() {
        let f = fixture(NotifyConfig::default()).await;
        let publisher = AlertPublisher::new(f.store.clone(), f.transport.clone(), 3);

        f.broker.set_down(true);
        publisher.hand_off(sample_alert("alert-c", 3)).await.unwrap();
        let rec = f
            .store
            .get_publish_record_by_message("msg-alert-c")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, PublishStatus::Failed);
        assert_eq!(rec.retries, 1);

        // hand-off failure plus two compensated attempts spend max_retries = 3
        for expected in 2..=3 {
            let report = f.orchestrator.run_cycle().await;
            assert_eq!(report.producer.failed, 1);
            let rec = f.store.get_publish_record(rec.id).await.unwrap().unwrap();
            assert_eq!(rec.retries, expected);
        }
        let rec = f.store.get_publish_record(rec.id).await.unwrap().unwrap();
        assert_eq!(rec.status, PublishStatus::Failed);

        // budget spent: later cycles leave it alone
        let report = f.orchestrator.run_cycle().await;
        assert_eq!(report.producer.processed, 0);
        assert_eq!(f.store.list_terminal_publish_failures(10).await.unwrap().len(), 1);
        assert_eq!(f.transport.queue_depths().await.unwrap(), (0, 0));

        let logs = f
            .store
            .recent_task_logs(Some(CompensationTaskType::Producer), 10)
            .await
            .unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(f.orchestrator.stats().total_cycles, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fresh_publish_record_waits_for_backoff() {
        let f = fixture(NotifyConfig::default()).await;
        let orchestrator = CompensationOrchestrator::new(
            f.store.clone(),
            f.transport.clone(),
            f.notifier.clone(),
            CompensationConfig::default(),
        );
        // a hand-off still publishing owns this PENDING row
        let rec = f
            .store
            .create_publish_record("m-fresh", "a-fresh", "{}", 3)
            .await
            .unwrap();

        let report = orchestrator.run_cycle().await;
        assert_eq!(report.producer.processed, 0);
        assert_eq!(report.producer.details["waiting_backoff"], 1);
        let rec = f.store.get_publish_record(rec.id).await.unwrap().unwrap();
        assert_eq!(rec.status, PublishStatus::Pending);
        assert_eq!(f.transport.queue_depths().await.unwrap(), (0, 0));

        f.store
            .backdate_publish_record(rec.id, now_ms() - 60_000)
            .await
            .unwrap();
        let report = orchestrator.run_cycle().await;
        assert_eq!(report.producer.success, 1);
        assert_eq!(f.transport.queue_depths().await.unwrap(), (1, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn producer_recovers_after_outage() {
        let f = fixture(NotifyConfig::default()).await;
        let publisher = AlertPublisher::new(f.store.clone(), f.transport.clone(), 3);
        f.broker.set_down(true);
        publisher.hand_off(sample_alert("alert-r", 3)).await.unwrap();
        f.broker.set_down(false);

        let report = f.orchestrator.run_cycle().await;
        assert_eq!(report.producer.success, 1);
        let rec = f
            .store
            .get_publish_record_by_message("msg-alert-r")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, PublishStatus::Enqueued);
        assert!(rec.sent_at.is_some());
        assert_eq!(f.transport.queue_depths().await.unwrap(), (1, 0));
        assert_eq!(f.orchestrator.stats().producer_compensated, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dead_letters_are_requeued_or_archived() {
        let f = fixture(NotifyConfig::default()).await;
        let dlq = test_transport_config().dead_letter_queue;
        let now = now_ms();
        let dead = |deaths: u32| MessageHeaders {
            retry_count: 0,
            first_attempt_ms: now,
            death: Some(DeathInfo {
                count: deaths,
                reason: DeadReason::Rejected,
                first_death_ms: now,
                queue: "alerts".into(),
            }),
        };
        let low = sample_alert("low", 5).to_bytes().unwrap();
        let high = sample_alert("high", 1).to_bytes().unwrap();
        f.broker.publish(&dlq, &low, &dead(1)).unwrap();
        f.broker.publish(&dlq, &high, &dead(3)).unwrap();
        f.broker.publish(&dlq, &low, &dead(3)).unwrap();
        f.broker
            .publish(&dlq, b"{broken", &MessageHeaders::default())
            .unwrap();

        let report = f.orchestrator.run_cycle().await;
        assert_eq!(report.consumer.processed, 4);
        assert_eq!(report.consumer.details["requeued"], 2);
        assert_eq!(report.consumer.details["discarded"], 2);
        assert_eq!(f.transport.queue_depths().await.unwrap(), (2, 0));

        let archive = f.store.list_dead_letter_archive(10).await.unwrap();
        assert_eq!(archive.len(), 2);
        assert!(archive.iter().any(|a| a.alert_id.is_none()));
        assert!(archive.iter().any(|a| a.alert_id.as_deref() == Some("low")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn consumer_lane_skips_when_disconnected() {
        let f = fixture(NotifyConfig::default()).await;
        f.broker.set_down(true);
        let report = f.orchestrator.run_cycle().await;
        assert_eq!(report.consumer.result, TaskResult::Skipped);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn expired_notification_is_resent_after_reconnect() {
        let notify = NotifyConfig {
            ack_timeout_seconds: 1,
            ..NotifyConfig::default()
        };
        let f = fixture(notify).await;
        let first = f.notifier.register(meta("ops")).await.unwrap();
        f.notifier.broadcast(&sample_alert("alert-d", 2)).await;
        f.notifier.unregister(&first.connection_id, "ops").await;
        drop(first);

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        let mut again = f.notifier.register(meta("ops")).await.unwrap();
        let report = f.orchestrator.run_cycle().await;
        assert_eq!(report.notification.details["expired"], 1);
        assert_eq!(report.notification.success, 1);

        let body = match again.receiver.recv().await {
            Some(SseFrame::Data(body)) => body,
            other => panic!("unexpected frame {:?}", other),
        };
        let frame: serde_json::Value = serde_json::from_str(&body).unwrap();
        let notification_id = frame["notificationId"].as_str().unwrap();
        assert_eq!(
            f.notifier.acknowledge(notification_id, "ops").await.unwrap(),
            AckOutcome::Acknowledged
        );
        let rec = f
            .store
            .get_notification_for_client(notification_id, "ops")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, NotificationStatus::AckReceived);
        assert_eq!(rec.retries, 1);
    }

    #[tokio::test]
    async fn start_recovers_claims_and_stop_is_bounded() {
        let f = fixture(NotifyConfig::default()).await;
        let rec = f
            .store
            .create_publish_record("m-1", "a-1", "{}", 3)
            .await
            .unwrap();
        assert!(f.store.claim_publish_record(rec.id).await.unwrap());
        f.store.backdate_publish_record(rec.id, 1_000).await.unwrap();
        // producer lane would republish; keep the record observable
        f.broker.set_down(true);

        f.orchestrator.start().await.unwrap();
        let stats = f.orchestrator.stats();
        assert!(stats.initialized && stats.running);
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.orchestrator.stop().await;

        assert!(!f.orchestrator.stats().running);
        assert!(f.orchestrator.stats().total_cycles >= 1);
        let rec = f.store.get_publish_record(rec.id).await.unwrap().unwrap();
        assert_ne!(rec.status, PublishStatus::Compensating);
        assert_eq!(f.orchestrator.health().level, HealthLevel::Critical);
    }

    #[test]
    fn lane_result_mapping() {
        let mut o = LaneOutcome::default();
        assert_eq!(o.result(), TaskResult::Success);
        o.failed = 2;
        assert_eq!(o.result(), TaskResult::Failed);
        o.success = 1;
        assert_eq!(o.result(), TaskResult::Partial);
        assert_eq!(LaneOutcome::skipped("x").result(), TaskResult::Skipped);
    }
}
