//! Wiring of the whole pipeline: store, broker, merge engine, consumers,
//! push channel and compensation, plus the lifecycle hooks that start
//! and drain them in order.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::compensation::CompensationOrchestrator;
use crate::core::config::PipelineConfig;
use crate::core::lifecycle::{LifecycleComponent, LifecycleManager};
use crate::core::merge::storage::LocalObjectStorage;
use crate::core::merge::{AlertSink, MergeEngine};
use crate::core::notify::{AlertArchiveHandler, NotificationManager};
use crate::core::status::{PipelineStatus, RecentFailures};
use crate::core::store::AlertStore;
use crate::core::transport::sqlite_broker::SqliteBroker;
use crate::core::transport::{AlertPublisher, Transport};

pub const BROKER_FILE_NAME: &str = "broker.db";

pub struct Pipeline {
    pub config: PipelineConfig,
    pub data_dir: PathBuf,
    pub store: AlertStore,
    pub transport: Arc<Transport>,
    pub merge: MergeEngine,
    pub notifier: Arc<NotificationManager>,
    pub compensation: Arc<CompensationOrchestrator>,
}

impl Pipeline {
    /// Open durable state under `data_dir` and assemble every stage.
    /// Nothing runs until `start`.
    pub async fn build(config: PipelineConfig, data_dir: &Path) -> Result<Arc<Self>> {
        config.validate()?;
        let store = AlertStore::open(data_dir).await?;
        let broker = Arc::new(SqliteBroker::open(&data_dir.join(BROKER_FILE_NAME))?);
        let transport = Arc::new(Transport::new(broker, config.transport.clone()));

        let sink: Arc<dyn AlertSink> = Arc::new(AlertPublisher::new(
            store.clone(),
            transport.clone(),
            config.compensation.producer.max_retries,
        ));
        let storage = Arc::new(LocalObjectStorage::new(
            data_dir.join(&config.storage.object_dir),
        ));
        let merge = MergeEngine::new(&config, sink, storage)?;

        let notifier = NotificationManager::new(store.clone(), config.notify.clone());
        let compensation = CompensationOrchestrator::new(
            store.clone(),
            transport.clone(),
            notifier.clone(),
            config.compensation.clone(),
        );

        Ok(Arc::new(Self {
            config,
            data_dir: data_dir.to_path_buf(),
            store,
            transport,
            merge,
            notifier,
            compensation,
        }))
    }

    /// Declare queues, attach the archive handler and start compensation.
    /// A broker that is down at boot is left to the liveness probe.
    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.transport.declare_topology().await {
            warn!("Queue topology not declared yet: {}", e);
        }
        let handler = Arc::new(AlertArchiveHandler::new(
            self.store.clone(),
            self.notifier.clone(),
        ));
        self.transport.consume(handler)?;
        self.compensation.start().await?;
        info!("Alert pipeline started");
        Ok(())
    }

    /// Drain in dependency order: merge groups first so their alerts reach
    /// the broker, then consumers, then the compensation loop.
    pub async fn shutdown(&self) {
        let flushed = self.merge.flush_all().await;
        self.transport.stop_consumers();
        self.compensation.stop().await;
        info!("Alert pipeline stopped ({} open group(s) flushed)", flushed);
    }

    pub async fn status(&self) -> Result<PipelineStatus> {
        let limit = RecentFailures::limit();
        let publish = self.store.count_publish_by_status().await?;
        let notifications = self.store.count_notifications_by_status().await?;
        let recent_failures = RecentFailures::collect(
            &self.store.list_terminal_publish_failures(limit).await?,
            &self.store.list_terminal_notification_failures(limit).await?,
            &self.store.list_dead_letter_archive(limit).await?,
        );
        let (main_queue_depth, dead_letter_depth) = match self.transport.queue_depths().await {
            Ok((main, dlq)) => (Some(main), Some(dlq)),
            Err(e) => {
                warn!("Queue depths unavailable: {}", e);
                (None, None)
            }
        };
        let notify = self.notifier.stats().await;

        Ok(PipelineStatus {
            generated_at: chrono::Utc::now(),
            publish,
            notifications,
            alerts_archived: self.store.count_alerts().await?,
            dead_letters_archived: self.store.count_dead_letter_archive().await?,
            main_queue_depth,
            dead_letter_depth,
            connected_clients: notify.connected_clients,
            merge: self.merge.status(),
            transport: self.transport.stats(),
            notify,
            compensation: self.compensation.stats(),
            compensation_health: self.compensation.health(),
            recent_failures,
        })
    }
}

/// Lifecycle adapter so the daemon starts and drains the pipeline with the
/// rest of its components.
pub struct PipelineComponent {
    pipeline: Arc<Pipeline>,
}

impl PipelineComponent {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl LifecycleComponent for PipelineComponent {
    async fn on_init(&mut self) -> Result<()> {
        info!(
            "Alert pipeline initializing (data dir {})",
            self.pipeline.data_dir.display()
        );
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        self.pipeline.start().await
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.pipeline.shutdown().await;
        Ok(())
    }
}

/// Cron expression firing every `seconds`, rounded to what a six-field
/// expression can express.
pub(crate) fn every(seconds: u64) -> String {
    let seconds = seconds.max(1);
    if seconds < 60 {
        format!("0/{} * * * * *", seconds)
    } else {
        format!("0 0/{} * * * *", (seconds / 60).clamp(1, 59))
    }
}

/// Housekeeping jobs: client connection sweep and transport liveness probe.
pub async fn schedule_housekeeping(
    lifecycle: &LifecycleManager,
    pipeline: Arc<Pipeline>,
) -> Result<()> {
    let notifier = pipeline.notifier.clone();
    let sweep_cron = every(pipeline.config.notify.cleanup_interval_seconds);
    match tokio_cron_scheduler::Job::new_async(sweep_cron.as_str(), move |_uuid, mut _l| {
        let notifier = notifier.clone();
        Box::pin(async move {
            notifier.sweep_connections().await;
        })
    }) {
        Ok(job) => {
            lifecycle.scheduler.add(job).await?;
        }
        Err(e) => error!("Failed to create connection sweep job: {}", e),
    }

    let transport = pipeline.transport.clone();
    let probe_cron = every(pipeline.config.transport.probe_interval_seconds);
    match tokio_cron_scheduler::Job::new_async(probe_cron.as_str(), move |_uuid, mut _l| {
        let transport = transport.clone();
        Box::pin(async move {
            let report = transport.probe().await;
            if !report.healthy {
                warn!(
                    "Transport unhealthy: connected={}, consumers {}/{}",
                    report.connected, report.consumers_alive, report.consumers_expected
                );
            }
        })
    }) {
        Ok(job) => {
            lifecycle.scheduler.add(job).await?;
        }
        Err(e) => error!("Failed to create transport probe job: {}", e),
    }

    info!(
        "Housekeeping scheduled: sweep '{}', probe '{}'",
        sweep_cron, probe_cron
    );
    Ok(())
}
