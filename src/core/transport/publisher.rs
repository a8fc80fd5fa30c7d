use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::Transport;
use super::message::AlertPayload;
use crate::core::error::PipelineError;
use crate::core::merge::AlertSink;
use crate::core::store::AlertStore;

/// Hand-off target for the merge engine: persist a publish record, then
/// try the broker once (with its own short retry loop). A broker failure
/// leaves the record FAILED with one retry spent for the producer lane and
/// is not surfaced to the merge engine; only a store failure is.
pub struct AlertPublisher {
    store: AlertStore,
    transport: Arc<Transport>,
    max_retries: u32,
}

impl AlertPublisher {
    pub fn new(store: AlertStore, transport: Arc<Transport>, max_retries: u32) -> Self {
        Self {
            store,
            transport,
            max_retries,
        }
    }
}

#[async_trait]
impl AlertSink for AlertPublisher {
    async fn hand_off(&self, alert: AlertPayload) -> Result<(), PipelineError> {
        let payload = serde_json::to_string(&alert)?;
        let record = match self
            .store
            .get_publish_record_by_message(&alert.message_id)
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?
        {
            // a retried hand-off after a partial failure reuses the row
            Some(existing) => existing,
            None => self
                .store
                .create_publish_record(&alert.message_id, &alert.alert_id, &payload, self.max_retries)
                .await
                .map_err(|e| PipelineError::Storage(e.to_string()))?,
        };

        match self.transport.publish(&alert).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_publish_enqueued(record.id).await {
                    error!("Alert {} published but record {} not updated: {}", alert.alert_id, record.id, e);
                }
                info!(
                    "Published alert {} (level {}, {} detection(s))",
                    alert.alert_id, alert.alert_level, alert.count
                );
            }
            Err(e) => {
                warn!(
                    "Publish of alert {} failed, leaving it to compensation: {}",
                    alert.alert_id, e
                );
                if let Err(e) = self
                    .store
                    .mark_publish_initial_failure(record.id, &e.to_string())
                    .await
                {
                    error!("Failed to record publish failure for {}: {}", record.id, e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::PublishStatus;
    use crate::core::store::test_store;
    use crate::core::transport::message::tests::sample_alert;
    use crate::core::transport::testing::{FlakyBroker, test_transport_config};

    #[tokio::test]
    async fn successful_publish_marks_record_enqueued() {
        let store = test_store();
        let transport = Arc::new(Transport::new(
            Arc::new(FlakyBroker::new()),
            test_transport_config(),
        ));
        transport.declare_topology().await.unwrap();
        let publisher = AlertPublisher::new(store.clone(), transport.clone(), 3);

        let alert = sample_alert("a-1", 2);
        publisher.hand_off(alert.clone()).await.unwrap();
        let rec = store
            .get_publish_record_by_message(&alert.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, PublishStatus::Enqueued);
        assert_eq!(transport.queue_depths().await.unwrap().0, 1);
    }

    #[tokio::test]
    async fn broker_outage_leaves_failed_record_for_producer_lane() {
        let store = test_store();
        let broker = Arc::new(FlakyBroker::new());
        let transport = Arc::new(Transport::new(broker.clone(), test_transport_config()));
        transport.declare_topology().await.unwrap();
        broker.set_down(true);
        let publisher = AlertPublisher::new(store.clone(), transport, 3);

        let alert = sample_alert("a-2", 2);
        publisher.hand_off(alert.clone()).await.unwrap();
        let rec = store
            .get_publish_record_by_message(&alert.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, PublishStatus::Failed);
        assert_eq!(rec.retries, 1);
        assert!(rec.error_message.is_some());
        assert_eq!(store.list_publish_candidates(0, 10).await.unwrap().len(), 1);
    }
}
