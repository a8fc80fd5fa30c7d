use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::NotificationManager;
use crate::core::error::PipelineError;
use crate::core::store::AlertStore;
use crate::core::transport::AlertHandler;
use crate::core::transport::message::AlertPayload;

/// Consumer-side business handler: archive the alert, then push it to the
/// connected clients.
///
/// Redeliveries are absorbed by the archive insert. A redelivered alert is
/// pushed again only if no notification was recorded for it yet.
pub struct AlertArchiveHandler {
    store: AlertStore,
    notifier: Arc<NotificationManager>,
}

impl AlertArchiveHandler {
    pub fn new(store: AlertStore, notifier: Arc<NotificationManager>) -> Self {
        Self { store, notifier }
    }
}

#[async_trait]
impl AlertHandler for AlertArchiveHandler {
    fn name(&self) -> &str {
        "alert-archive"
    }

    async fn handle(&self, alert: &AlertPayload) -> Result<(), PipelineError> {
        let inserted = self
            .store
            .save_alert(alert)
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        if !inserted {
            let recorded = self
                .store
                .count_notifications_for_alert(&alert.alert_id)
                .await
                .map_err(|e| PipelineError::Storage(e.to_string()))?;
            if recorded > 0 {
                debug!("Alert {} already archived and notified", alert.alert_id);
                return Ok(());
            }
        }

        self.notifier.broadcast(alert).await;
        Ok(())
    }
}
