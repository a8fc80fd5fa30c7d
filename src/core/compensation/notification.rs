use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use super::LaneOutcome;
use super::backoff::BackoffPolicy;
use crate::core::notify::NotificationManager;
use crate::core::store::AlertStore;

/// Expire overdue acks, then resend what is still within budget.
pub(super) async fn run(
    store: &AlertStore,
    notifier: &Arc<NotificationManager>,
    policy: BackoffPolicy,
    batch_size: usize,
    created_after_ms: i64,
    now: DateTime<Utc>,
) -> Result<LaneOutcome> {
    let expired = store
        .expire_overdue_notifications(now.timestamp_millis())
        .await?;
    if expired > 0 {
        info!("Expired {} notification(s) past their ack deadline", expired);
    }

    let mut outcome = LaneOutcome::default();
    let candidates = store
        .list_resend_candidates(created_after_ms, batch_size)
        .await?;
    let mut waiting = 0u64;

    for record in candidates {
        if !policy.is_due(record.retries, record.updated_at, now) {
            waiting += 1;
            continue;
        }
        if !store.claim_notification_for_resend(&record.record_id).await? {
            continue;
        }
        outcome.processed += 1;
        match notifier.resend(&record).await {
            Ok(()) => {
                outcome.success += 1;
                info!(
                    "Resent notification {} to {} (retry {})",
                    record.notification_id,
                    record.client_id,
                    record.retries + 1
                );
            }
            Err(e) => {
                outcome.failed += 1;
                debug!("Resend of {} failed: {}", record.record_id, e);
            }
        }
    }

    outcome.details = serde_json::json!({
        "expired": expired,
        "resent": outcome.success,
        "failed": outcome.failed,
        "waiting_backoff": waiting,
    });
    Ok(outcome)
}
