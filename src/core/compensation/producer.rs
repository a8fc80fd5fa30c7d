use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::LaneOutcome;
use super::backoff::BackoffPolicy;
use crate::core::store::AlertStore;
use crate::core::transport::Transport;

/// Republish records whose hand-off never reached the broker.
pub(super) async fn run(
    store: &AlertStore,
    transport: &Transport,
    policy: BackoffPolicy,
    batch_size: usize,
    created_after_ms: i64,
    now: DateTime<Utc>,
) -> Result<LaneOutcome> {
    let mut outcome = LaneOutcome::default();
    let candidates = store
        .list_publish_candidates(created_after_ms, batch_size)
        .await?;
    let mut waiting = 0u64;
    let mut terminal = 0u64;

    for record in candidates {
        if !policy.is_due(record.retries, record.updated_at, now) {
            waiting += 1;
            continue;
        }
        if !store.claim_publish_record(record.id).await? {
            debug!("Publish record {} claimed elsewhere", record.id);
            continue;
        }
        outcome.processed += 1;

        match transport
            .publish_once(
                record.payload.clone().into_bytes(),
                record.created_at.timestamp_millis(),
            )
            .await
        {
            Ok(()) => {
                store.mark_publish_enqueued(record.id).await?;
                outcome.success += 1;
                info!(
                    "Compensated publish of alert {} (record {}, retry {})",
                    record.alert_id,
                    record.id,
                    record.retries + 1
                );
            }
            Err(e) => {
                outcome.failed += 1;
                let retries = store.mark_publish_failed(record.id, &e.to_string()).await?;
                if retries.is_some_and(|r| r >= record.max_retries) {
                    terminal += 1;
                    warn!(
                        "Publish of alert {} permanently failed after {} retries: {}",
                        record.alert_id, record.max_retries, e
                    );
                } else {
                    debug!("Compensated publish of record {} failed: {}", record.id, e);
                }
            }
        }
    }

    outcome.details = serde_json::json!({
        "enqueued": outcome.success,
        "failed": outcome.failed,
        "waiting_backoff": waiting,
        "permanently_failed": terminal,
    });
    Ok(outcome)
}
