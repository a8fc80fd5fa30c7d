use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::LaneOutcome;
use crate::core::config::DeadLetterPolicy;
use crate::core::store::{AlertStore, NewDeadLetterArchive};
use crate::core::transport::Transport;
use crate::core::transport::message::{DeadLetterItem, ReprocessAction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    Requeue,
    Discard(String),
}

/// Decide whether a dead letter gets another trip through the main queue.
pub(crate) fn evaluate(item: &DeadLetterItem, policy: &DeadLetterPolicy, now: DateTime<Utc>) -> Verdict {
    let Some(alert) = item.payload.as_ref() else {
        return Verdict::Discard(format!(
            "unparseable payload: {}",
            item.parse_error.as_deref().unwrap_or("unknown error")
        ));
    };

    let mut death_limit = policy.max_death_count;
    if alert.alert_level <= policy.high_severity_level {
        death_limit += policy.high_severity_allowance;
    }
    if item.death_count >= death_limit {
        return Verdict::Discard(format!(
            "death count {} reached limit {}",
            item.death_count, death_limit
        ));
    }
    if item.retry_count >= policy.max_retry_count {
        return Verdict::Discard(format!(
            "retry count {} reached limit {}",
            item.retry_count, policy.max_retry_count
        ));
    }
    if let Some(first) = item.first_attempt_time {
        let age = (now - first).num_seconds();
        if age > policy.reprocess_time_limit_seconds as i64 {
            return Verdict::Discard(format!(
                "first attempt {}s ago exceeds {}s",
                age, policy.reprocess_time_limit_seconds
            ));
        }
    }
    Verdict::Requeue
}

pub(super) async fn run(
    store: &AlertStore,
    transport: &Transport,
    policy: &DeadLetterPolicy,
    batch_size: usize,
    now: DateTime<Utc>,
) -> Result<LaneOutcome> {
    if !transport.is_connected() {
        return Ok(LaneOutcome::skipped("transport disconnected"));
    }

    let items = transport.peek_dead_lettered(batch_size).await?;
    let mut outcome = LaneOutcome::default();
    let (mut requeued, mut discarded) = (0u64, 0u64);

    let mut pending = items.into_iter();
    while let Some(item) = pending.next() {
        outcome.processed += 1;
        match evaluate(&item, policy, now) {
            Verdict::Requeue => {
                let alert_id = item.alert_id().unwrap_or_default().to_string();
                let death_count = item.death_count;
                match transport.reprocess(item, ReprocessAction::Requeue).await {
                    Ok(()) => {
                        requeued += 1;
                        outcome.success += 1;
                        info!(
                            "Requeued dead-lettered alert {} (deaths {})",
                            alert_id, death_count
                        );
                    }
                    Err(e) => {
                        outcome.failed += 1;
                        outcome.error = Some(e.to_string());
                        warn!("Requeue of dead-lettered alert {} failed: {}", alert_id, e);
                    }
                }
            }
            Verdict::Discard(reason) => {
                let payload = String::from_utf8_lossy(&item.raw).to_string();
                let archived = store
                    .archive_dead_letter(&NewDeadLetterArchive {
                        message_id: item.message_id(),
                        alert_id: item.alert_id(),
                        reason: &reason,
                        dead_reason: item.dead_reason.as_str(),
                        death_count: item.death_count,
                        retry_count: item.retry_count,
                        first_death_ms: item.first_death_time.map(|t| t.timestamp_millis()),
                        payload: &payload,
                    })
                    .await;
                if let Err(e) = archived {
                    // keep the message in the queue until it can be archived
                    outcome.failed += 1;
                    outcome.error = Some(e.to_string());
                    warn!("Dead letter archive failed, releasing message: {}", e);
                    if let Err(e) = transport.release(item).await {
                        warn!("Release of dead letter failed: {}", e);
                    }
                    for rest in pending.by_ref() {
                        if let Err(e) = transport.release(rest).await {
                            warn!("Release of dead letter failed: {}", e);
                        }
                    }
                    break;
                }

                let alert_id = item.alert_id().unwrap_or("<unparseable>").to_string();
                match transport.reprocess(item, ReprocessAction::Discard).await {
                    Ok(()) => {
                        discarded += 1;
                        outcome.failed += 1;
                        warn!("Alert {} permanently failed: {}", alert_id, reason);
                    }
                    Err(e) => {
                        outcome.failed += 1;
                        outcome.error = Some(e.to_string());
                        warn!("Discard of dead letter {} failed: {}", alert_id, e);
                    }
                }
            }
        }
    }

    outcome.details = serde_json::json!({
        "requeued": requeued,
        "discarded": discarded,
    });
    Ok(outcome)
}
