use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::core::compensation::{CompensationHealth, CompensationStats};
use crate::core::merge::MergeStatus;
use crate::core::notify::NotifyStats;
use crate::core::store::types::{DeadLetterArchiveRecord, NotificationRecord, PublishRecord};
use crate::core::transport::TransportStats;

const RECENT_FAILURE_LIMIT: usize = 10;

/// Snapshot served by `GET /api/status` and printed by `alert-relay status`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub generated_at: DateTime<Utc>,
    pub publish: HashMap<String, u64>,
    pub notifications: HashMap<String, u64>,
    pub alerts_archived: u64,
    pub dead_letters_archived: u64,
    pub main_queue_depth: Option<u64>,
    pub dead_letter_depth: Option<u64>,
    pub connected_clients: usize,
    pub merge: MergeStatus,
    pub transport: TransportStats,
    pub notify: NotifyStats,
    pub compensation: CompensationStats,
    pub compensation_health: CompensationHealth,
    pub recent_failures: RecentFailures,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecentFailures {
    pub publish: Vec<FailureSummary>,
    pub notifications: Vec<FailureSummary>,
    pub dead_letters: Vec<FailureSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub id: String,
    pub alert_id: Option<String>,
    pub retries: u32,
    pub last_error: Option<String>,
    pub at: DateTime<Utc>,
}

impl From<&PublishRecord> for FailureSummary {
    fn from(r: &PublishRecord) -> Self {
        Self {
            id: r.message_id.clone(),
            alert_id: Some(r.alert_id.clone()),
            retries: r.retries,
            last_error: r.error_message.clone(),
            at: r.updated_at,
        }
    }
}

impl From<&NotificationRecord> for FailureSummary {
    fn from(r: &NotificationRecord) -> Self {
        Self {
            id: format!("{}/{}", r.notification_id, r.client_id),
            alert_id: Some(r.alert_id.clone()),
            retries: r.retries,
            last_error: r.error_message.clone(),
            at: r.updated_at,
        }
    }
}

impl From<&DeadLetterArchiveRecord> for FailureSummary {
    fn from(r: &DeadLetterArchiveRecord) -> Self {
        Self {
            id: r
                .message_id
                .clone()
                .unwrap_or_else(|| format!("archive-{}", r.id)),
            alert_id: r.alert_id.clone(),
            retries: r.retry_count,
            last_error: Some(r.reason.clone()),
            at: r.archived_at,
        }
    }
}

impl RecentFailures {
    pub fn limit() -> usize {
        RECENT_FAILURE_LIMIT
    }

    pub fn collect(
        publish: &[PublishRecord],
        notifications: &[NotificationRecord],
        dead_letters: &[DeadLetterArchiveRecord],
    ) -> Self {
        Self {
            publish: publish.iter().map(FailureSummary::from).collect(),
            notifications: notifications.iter().map(FailureSummary::from).collect(),
            dead_letters: dead_letters.iter().map(FailureSummary::from).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.publish.is_empty() && self.notifications.is_empty() && self.dead_letters.is_empty()
    }
}
