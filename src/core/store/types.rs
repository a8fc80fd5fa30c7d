use chrono::{DateTime, Utc};

use crate::core::state::{CompensationTaskType, NotificationStatus, PublishStatus};

#[derive(Debug, Clone, serde::Serialize)]
pub struct PublishRecord {
    pub id: i64,
    pub message_id: String,
    pub alert_id: String,
    pub payload: String,
    pub status: PublishStatus,
    pub retries: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NotificationRecord {
    pub record_id: String,
    pub notification_id: String,
    pub alert_id: String,
    pub message_id: String,
    pub client_id: String,
    pub channel: String,
    pub status: NotificationStatus,
    pub ack_required: bool,
    pub ack_received: bool,
    pub ack_timeout_seconds: u64,
    pub retries: u32,
    pub max_retries: u32,
    pub content: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub ack_at: Option<DateTime<Utc>>,
}

/// Fields needed to open a notification row for one client.
#[derive(Debug, Clone)]
pub struct NewNotification<'a> {
    pub notification_id: &'a str,
    pub alert_id: &'a str,
    pub message_id: &'a str,
    pub client_id: &'a str,
    pub ack_required: bool,
    pub ack_timeout_seconds: u64,
    pub max_retries: u32,
    pub content: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Acknowledged,
    AlreadyAcknowledged,
    /// Record exists but is no longer awaiting an ack (expired or failed).
    Late,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    Success,
    Partial,
    Failed,
    Skipped,
}

impl TaskResult {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskResult::Success => "success",
            TaskResult::Partial => "partial",
            TaskResult::Failed => "failed",
            TaskResult::Skipped => "skipped",
        }
    }

    pub fn from_counts(success: u64, failed: u64) -> Self {
        match (success, failed) {
            (_, 0) => TaskResult::Success,
            (0, _) => TaskResult::Failed,
            _ => TaskResult::Partial,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CompensationTaskLog {
    pub task_id: String,
    pub task_type: CompensationTaskType,
    pub result: String,
    pub processed_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub executor_host: String,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AlertRecord {
    pub alert_id: String,
    pub message_id: String,
    pub task_id: i64,
    pub camera_id: i64,
    pub skill_id: String,
    pub alert_type: String,
    pub alert_level: u8,
    pub alert_name: String,
    pub description: String,
    pub alert_count: u32,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeadLetterArchiveRecord {
    pub id: i64,
    pub message_id: Option<String>,
    pub alert_id: Option<String>,
    pub reason: String,
    pub dead_reason: String,
    pub death_count: u32,
    pub retry_count: u32,
    pub first_death_at: Option<DateTime<Utc>>,
    pub payload: String,
    pub archived_at: DateTime<Utc>,
}
