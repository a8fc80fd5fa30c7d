use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::broker::{DeadReason, Delivery};
use crate::core::error::PipelineError;

/// Outbound alert as it travels through the broker and out to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub alert_id: String,
    pub message_id: String,
    pub task_id: i64,
    pub camera_id: i64,
    pub skill_id: String,
    pub alert_type: String,
    pub alert_level: u8,
    #[serde(default)]
    pub alert_name: String,
    #[serde(default)]
    pub camera_name: String,
    #[serde(default)]
    pub location: Option<String>,
    pub description: String,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub count: u32,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    #[serde(default)]
    pub video_ref: Option<String>,
}

impl AlertPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self, PipelineError> {
        let alert: AlertPayload = serde_json::from_slice(body)?;
        if alert.alert_id.trim().is_empty() {
            return Err(PipelineError::PoisonMessage("alertId is empty".to_string()));
        }
        Ok(alert)
    }
}

/// A message sitting in the dead-letter queue, fetched but not yet acked.
/// Must be resolved with `Transport::reprocess` or released.
#[derive(Debug, Clone)]
pub struct DeadLetterItem {
    pub delivery_tag: u64,
    pub death_count: u32,
    pub dead_reason: DeadReason,
    pub first_death_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub first_attempt_time: Option<DateTime<Utc>>,
    pub payload: Option<AlertPayload>,
    pub parse_error: Option<String>,
    pub raw: Vec<u8>,
    pub(crate) delivery: Delivery,
}

impl DeadLetterItem {
    pub(crate) fn from_delivery(delivery: Delivery) -> Self {
        let (payload, parse_error) = match AlertPayload::from_bytes(&delivery.body) {
            Ok(p) => (Some(p), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let death = delivery.headers.death.clone();
        Self {
            delivery_tag: delivery.tag,
            death_count: death.as_ref().map(|d| d.count).unwrap_or(0),
            dead_reason: death.as_ref().map(|d| d.reason).unwrap_or(DeadReason::Rejected),
            first_death_time: death
                .as_ref()
                .map(|d| crate::core::store::ms_to_dt(d.first_death_ms)),
            retry_count: delivery.headers.retry_count,
            first_attempt_time: (delivery.headers.first_attempt_ms > 0)
                .then(|| crate::core::store::ms_to_dt(delivery.headers.first_attempt_ms)),
            payload,
            parse_error,
            raw: delivery.body.clone(),
            delivery,
        }
    }

    pub fn alert_level(&self) -> Option<u8> {
        self.payload.as_ref().map(|p| p.alert_level)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.payload.as_ref().map(|p| p.message_id.as_str())
    }

    pub fn alert_id(&self) -> Option<&str> {
        self.payload.as_ref().map(|p| p.alert_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprocessAction {
    Requeue,
    Discard,
}
