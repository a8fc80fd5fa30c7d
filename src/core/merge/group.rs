use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::key::DetectionEvent;
use crate::core::config::{MergeConfig, VideoConfig};
use crate::core::transport::message::AlertPayload;

/// One detection folded into a group, kept whole so the flushed alert can
/// draw on every instance and not just the first.
#[derive(Debug, Clone)]
pub struct Instance {
    pub timestamp: DateTime<Utc>,
    pub event: DetectionEvent,
    pub evidence_ref: Option<String>,
}

/// Open group of near-duplicate detections sharing one merge key.
pub struct MergeGroup {
    pub key: String,
    /// First event of the group; carries identity and naming.
    pub base: DetectionEvent,
    pub first_seen: Instant,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub instances: Vec<Instance>,
    pub is_sent: bool,
    pub generation: u64,
    pub timer: Option<JoinHandle<()>>,
}

impl MergeGroup {
    pub fn new(key: String, event: DetectionEvent, evidence_ref: Option<String>, now: Instant) -> Self {
        let ts = event.timestamp;
        Self {
            key,
            first_seen: now,
            first_timestamp: ts,
            last_timestamp: ts,
            instances: vec![Instance {
                timestamp: ts,
                event: event.clone(),
                evidence_ref,
            }],
            base: event,
            is_sent: false,
            generation: 0,
            timer: None,
        }
    }

    pub fn push(&mut self, event: &DetectionEvent, evidence_ref: Option<String>) {
        if event.timestamp < self.first_timestamp {
            self.first_timestamp = event.timestamp;
        }
        if event.timestamp > self.last_timestamp {
            self.last_timestamp = event.timestamp;
        }
        self.instances.push(Instance {
            timestamp: event.timestamp,
            event: event.clone(),
            evidence_ref,
        });
    }

    pub fn count(&self) -> u32 {
        self.instances.len() as u32
    }

    pub fn level(&self) -> u8 {
        self.base.alert_level
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.first_seen)
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.last_timestamp - self.first_timestamp)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Detach from the key map. Any timer still armed for this group
    /// becomes a no-op.
    pub fn close(&mut self) {
        self.is_sent = true;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Location of the most recent instance, else the last one reported.
    pub fn location(&self) -> Option<String> {
        self.instances
            .iter()
            .max_by_key(|i| i.timestamp)
            .and_then(|i| i.event.location.clone())
            .or_else(|| {
                self.instances
                    .iter()
                    .rev()
                    .find_map(|i| i.event.location.clone())
            })
    }

    pub fn merged_description(&self) -> String {
        if self.count() <= 1 {
            return self.base.description.clone();
        }
        let camera = &self.base.camera_name;
        let mut details: Vec<String> = Vec::new();
        for instance in &self.instances {
            let text = &instance.event.description;
            let detail = if camera.is_empty() {
                text.trim().to_string()
            } else {
                text.replace(camera.as_str(), "").trim().to_string()
            };
            if !detail.is_empty() && !details.contains(&detail) {
                details.push(detail);
            }
        }
        let detail = details.join("; ");
        let camera = if camera.is_empty() { "camera" } else { camera.as_str() };
        format!(
            "{} detected {} times within {:.0}s: {}",
            camera,
            self.count(),
            self.duration_seconds(),
            detail
        )
    }

    pub fn build_payload(&self) -> AlertPayload {
        AlertPayload {
            alert_id: uuid::Uuid::new_v4().to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            task_id: self.base.task_id,
            camera_id: self.base.camera_id,
            skill_id: self.base.skill_id.clone(),
            alert_type: self.base.alert_type.clone(),
            alert_level: self.base.alert_level,
            alert_name: self.base.alert_name.clone(),
            camera_name: self.base.camera_name.clone(),
            location: self.location(),
            description: self.merged_description(),
            first_timestamp: self.first_timestamp,
            last_timestamp: self.last_timestamp,
            duration_seconds: self.duration_seconds(),
            count: self.count(),
            evidence_refs: self
                .instances
                .iter()
                .filter_map(|i| i.evidence_ref.clone())
                .collect(),
            video_ref: None,
        }
    }
}

/// `minimal_delay` once the quick-send threshold is hit, otherwise
/// `min(base + level * factor, 3 * base)`.
pub fn flush_delay(config: &MergeConfig, level: u8, count: u32) -> Duration {
    if count >= config.quick_send_threshold {
        return config.minimal_delay();
    }
    let seconds = (config.base_delay_seconds + level as f64 * config.level_delay_factor)
        .min(config.base_delay_seconds * 3.0);
    Duration::from_secs_f64(seconds.max(0.0))
}

pub fn max_duration(merge: &MergeConfig, video: &VideoConfig, level: u8) -> Duration {
    if video.is_critical(level) {
        Duration::from_secs_f64(merge.critical_max_duration_seconds)
    } else {
        Duration::from_secs_f64(merge.max_duration_seconds)
    }
}
