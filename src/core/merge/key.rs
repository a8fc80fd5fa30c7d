use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One detection reported by an AI task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
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
    pub description: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// First 16 hex chars of SHA-256 over the stable identity fields.
/// Names and descriptions are left out so rewording does not split groups.
pub fn merge_key(event: &DetectionEvent) -> String {
    let identity = format!(
        "{}|{}|{}|{}|{}",
        event.task_id, event.camera_id, event.skill_id, event.alert_type, event.alert_level
    );
    let digest = Sha256::digest(identity.as_bytes());
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
pub(crate) fn sample_event(level: u8) -> DetectionEvent {
    DetectionEvent {
        task_id: 7,
        camera_id: 11,
        skill_id: "helmet".to_string(),
        alert_type: "no_helmet".to_string(),
        alert_level: level,
        alert_name: "No helmet".to_string(),
        camera_name: "Gate 1".to_string(),
        description: "Gate 1 worker without helmet".to_string(),
        location: None,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_free_text() {
        let a = sample_event(2);
        let mut b = sample_event(2);
        b.description = "something else entirely".to_string();
        b.camera_name = "Renamed".to_string();
        assert_eq!(merge_key(&a), merge_key(&b));
        assert_eq!(merge_key(&a).len(), 16);
    }

    #[test]
    fn key_separates_identity_fields() {
        let a = sample_event(2);
        let b = sample_event(3);
        let mut c = sample_event(2);
        c.camera_id = 12;
        assert_ne!(merge_key(&a), merge_key(&b));
        assert_ne!(merge_key(&a), merge_key(&c));
    }
}
