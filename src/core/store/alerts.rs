use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::types::AlertRecord;
use super::{AlertStore, ms_to_dt, now_ms};
use crate::core::transport::message::AlertPayload;

impl AlertStore {
    /// Persist an alert delivered by the broker. Redeliveries of the same
    /// `alert_id` are ignored; returns whether a row was inserted.
    pub async fn save_alert(&self, alert: &AlertPayload) -> Result<bool> {
        let payload = serde_json::to_string(alert)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "INSERT OR IGNORE INTO alerts
             (alert_id, message_id, task_id, camera_id, skill_id, alert_type, alert_level, alert_name,
              description, alert_count, first_timestamp, last_timestamp, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                alert.alert_id,
                alert.message_id,
                alert.task_id,
                alert.camera_id,
                alert.skill_id,
                alert.alert_type,
                alert.alert_level,
                alert.alert_name,
                alert.description,
                alert.count,
                alert.first_timestamp.timestamp_millis(),
                alert.last_timestamp.timestamp_millis(),
                payload,
                now_ms()
            ],
        )?;
        Ok(rows > 0)
    }

    pub async fn get_alert(&self, alert_id: &str) -> Result<Option<AlertRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                "SELECT alert_id, message_id, task_id, camera_id, skill_id, alert_type, alert_level, alert_name,
                        description, alert_count, first_timestamp, last_timestamp, created_at
                 FROM alerts WHERE alert_id = ?1",
                params![alert_id],
                |row| {
                    Ok(AlertRecord {
                        alert_id: row.get(0)?,
                        message_id: row.get(1)?,
                        task_id: row.get(2)?,
                        camera_id: row.get(3)?,
                        skill_id: row.get(4)?,
                        alert_type: row.get(5)?,
                        alert_level: row.get(6)?,
                        alert_name: row.get(7)?,
                        description: row.get(8)?,
                        alert_count: row.get(9)?,
                        first_timestamp: ms_to_dt(row.get(10)?),
                        last_timestamp: ms_to_dt(row.get(11)?),
                        created_at: ms_to_dt(row.get(12)?),
                    })
                },
            )
            .optional()?;
        Ok(rec)
    }

    pub async fn count_alerts(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use crate::core::store::test_store;
    use crate::core::transport::message::tests::sample_alert;

    #[tokio::test]
    async fn save_is_idempotent() {
        let store = test_store();
        let alert = sample_alert("alert-9", 3);
        assert!(store.save_alert(&alert).await.unwrap());
        assert!(!store.save_alert(&alert).await.unwrap());
        assert_eq!(store.count_alerts().await.unwrap(), 1);

        let rec = store.get_alert("alert-9").await.unwrap().unwrap();
        assert_eq!(rec.alert_level, 3);
        assert_eq!(rec.alert_count, alert.count);
        assert!(store.get_alert("missing").await.unwrap().is_none());
    }
}
