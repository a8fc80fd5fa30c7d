use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};
use std::collections::HashMap;

use super::types::{AckOutcome, NewNotification, NotificationRecord};
use super::{AlertStore, ms_to_dt, now_ms, status_list};
use crate::core::state::NotificationStatus;

const NOTIFICATION_COLUMNS: &str = "record_id, notification_id, alert_id, message_id, client_id, channel, status, ack_required, ack_received, ack_timeout_seconds, retries, max_retries, content, error_message, created_at, updated_at, sent_at, ack_at";

fn row_to_notification(row: &Row<'_>) -> rusqlite::Result<NotificationRecord> {
    let status: String = row.get(6)?;
    Ok(NotificationRecord {
        record_id: row.get(0)?,
        notification_id: row.get(1)?,
        alert_id: row.get(2)?,
        message_id: row.get(3)?,
        client_id: row.get(4)?,
        channel: row.get(5)?,
        status: NotificationStatus::from_status(&status).unwrap_or(NotificationStatus::Failed),
        ack_required: row.get::<_, i64>(7)? != 0,
        ack_received: row.get::<_, i64>(8)? != 0,
        ack_timeout_seconds: row.get::<_, i64>(9)?.max(0) as u64,
        retries: row.get(10)?,
        max_retries: row.get(11)?,
        content: row.get(12)?,
        error_message: row.get(13)?,
        created_at: ms_to_dt(row.get(14)?),
        updated_at: ms_to_dt(row.get(15)?),
        sent_at: row.get::<_, Option<i64>>(16)?.map(ms_to_dt),
        ack_at: row.get::<_, Option<i64>>(17)?.map(ms_to_dt),
    })
}

fn strs(values: &[NotificationStatus]) -> Vec<&'static str> {
    values.iter().map(|s| s.as_str()).collect()
}

impl AlertStore {
    /// Open a notification row in SENDING for one client.
    pub async fn create_notification(&self, new: &NewNotification<'_>) -> Result<NotificationRecord> {
        let record_id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO alert_notification_log
             (record_id, notification_id, alert_id, message_id, client_id, channel, status, ack_required,
              ack_timeout_seconds, retries, max_retries, content, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'sse', ?6, ?7, ?8, 0, ?9, ?10, ?11, ?11)",
            params![
                record_id,
                new.notification_id,
                new.alert_id,
                new.message_id,
                new.client_id,
                NotificationStatus::Sending.as_str(),
                new.ack_required as i64,
                new.ack_timeout_seconds as i64,
                new.max_retries,
                new.content,
                now
            ],
        )?;
        let rec = db.query_row(
            &format!("SELECT {NOTIFICATION_COLUMNS} FROM alert_notification_log WHERE record_id = ?1"),
            params![record_id],
            row_to_notification,
        )?;
        Ok(rec)
    }

    pub async fn get_notification_record(&self, record_id: &str) -> Result<Option<NotificationRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM alert_notification_log WHERE record_id = ?1"
                ),
                params![record_id],
                row_to_notification,
            )
            .optional()?;
        Ok(rec)
    }

    pub async fn get_notification_for_client(
        &self,
        notification_id: &str,
        client_id: &str,
    ) -> Result<Option<NotificationRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM alert_notification_log
                     WHERE notification_id = ?1 AND client_id = ?2"
                ),
                params![notification_id, client_id],
                row_to_notification,
            )
            .optional()?;
        Ok(rec)
    }

    pub async fn mark_notification_delivered(&self, record_id: &str) -> Result<bool> {
        let now = now_ms();
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE alert_notification_log SET status = ?1, sent_at = ?2, updated_at = ?2, error_message = NULL
             WHERE record_id = ?3 AND status = ?4",
            params![
                NotificationStatus::Delivered.as_str(),
                now,
                record_id,
                NotificationStatus::Sending.as_str()
            ],
        )?;
        Ok(rows > 0)
    }

    pub async fn mark_notification_failed(&self, record_id: &str, error: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE alert_notification_log
                 SET status = ?1, retries = MIN(retries + 1, max_retries), error_message = ?2, updated_at = ?3
                 WHERE record_id = ?4 AND status IN {}",
                status_list(&strs(&[NotificationStatus::Pending, NotificationStatus::Sending]))
            ),
            params![NotificationStatus::Failed.as_str(), error, now_ms(), record_id],
        )?;
        Ok(rows > 0)
    }

    /// Idempotent acknowledgement. Only SENDING/DELIVERED rows move.
    pub async fn acknowledge_notification(
        &self,
        notification_id: &str,
        client_id: &str,
    ) -> Result<AckOutcome> {
        let now = now_ms();
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE alert_notification_log
                 SET status = ?1, ack_received = 1, ack_at = ?2, updated_at = ?2
                 WHERE notification_id = ?3 AND client_id = ?4 AND status IN {}",
                status_list(&strs(NotificationStatus::awaiting_ack()))
            ),
            params![
                NotificationStatus::AckReceived.as_str(),
                now,
                notification_id,
                client_id
            ],
        )?;
        if rows > 0 {
            return Ok(AckOutcome::Acknowledged);
        }
        let status: Option<String> = db
            .query_row(
                "SELECT status FROM alert_notification_log WHERE notification_id = ?1 AND client_id = ?2",
                params![notification_id, client_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match status.as_deref().and_then(NotificationStatus::from_status) {
            None => AckOutcome::NotFound,
            Some(NotificationStatus::AckReceived) => AckOutcome::AlreadyAcknowledged,
            Some(_) => AckOutcome::Late,
        })
    }

    /// Ack deadline passed for one record. Counts as a failed delivery.
    pub async fn expire_notification(&self, record_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE alert_notification_log
                 SET status = ?1, retries = MIN(retries + 1, max_retries), error_message = 'ack timeout', updated_at = ?2
                 WHERE record_id = ?3 AND ack_required = 1 AND status IN {}",
                status_list(&strs(NotificationStatus::awaiting_ack()))
            ),
            params![NotificationStatus::Expired.as_str(), now_ms(), record_id],
        )?;
        Ok(rows > 0)
    }

    /// Expire every awaiting-ack row whose deadline is before `now_ms`.
    pub async fn expire_overdue_notifications(&self, now: i64) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE alert_notification_log
                 SET status = ?1, retries = MIN(retries + 1, max_retries), error_message = 'ack timeout', updated_at = ?2
                 WHERE ack_required = 1 AND status IN {}
                   AND COALESCE(sent_at, updated_at) + ack_timeout_seconds * 1000 < ?2",
                status_list(&strs(NotificationStatus::awaiting_ack()))
            ),
            params![NotificationStatus::Expired.as_str(), now],
        )?;
        Ok(rows)
    }

    pub async fn claim_notification_for_resend(&self, record_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE alert_notification_log SET status = ?1, updated_at = ?2
                 WHERE record_id = ?3 AND retries < max_retries AND status IN {}",
                status_list(&strs(NotificationStatus::resendable()))
            ),
            params![NotificationStatus::Sending.as_str(), now_ms(), record_id],
        )?;
        Ok(rows > 0)
    }

    pub async fn list_resend_candidates(
        &self,
        created_after_ms: i64,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM alert_notification_log
             WHERE status IN {} AND retries < max_retries AND created_at >= ?1
             ORDER BY created_at ASC LIMIT ?2",
            status_list(&strs(NotificationStatus::resendable()))
        ))?;
        let rows = stmt.query_map(params![created_after_ms, limit as i64], row_to_notification)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn release_stale_notification_claims(&self, older_than_ms: i64) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE alert_notification_log SET status = ?1, updated_at = ?2
             WHERE status = ?3 AND sent_at IS NULL AND updated_at < ?4",
            params![
                NotificationStatus::Pending.as_str(),
                now_ms(),
                NotificationStatus::Sending.as_str(),
                older_than_ms
            ],
        )?;
        Ok(rows)
    }

    pub async fn count_notifications_for_alert(&self, alert_id: &str) -> Result<u64> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM alert_notification_log WHERE alert_id = ?1",
            params![alert_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub async fn count_notifications_by_status(&self) -> Result<HashMap<String, u64>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT status, COUNT(*) FROM alert_notification_log GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut out: HashMap<String, u64> = NotificationStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for row in rows {
            let (status, count) = row?;
            out.insert(status, count.max(0) as u64);
        }
        Ok(out)
    }

    pub async fn list_terminal_notification_failures(
        &self,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM alert_notification_log
             WHERE status IN {} AND retries >= max_retries
             ORDER BY updated_at DESC LIMIT ?1",
            status_list(&strs(&[NotificationStatus::Failed, NotificationStatus::Expired]))
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_notification)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) async fn backdate_notification(
        &self,
        record_id: &str,
        updated_at_ms: i64,
        sent_at_ms: Option<i64>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE alert_notification_log SET updated_at = ?1, sent_at = ?2 WHERE record_id = ?3",
            params![updated_at_ms, sent_at_ms, record_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::state::NotificationStatus;
    use crate::core::store::test_store;
    use crate::core::store::types::{AckOutcome, NewNotification};

    fn new_notification<'a>(notification_id: &'a str, client_id: &'a str) -> NewNotification<'a> {
        NewNotification {
            notification_id,
            alert_id: "alert-1",
            message_id: "msg-1",
            client_id,
            ack_required: true,
            ack_timeout_seconds: 30,
            max_retries: 2,
            content: "{}",
        }
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let store = test_store();
        let rec = store
            .create_notification(&new_notification("n-1", "c-1"))
            .await
            .unwrap();
        assert_eq!(rec.status, NotificationStatus::Sending);
        assert!(store.mark_notification_delivered(&rec.record_id).await.unwrap());

        assert_eq!(
            store.acknowledge_notification("n-1", "c-1").await.unwrap(),
            AckOutcome::Acknowledged
        );
        assert_eq!(
            store.acknowledge_notification("n-1", "c-1").await.unwrap(),
            AckOutcome::AlreadyAcknowledged
        );
        assert_eq!(
            store.acknowledge_notification("n-1", "other").await.unwrap(),
            AckOutcome::NotFound
        );
        // an ack'd record cannot expire
        assert!(!store.expire_notification(&rec.record_id).await.unwrap());
    }

    #[tokio::test]
    async fn expiry_happens_once_and_late_ack_is_noop() {
        let store = test_store();
        let rec = store
            .create_notification(&new_notification("n-2", "c-1"))
            .await
            .unwrap();
        store.mark_notification_delivered(&rec.record_id).await.unwrap();

        assert!(store.expire_notification(&rec.record_id).await.unwrap());
        assert!(!store.expire_notification(&rec.record_id).await.unwrap());
        assert_eq!(
            store.acknowledge_notification("n-2", "c-1").await.unwrap(),
            AckOutcome::Late
        );
        let rec = store.get_notification_record(&rec.record_id).await.unwrap().unwrap();
        assert_eq!(rec.status, NotificationStatus::Expired);
        assert_eq!(rec.retries, 1);
    }

    #[tokio::test]
    async fn overdue_sweep_uses_sent_at_deadline() {
        let store = test_store();
        let rec = store
            .create_notification(&new_notification("n-3", "c-1"))
            .await
            .unwrap();
        store.mark_notification_delivered(&rec.record_id).await.unwrap();
        store
            .backdate_notification(&rec.record_id, 1_000, Some(1_000))
            .await
            .unwrap();

        assert_eq!(store.expire_overdue_notifications(20_000).await.unwrap(), 0);
        assert_eq!(store.expire_overdue_notifications(40_000).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn resend_budget_is_enforced() {
        let store = test_store();
        let rec = store
            .create_notification(&new_notification("n-4", "c-1"))
            .await
            .unwrap();
        store.mark_notification_failed(&rec.record_id, "slow").await.unwrap();
        assert_eq!(store.list_resend_candidates(0, 10).await.unwrap().len(), 1);

        assert!(store.claim_notification_for_resend(&rec.record_id).await.unwrap());
        assert!(!store.claim_notification_for_resend(&rec.record_id).await.unwrap());
        store.mark_notification_failed(&rec.record_id, "slow").await.unwrap();

        // retries == max_retries: terminal
        assert!(store.list_resend_candidates(0, 10).await.unwrap().is_empty());
        assert!(!store.claim_notification_for_resend(&rec.record_id).await.unwrap());
        let terminal = store.list_terminal_notification_failures(10).await.unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].error_message.as_deref(), Some("slow"));
    }
}
