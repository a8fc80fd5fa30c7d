use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row, params};
use std::collections::HashMap;

use super::types::PublishRecord;
use super::{AlertStore, ms_to_dt, now_ms, status_list};
use crate::core::state::PublishStatus;

const PUBLISH_COLUMNS: &str = "id, message_id, alert_id, payload, status, retries, max_retries, error_message, created_at, updated_at, sent_at";

fn row_to_publish(row: &Row<'_>) -> rusqlite::Result<PublishRecord> {
    let status: String = row.get(4)?;
    Ok(PublishRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        alert_id: row.get(2)?,
        payload: row.get(3)?,
        status: PublishStatus::from_status(&status).unwrap_or(PublishStatus::Failed),
        retries: row.get(5)?,
        max_retries: row.get(6)?,
        error_message: row.get(7)?,
        created_at: ms_to_dt(row.get(8)?),
        updated_at: ms_to_dt(row.get(9)?),
        sent_at: row.get::<_, Option<i64>>(10)?.map(ms_to_dt),
    })
}

impl AlertStore {
    pub async fn create_publish_record(
        &self,
        message_id: &str,
        alert_id: &str,
        payload: &str,
        max_retries: u32,
    ) -> Result<PublishRecord> {
        let now = now_ms();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO alert_publish_log (message_id, alert_id, payload, status, retries, max_retries, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6)",
            params![
                message_id,
                alert_id,
                payload,
                PublishStatus::Pending.as_str(),
                max_retries,
                now
            ],
        )?;
        let id = db.last_insert_rowid();
        let rec = db.query_row(
            &format!("SELECT {PUBLISH_COLUMNS} FROM alert_publish_log WHERE id = ?1"),
            params![id],
            row_to_publish,
        )?;
        Ok(rec)
    }

    pub async fn get_publish_record(&self, id: i64) -> Result<Option<PublishRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                &format!("SELECT {PUBLISH_COLUMNS} FROM alert_publish_log WHERE id = ?1"),
                params![id],
                row_to_publish,
            )
            .optional()?;
        Ok(rec)
    }

    pub async fn get_publish_record_by_message(
        &self,
        message_id: &str,
    ) -> Result<Option<PublishRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                &format!("SELECT {PUBLISH_COLUMNS} FROM alert_publish_log WHERE message_id = ?1"),
                params![message_id],
                row_to_publish,
            )
            .optional()?;
        Ok(rec)
    }

    /// Conditional claim for the producer lane. Returns false when another
    /// actor already moved the record or its retry budget is spent.
    pub async fn claim_publish_record(&self, id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE alert_publish_log SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status IN {} AND retries < max_retries",
                status_list(&claimable_strs())
            ),
            params![PublishStatus::Compensating.as_str(), now_ms(), id],
        )?;
        Ok(rows > 0)
    }

    pub async fn mark_publish_enqueued(&self, id: i64) -> Result<bool> {
        let now = now_ms();
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE alert_publish_log SET status = ?1, sent_at = ?2, updated_at = ?2, error_message = NULL
                 WHERE id = ?3 AND status IN {}",
                status_list(&[
                    PublishStatus::Pending.as_str(),
                    PublishStatus::Failed.as_str(),
                    PublishStatus::Compensating.as_str(),
                ])
            ),
            params![PublishStatus::Enqueued.as_str(), now, id],
        )?;
        Ok(rows > 0)
    }

    /// First publish at hand-off failed. Counts as one attempt against the
    /// retry budget; only a still PENDING row is touched so a lane claim wins.
    pub async fn mark_publish_initial_failure(&self, id: i64, error: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE alert_publish_log
             SET status = ?1, retries = MIN(retries + 1, max_retries), error_message = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                PublishStatus::Failed.as_str(),
                error,
                now_ms(),
                id,
                PublishStatus::Pending.as_str()
            ],
        )?;
        Ok(rows > 0)
    }

    /// Record one failed compensation attempt. `retries` never exceeds `max_retries`.
    pub async fn mark_publish_failed(&self, id: i64, error: &str) -> Result<Option<u32>> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE alert_publish_log
                 SET status = ?1, retries = MIN(retries + 1, max_retries), error_message = ?2, updated_at = ?3
                 WHERE id = ?4 AND status IN {}",
                status_list(&[
                    PublishStatus::Pending.as_str(),
                    PublishStatus::Failed.as_str(),
                    PublishStatus::Compensating.as_str(),
                ])
            ),
            params![PublishStatus::Failed.as_str(), error, now_ms(), id],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        let retries: u32 = db.query_row(
            "SELECT retries FROM alert_publish_log WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(Some(retries))
    }

    /// Records the producer lane may consider, oldest first. Backoff is
    /// applied by the caller since it depends on each row's retry count.
    pub async fn list_publish_candidates(
        &self,
        created_after_ms: i64,
        limit: usize,
    ) -> Result<Vec<PublishRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {PUBLISH_COLUMNS} FROM alert_publish_log
             WHERE status IN {} AND retries < max_retries AND created_at >= ?1
             ORDER BY created_at ASC LIMIT ?2",
            status_list(&claimable_strs())
        ))?;
        let rows = stmt.query_map(params![created_after_ms, limit as i64], row_to_publish)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Reset COMPENSATING claims abandoned by a crashed cycle.
    pub async fn release_stale_publish_claims(&self, older_than_ms: i64) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE alert_publish_log SET status = ?1, updated_at = ?2
             WHERE status = ?3 AND updated_at < ?4",
            params![
                PublishStatus::Pending.as_str(),
                now_ms(),
                PublishStatus::Compensating.as_str(),
                older_than_ms
            ],
        )?;
        Ok(rows)
    }

    pub async fn count_publish_by_status(&self) -> Result<HashMap<String, u64>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT status, COUNT(*) FROM alert_publish_log GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut out: HashMap<String, u64> = PublishStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for row in rows {
            let (status, count) = row?;
            out.insert(status, count.max(0) as u64);
        }
        Ok(out)
    }

    /// FAILED records whose retry budget is spent, newest first.
    pub async fn list_terminal_publish_failures(&self, limit: usize) -> Result<Vec<PublishRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {PUBLISH_COLUMNS} FROM alert_publish_log
             WHERE status = ?1 AND retries >= max_retries
             ORDER BY updated_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![PublishStatus::Failed.as_str(), limit as i64],
            row_to_publish,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| anyhow!(e))
    }

    #[cfg(test)]
    pub(crate) async fn backdate_publish_record(&self, id: i64, updated_at_ms: i64) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE alert_publish_log SET updated_at = ?1 WHERE id = ?2",
            params![updated_at_ms, id],
        )?;
        Ok(())
    }
}

fn claimable_strs() -> Vec<&'static str> {
    PublishStatus::claimable().iter().map(|s| s.as_str()).collect()
}
