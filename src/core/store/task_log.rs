use anyhow::Result;
use rusqlite::params;

use super::types::{CompensationTaskLog, DeadLetterArchiveRecord};
use super::{AlertStore, ms_to_dt, now_ms};
use crate::core::state::CompensationTaskType;

/// Entry for the permanent-failure archive.
#[derive(Debug, Clone)]
pub struct NewDeadLetterArchive<'a> {
    pub message_id: Option<&'a str>,
    pub alert_id: Option<&'a str>,
    pub reason: &'a str,
    pub dead_reason: &'a str,
    pub death_count: u32,
    pub retry_count: u32,
    pub first_death_ms: Option<i64>,
    pub payload: &'a str,
}

impl AlertStore {
    pub async fn insert_task_log(&self, log: &CompensationTaskLog) -> Result<()> {
        let details = match &log.details {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO compensation_task_log
             (task_id, task_type, result, processed_count, success_count, failed_count,
              started_at, completed_at, duration_ms, error_message, executor_host, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                log.task_id,
                log.task_type.as_str(),
                log.result,
                log.processed_count as i64,
                log.success_count as i64,
                log.failed_count as i64,
                log.started_at.timestamp_millis(),
                log.completed_at.timestamp_millis(),
                log.duration_ms as i64,
                log.error_message,
                log.executor_host,
                details
            ],
        )?;
        Ok(())
    }

    pub async fn recent_task_logs(
        &self,
        task_type: Option<CompensationTaskType>,
        limit: usize,
    ) -> Result<Vec<CompensationTaskLog>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT task_id, task_type, result, processed_count, success_count, failed_count,
                    started_at, completed_at, duration_ms, error_message, executor_host, details
             FROM compensation_task_log
             WHERE (?1 IS NULL OR task_type = ?1)
             ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![task_type.map(|t| t.as_str()), limit as i64],
            |row| {
                let task_type: String = row.get(1)?;
                let details: Option<String> = row.get(11)?;
                Ok(CompensationTaskLog {
                    task_id: row.get(0)?,
                    task_type: CompensationTaskType::from_status(&task_type)
                        .unwrap_or(CompensationTaskType::Monitoring),
                    result: row.get(2)?,
                    processed_count: row.get::<_, i64>(3)?.max(0) as u64,
                    success_count: row.get::<_, i64>(4)?.max(0) as u64,
                    failed_count: row.get::<_, i64>(5)?.max(0) as u64,
                    started_at: ms_to_dt(row.get(6)?),
                    completed_at: ms_to_dt(row.get(7)?),
                    duration_ms: row.get::<_, i64>(8)?.max(0) as u64,
                    error_message: row.get(9)?,
                    executor_host: row.get(10)?,
                    details: details.and_then(|d| serde_json::from_str(&d).ok()),
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn archive_dead_letter(&self, entry: &NewDeadLetterArchive<'_>) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO dead_letter_archive
             (message_id, alert_id, reason, dead_reason, death_count, retry_count, first_death_at, payload, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.message_id,
                entry.alert_id,
                entry.reason,
                entry.dead_reason,
                entry.death_count,
                entry.retry_count,
                entry.first_death_ms,
                entry.payload,
                now_ms()
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn list_dead_letter_archive(&self, limit: usize) -> Result<Vec<DeadLetterArchiveRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, message_id, alert_id, reason, dead_reason, death_count, retry_count,
                    first_death_at, payload, archived_at
             FROM dead_letter_archive ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(DeadLetterArchiveRecord {
                id: row.get(0)?,
                message_id: row.get(1)?,
                alert_id: row.get(2)?,
                reason: row.get(3)?,
                dead_reason: row.get(4)?,
                death_count: row.get(5)?,
                retry_count: row.get(6)?,
                first_death_at: row.get::<_, Option<i64>>(7)?.map(ms_to_dt),
                payload: row.get(8)?,
                archived_at: ms_to_dt(row.get(9)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn count_dead_letter_archive(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let count: i64 =
            db.query_row("SELECT COUNT(*) FROM dead_letter_archive", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}
