use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use super::broker::{
    Broker, BrokerError, DeadReason, DeathInfo, Delivery, MessageHeaders, QueueSpec,
};
use crate::core::store::now_ms;

/// Bounds how many dead-letter hops a single overflow/expiry may chain.
const MAX_DEAD_LETTER_HOPS: u8 = 2;

/// Durable queue broker backed by its own SQLite file. Implements the
/// subset of AMQP semantics the pipeline relies on: per-queue TTL, max
/// length, dead-letter routing with death metadata, manual ack and
/// redelivery of unacked messages after a reconnect.
pub struct SqliteBroker {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
    queues: Mutex<HashMap<String, QueueSpec>>,
    next_tag: AtomicU64,
    connected: AtomicBool,
}

impl SqliteBroker {
    pub fn open(path: &Path) -> Result<Self, BrokerError> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        let broker = Self::with_connection(Some(path.to_path_buf()), conn);
        let released = broker.release_unacked()?;
        if released > 0 {
            info!("Broker recovered {} unacked message(s) from previous run", released);
        }
        Ok(broker)
    }

    pub fn open_in_memory() -> Result<Self, BrokerError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self::with_connection(None, conn))
    }

    fn with_connection(path: Option<PathBuf>, conn: Connection) -> Self {
        Self {
            path,
            conn: Mutex::new(conn),
            queues: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        }
    }

    /// Drop the connection. Every call fails until `reconnect`.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected("connection closed".to_string()));
        }
        self.conn
            .lock()
            .map_err(|_| BrokerError::Storage("broker connection lock poisoned".to_string()))
    }

    fn specs(&self) -> Result<HashMap<String, QueueSpec>, BrokerError> {
        self.queues
            .lock()
            .map(|q| q.clone())
            .map_err(|_| BrokerError::Storage("queue registry lock poisoned".to_string()))
    }

    fn release_unacked(&self) -> Result<usize, BrokerError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE broker_messages SET delivery_tag = NULL WHERE delivery_tag IS NOT NULL",
            [],
        )?;
        Ok(rows)
    }
}

fn init_schema(conn: &Connection) -> Result<(), BrokerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS broker_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            body BLOB NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            first_attempt_ms INTEGER NOT NULL DEFAULT 0,
            death_count INTEGER,
            death_reason TEXT,
            first_death_ms INTEGER,
            death_queue TEXT,
            enqueued_at INTEGER NOT NULL,
            expires_at INTEGER,
            delivery_tag INTEGER
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_broker_queue_id ON broker_messages(queue, id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_broker_delivery_tag ON broker_messages(delivery_tag)",
        [],
    )?;
    Ok(())
}

fn dead_letter(
    conn: &Connection,
    specs: &HashMap<String, QueueSpec>,
    id: i64,
    from_queue: &str,
    reason: DeadReason,
    now: i64,
    hops: u8,
) -> Result<(), BrokerError> {
    let target = specs
        .get(from_queue)
        .and_then(|s| s.dead_letter_queue.clone());
    match target {
        Some(dlq) => {
            let expires = specs
                .get(&dlq)
                .and_then(|s| s.message_ttl_ms)
                .map(|ttl| now + ttl as i64);
            conn.execute(
                "UPDATE broker_messages
                 SET queue = ?1, death_count = COALESCE(death_count, 0) + 1, death_reason = ?2,
                     first_death_ms = COALESCE(first_death_ms, ?3), death_queue = ?4,
                     delivery_tag = NULL, enqueued_at = ?3, expires_at = ?5
                 WHERE id = ?6",
                params![dlq, reason.as_str(), now, from_queue, expires, id],
            )?;
            enforce_max_length(conn, specs, &dlq, now, hops + 1)?;
        }
        None => {
            conn.execute("DELETE FROM broker_messages WHERE id = ?1", params![id])?;
            warn!(
                "Dropped message {} from {} ({}): no dead-letter route",
                id,
                from_queue,
                reason.as_str()
            );
        }
    }
    Ok(())
}

fn enforce_max_length(
    conn: &Connection,
    specs: &HashMap<String, QueueSpec>,
    queue: &str,
    now: i64,
    hops: u8,
) -> Result<(), BrokerError> {
    let Some(max) = specs.get(queue).and_then(|s| s.max_length) else {
        return Ok(());
    };
    let ready: i64 = conn.query_row(
        "SELECT COUNT(*) FROM broker_messages WHERE queue = ?1 AND delivery_tag IS NULL",
        params![queue],
        |row| row.get(0),
    )?;
    let overflow = ready - max as i64;
    if overflow <= 0 {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "SELECT id FROM broker_messages WHERE queue = ?1 AND delivery_tag IS NULL
         ORDER BY id ASC LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![queue, overflow], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    for id in ids {
        if hops >= MAX_DEAD_LETTER_HOPS {
            conn.execute("DELETE FROM broker_messages WHERE id = ?1", params![id])?;
        } else {
            dead_letter(conn, specs, id, queue, DeadReason::Maxlen, now, hops)?;
        }
    }
    Ok(())
}

fn expire_sweep(
    conn: &Connection,
    specs: &HashMap<String, QueueSpec>,
    queue: &str,
    now: i64,
) -> Result<(), BrokerError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM broker_messages
         WHERE queue = ?1 AND delivery_tag IS NULL AND expires_at IS NOT NULL AND expires_at <= ?2",
    )?;
    let ids = stmt
        .query_map(params![queue, now], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    for id in ids {
        dead_letter(conn, specs, id, queue, DeadReason::Expired, now, 0)?;
    }
    Ok(())
}

impl Broker for SqliteBroker {
    fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| BrokerError::Storage("queue registry lock poisoned".to_string()))?;
        queues.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    fn publish(&self, queue: &str, body: &[u8], headers: &MessageHeaders) -> Result<(), BrokerError> {
        let specs = self.specs()?;
        let spec = specs
            .get(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let now = now_ms();
        let expires = spec.message_ttl_ms.map(|ttl| now + ttl as i64);
        let death = headers.death.as_ref();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO broker_messages
             (queue, body, retry_count, first_attempt_ms, death_count, death_reason, first_death_ms,
              death_queue, enqueued_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                queue,
                body,
                headers.retry_count,
                headers.first_attempt_ms,
                death.map(|d| d.count),
                death.map(|d| d.reason.as_str()),
                death.map(|d| d.first_death_ms),
                death.map(|d| d.queue.as_str()),
                now,
                expires
            ],
        )?;
        enforce_max_length(&tx, &specs, queue, now, 0)?;
        tx.commit()?;
        Ok(())
    }

    fn basic_get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let specs = self.specs()?;
        if !specs.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let now = now_ms();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        expire_sweep(&tx, &specs, queue, now)?;

        let row = tx
            .query_row(
                "SELECT id, body, retry_count, first_attempt_ms, death_count, death_reason,
                        first_death_ms, death_queue
                 FROM broker_messages WHERE queue = ?1 AND delivery_tag IS NULL
                 ORDER BY id ASC LIMIT 1",
                params![queue],
                |row| {
                    let death_count: Option<u32> = row.get(4)?;
                    let death = match death_count {
                        Some(count) if count > 0 => Some(DeathInfo {
                            count,
                            reason: DeadReason::parse(
                                &row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                            ),
                            first_death_ms: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                            queue: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                        }),
                        _ => None,
                    };
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        MessageHeaders {
                            retry_count: row.get(2)?,
                            first_attempt_ms: row.get(3)?,
                            death,
                        },
                    ))
                },
            )
            .optional()?;

        let Some((id, body, headers)) = row else {
            tx.commit()?;
            return Ok(None);
        };
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        tx.execute(
            "UPDATE broker_messages SET delivery_tag = ?1 WHERE id = ?2",
            params![tag as i64, id],
        )?;
        tx.commit()?;
        Ok(Some(Delivery {
            tag,
            queue: queue.to_string(),
            body,
            headers,
        }))
    }

    fn ack(&self, tag: u64) -> Result<(), BrokerError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "DELETE FROM broker_messages WHERE delivery_tag = ?1",
            params![tag as i64],
        )?;
        if rows == 0 {
            return Err(BrokerError::UnknownDelivery(tag));
        }
        Ok(())
    }

    fn nack(&self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let specs = self.specs()?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let row: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, queue FROM broker_messages WHERE delivery_tag = ?1",
                params![tag as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((id, queue)) = row else {
            return Err(BrokerError::UnknownDelivery(tag));
        };
        if requeue {
            tx.execute(
                "UPDATE broker_messages SET delivery_tag = NULL WHERE id = ?1",
                params![id],
            )?;
        } else {
            dead_letter(&tx, &specs, id, &queue, DeadReason::Rejected, now_ms(), 0)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM broker_messages WHERE queue = ?1",
            params![queue],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reconnect(&self) -> Result<(), BrokerError> {
        {
            let mut conn = self
                .conn
                .lock()
                .map_err(|_| BrokerError::Storage("broker connection lock poisoned".to_string()))?;
            if let Some(path) = &self.path {
                let fresh = Connection::open(path)
                    .map_err(|e| BrokerError::Disconnected(e.to_string()))?;
                init_schema(&fresh)?;
                *conn = fresh;
            }
        }
        self.connected.store(true, Ordering::SeqCst);
        let released = self.release_unacked()?;
        info!("Broker reconnected ({} unacked message(s) returned)", released);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with_queues(ttl: Option<u64>, max_length: Option<u64>) -> SqliteBroker {
        let broker = SqliteBroker::open_in_memory().unwrap();
        broker
            .declare_queue(&QueueSpec {
                name: "dlq".into(),
                message_ttl_ms: None,
                max_length: Some(100),
                dead_letter_queue: None,
            })
            .unwrap();
        broker
            .declare_queue(&QueueSpec {
                name: "main".into(),
                message_ttl_ms: ttl,
                max_length,
                dead_letter_queue: Some("dlq".into()),
            })
            .unwrap();
        broker
    }

    fn headers(retry_count: u32) -> MessageHeaders {
        MessageHeaders {
            retry_count,
            first_attempt_ms: 1_000,
            death: None,
        }
    }

    #[test]
    fn publish_get_ack() {
        let broker = broker_with_queues(None, None);
        broker.publish("main", b"one", &headers(0)).unwrap();
        broker.publish("main", b"two", &headers(1)).unwrap();

        let first = broker.basic_get("main").unwrap().unwrap();
        assert_eq!(first.body, b"one");
        let second = broker.basic_get("main").unwrap().unwrap();
        assert_eq!(second.headers.retry_count, 1);
        assert!(broker.basic_get("main").unwrap().is_none());

        broker.ack(first.tag).unwrap();
        assert_eq!(broker.queue_depth("main").unwrap(), 1);
        assert!(matches!(
            broker.ack(first.tag),
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[test]
    fn reject_routes_to_dead_letter_queue() {
        let broker = broker_with_queues(None, None);
        broker.publish("main", b"bad", &headers(3)).unwrap();
        let d = broker.basic_get("main").unwrap().unwrap();
        broker.nack(d.tag, false).unwrap();

        assert_eq!(broker.queue_depth("main").unwrap(), 0);
        let dead = broker.basic_get("dlq").unwrap().unwrap();
        let death = dead.headers.death.unwrap();
        assert_eq!(death.count, 1);
        assert_eq!(death.reason, DeadReason::Rejected);
        assert_eq!(death.queue, "main");
        assert_eq!(dead.headers.retry_count, 3);
    }

    #[test]
    fn death_count_accumulates_across_hops() {
        let broker = broker_with_queues(None, None);
        let mut h = headers(1);
        h.death = Some(DeathInfo {
            count: 2,
            reason: DeadReason::Rejected,
            first_death_ms: 500,
            queue: "main".into(),
        });
        broker.publish("main", b"again", &h).unwrap();
        let d = broker.basic_get("main").unwrap().unwrap();
        broker.nack(d.tag, false).unwrap();

        let dead = broker.basic_get("dlq").unwrap().unwrap();
        let death = dead.headers.death.unwrap();
        assert_eq!(death.count, 3);
        assert_eq!(death.first_death_ms, 500);
    }

    #[test]
    fn expired_messages_are_dead_lettered() {
        let broker = broker_with_queues(Some(1), None);
        broker.publish("main", b"old", &headers(0)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(broker.basic_get("main").unwrap().is_none());
        let dead = broker.basic_get("dlq").unwrap().unwrap();
        assert_eq!(dead.headers.death.unwrap().reason, DeadReason::Expired);
    }

    #[test]
    fn overflow_dead_letters_oldest() {
        let broker = broker_with_queues(None, Some(2));
        for body in [b"a", b"b", b"c"] {
            broker.publish("main", body, &headers(0)).unwrap();
        }
        assert_eq!(broker.queue_depth("main").unwrap(), 2);
        let dead = broker.basic_get("dlq").unwrap().unwrap();
        assert_eq!(dead.body, b"a");
        assert_eq!(dead.headers.death.unwrap().reason, DeadReason::Maxlen);
    }

    #[test]
    fn requeue_and_reconnect_return_messages() {
        let broker = broker_with_queues(None, None);
        broker.publish("main", b"x", &headers(0)).unwrap();
        let d = broker.basic_get("main").unwrap().unwrap();
        broker.nack(d.tag, true).unwrap();

        let d = broker.basic_get("main").unwrap().unwrap();
        broker.disconnect();
        assert!(matches!(
            broker.basic_get("main"),
            Err(BrokerError::Disconnected(_))
        ));
        broker.reconnect().unwrap();
        assert!(matches!(broker.ack(d.tag), Err(BrokerError::UnknownDelivery(_))));
        let again = broker.basic_get("main").unwrap().unwrap();
        assert_eq!(again.body, b"x");
    }

    #[test]
    fn undeclared_queue_is_rejected() {
        let broker = SqliteBroker::open_in_memory().unwrap();
        assert!(matches!(
            broker.publish("nope", b"x", &headers(0)),
            Err(BrokerError::UnknownQueue(_))
        ));
    }

    #[test]
    fn file_backed_broker_recovers_unacked_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.db");
        {
            let broker = SqliteBroker::open(&path).unwrap();
            broker
                .declare_queue(&QueueSpec {
                    name: "main".into(),
                    message_ttl_ms: None,
                    max_length: None,
                    dead_letter_queue: None,
                })
                .unwrap();
            broker.publish("main", b"survive", &headers(0)).unwrap();
            let _inflight = broker.basic_get("main").unwrap().unwrap();
        }
        let broker = SqliteBroker::open(&path).unwrap();
        broker
            .declare_queue(&QueueSpec {
                name: "main".into(),
                message_ttl_ms: None,
                max_length: None,
                dead_letter_queue: None,
            })
            .unwrap();
        let d = broker.basic_get("main").unwrap().unwrap();
        assert_eq!(d.body, b"survive");
    }
}
