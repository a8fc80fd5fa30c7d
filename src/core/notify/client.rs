use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::core::config::NotifyConfig;
use crate::core::error::PipelineError;
use crate::core::store::now_ms;

/// One frame on a client's push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// Serialized notification JSON, sent as `data: <json>`.
    Data(String),
    /// Keep-alive comment, sent as `: heartbeat`.
    Heartbeat,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientMeta {
    pub client_id: String,
    pub ip: String,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionHealth {
    Healthy,
    Stale,
    Suspicious,
    Dead,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub connection_id: String,
    pub client_id: String,
    pub ip: String,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub heartbeat_count: u64,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub health: ConnectionHealth,
}

/// Server side of one push connection: the bounded queue plus activity
/// counters used by the health sweep.
pub struct ClientConnection {
    pub connection_id: String,
    pub meta: ClientMeta,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<SseFrame>,
    last_activity_ms: AtomicI64,
    message_count: AtomicU64,
    heartbeat_count: AtomicU64,
    error_count: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl ClientConnection {
    pub(super) fn new(meta: ClientMeta, sender: mpsc::Sender<SseFrame>) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            meta,
            connected_at: Utc::now(),
            sender,
            last_activity_ms: AtomicI64::new(now_ms()),
            message_count: AtomicU64::new(0),
            heartbeat_count: AtomicU64::new(0),
            error_count: AtomicU32::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Bounded-time enqueue on the client's queue.
    pub async fn send(&self, frame: SseFrame, timeout: Duration) -> Result<(), PipelineError> {
        let is_heartbeat = frame == SseFrame::Heartbeat;
        match tokio::time::timeout(timeout, self.sender.send(frame)).await {
            Ok(Ok(())) => {
                self.touch();
                if is_heartbeat {
                    self.heartbeat_count.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.message_count.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Ok(Err(_)) => {
                self.record_error("client channel closed");
                Err(PipelineError::ClientUnavailable {
                    client_id: self.meta.client_id.clone(),
                })
            }
            Err(_) => {
                self.record_error("send timed out");
                Err(PipelineError::ClientDeliveryTimeout {
                    client_id: self.meta.client_id.clone(),
                })
            }
        }
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn record_error(&self, error: &str) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }

    pub fn idle(&self, now: i64) -> Duration {
        let idle_ms = now - self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(idle_ms.max(0) as u64)
    }

    pub fn health(&self, config: &NotifyConfig, now: i64) -> ConnectionHealth {
        if self.sender.is_closed() || self.error_count.load(Ordering::Relaxed) >= config.max_error_count {
            return ConnectionHealth::Dead;
        }
        let idle = self.idle(now).as_secs();
        if idle >= config.dead_threshold_seconds {
            ConnectionHealth::Dead
        } else if idle >= config.suspicious_threshold_seconds {
            ConnectionHealth::Suspicious
        } else if idle >= config.stale_threshold_seconds {
            ConnectionHealth::Stale
        } else {
            ConnectionHealth::Healthy
        }
    }

    pub fn info(&self, config: &NotifyConfig, now: i64) -> ClientInfo {
        ClientInfo {
            connection_id: self.connection_id.clone(),
            client_id: self.meta.client_id.clone(),
            ip: self.meta.ip.clone(),
            user_agent: self.meta.user_agent.clone(),
            connected_at: self.connected_at,
            last_activity: crate::core::store::ms_to_dt(self.last_activity_ms.load(Ordering::Relaxed)),
            message_count: self.message_count.load(Ordering::Relaxed),
            heartbeat_count: self.heartbeat_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
            health: self.health(config, now),
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, ms_ago: i64) {
        self.last_activity_ms.store(now_ms() - ms_ago, Ordering::Relaxed);
    }
}

/// Returned by `register`; the receiver feeds the client's SSE response.
pub struct ClientHandle {
    pub connection_id: String,
    pub client_id: String,
    pub receiver: mpsc::Receiver<SseFrame>,
}
