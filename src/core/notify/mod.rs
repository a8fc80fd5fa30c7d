//! Push notifications over SSE with application-level acknowledgement.
//!
//! The manager owns the client registry. Every push is mirrored by a
//! durable notification record so the compensation orchestrator can
//! resend what a client never confirmed.

mod archive;
pub mod client;

pub use archive::AlertArchiveHandler;
pub use client::{ClientHandle, ClientInfo, ClientMeta, ConnectionHealth, SseFrame};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use self::client::ClientConnection;
use crate::core::config::NotifyConfig;
use crate::core::error::PipelineError;
use crate::core::store::AlertStore;
use crate::core::store::now_ms;
use crate::core::store::types::{AckOutcome, NewNotification, NotificationRecord};
use crate::core::transport::message::AlertPayload;

struct PendingAck {
    notification_id: String,
    client_id: String,
}

#[derive(Default)]
struct NotifyCounters {
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    acked: AtomicU64,
    expired: AtomicU64,
    resent: AtomicU64,
    heartbeats: AtomicU64,
    rejected: AtomicU64,
    removed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotifyStats {
    pub connected_clients: usize,
    pub pending_acks: usize,
    pub broadcasts: u64,
    pub delivered: u64,
    pub failed: u64,
    pub acked: u64,
    pub expired: u64,
    pub resent: u64,
    pub heartbeats: u64,
    pub rejected: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub heartbeats: usize,
    pub removed: usize,
}

pub struct NotificationManager {
    store: AlertStore,
    config: NotifyConfig,
    clients: RwLock<HashMap<String, Arc<ClientConnection>>>,
    pending_acks: Mutex<HashMap<String, PendingAck>>,
    counters: NotifyCounters,
}

/// Notification body pushed to clients and stored on each record.
pub fn notification_content(notification_id: &str, ack_required: bool, alert: &AlertPayload) -> String {
    serde_json::json!({
        "type": "alert",
        "notificationId": notification_id,
        "ackRequired": ack_required,
        "alert": alert,
    })
    .to_string()
}

impl NotificationManager {
    pub fn new(store: AlertStore, config: NotifyConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            clients: RwLock::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            counters: NotifyCounters::default(),
        })
    }

    /// Admit a client and open its bounded queue. A reconnect with the same
    /// client id replaces the previous connection.
    pub async fn register(&self, meta: ClientMeta) -> Result<ClientHandle, PipelineError> {
        if !self.config.ip_allow_list.is_empty() && !self.config.ip_allow_list.contains(&meta.ip) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Rejected client {} from {}: not in allow list", meta.client_id, meta.ip);
            return Err(PipelineError::ClientRejected(format!(
                "address {} is not allowed",
                meta.ip
            )));
        }

        let mut clients = self.clients.write().await;
        let from_ip = clients
            .values()
            .filter(|c| c.meta.ip == meta.ip && c.meta.client_id != meta.client_id)
            .count();
        if from_ip >= self.config.max_connections_per_ip {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Rejected client {} from {}: {} connections already open",
                meta.client_id, meta.ip, from_ip
            );
            return Err(PipelineError::ClientRejected(format!(
                "too many connections from {}",
                meta.ip
            )));
        }

        let (tx, rx) = mpsc::channel(self.config.max_queue_size);
        let conn = Arc::new(ClientConnection::new(meta, tx));
        let handle = ClientHandle {
            connection_id: conn.connection_id.clone(),
            client_id: conn.meta.client_id.clone(),
            receiver: rx,
        };
        if clients
            .insert(conn.meta.client_id.clone(), conn.clone())
            .is_some()
        {
            info!("Client {} reconnected, replacing previous stream", conn.meta.client_id);
        }
        info!(
            "Client {} connected from {} ({} connected)",
            conn.meta.client_id,
            conn.meta.ip,
            clients.len()
        );
        Ok(handle)
    }

    /// Remove a connection if it is still the current one for its client.
    /// Pending acks of the client are dropped so their watchers stand down.
    pub async fn unregister(&self, connection_id: &str, client_id: &str) -> bool {
        let mut clients = self.clients.write().await;
        let current = clients
            .get(client_id)
            .is_some_and(|c| c.connection_id == connection_id);
        if !current {
            return false;
        }
        clients.remove(client_id);
        drop(clients);

        if let Ok(mut pending) = self.pending_acks.lock() {
            pending.retain(|_, p| p.client_id != client_id);
        }
        info!("Client {} disconnected", client_id);
        true
    }

    pub async fn connected_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        let now = now_ms();
        self.clients
            .read()
            .await
            .values()
            .map(|c| c.info(&self.config, now))
            .collect()
    }

    /// Push one alert to every connected client. Each client gets its own
    /// record and its own task, so one slow client only fails itself.
    pub async fn broadcast(self: &Arc<Self>, alert: &AlertPayload) -> usize {
        let targets: Vec<Arc<ClientConnection>> =
            self.clients.read().await.values().cloned().collect();
        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        if targets.is_empty() {
            debug!("No clients connected for alert {}", alert.alert_id);
            return 0;
        }

        let notification_id = uuid::Uuid::new_v4().to_string();
        let content = Arc::new(notification_content(
            &notification_id,
            self.config.ack_required,
            alert,
        ));
        let total = targets.len();
        let mut set = JoinSet::new();
        for client in targets {
            let manager = self.clone();
            let content = content.clone();
            let notification_id = notification_id.clone();
            let alert_id = alert.alert_id.clone();
            let message_id = alert.message_id.clone();
            set.spawn(async move {
                let new = NewNotification {
                    notification_id: &notification_id,
                    alert_id: &alert_id,
                    message_id: &message_id,
                    client_id: &client.meta.client_id,
                    ack_required: manager.config.ack_required,
                    ack_timeout_seconds: manager.config.ack_timeout_seconds,
                    max_retries: manager.config.max_retries,
                    content: content.as_str(),
                };
                match manager.store.create_notification(&new).await {
                    Ok(record) => manager.push(&client, &record).await,
                    Err(e) => {
                        warn!(
                            "Could not record notification for client {}: {}",
                            client.meta.client_id, e
                        );
                        false
                    }
                }
            });
        }

        let mut delivered = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => warn!("Broadcast task failed: {}", e),
            }
        }
        info!(
            "Alert {} pushed to {}/{} client(s)",
            alert.alert_id, delivered, total
        );
        delivered
    }

    /// Resend a claimed record (status SENDING) to its original client.
    pub async fn resend(self: &Arc<Self>, record: &NotificationRecord) -> Result<(), PipelineError> {
        let client = self.clients.read().await.get(&record.client_id).cloned();
        let Some(client) = client else {
            if let Err(e) = self
                .store
                .mark_notification_failed(&record.record_id, "client not connected")
                .await
            {
                warn!("Failed to record resend failure for {}: {}", record.record_id, e);
            }
            return Err(PipelineError::ClientUnavailable {
                client_id: record.client_id.clone(),
            });
        };
        if self.push(&client, record).await {
            self.counters.resent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(PipelineError::ClientDeliveryTimeout {
                client_id: record.client_id.clone(),
            })
        }
    }

    async fn push(self: &Arc<Self>, client: &ClientConnection, record: &NotificationRecord) -> bool {
        let sent = client
            .send(SseFrame::Data(record.content.clone()), self.config.send_timeout())
            .await;
        match sent {
            Ok(()) => {
                if let Err(e) = self.store.mark_notification_delivered(&record.record_id).await {
                    warn!("Failed to mark {} delivered: {}", record.record_id, e);
                }
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                if record.ack_required {
                    self.watch_ack(record);
                }
                true
            }
            Err(e) => {
                warn!(
                    "Push of notification {} to {} failed: {}",
                    record.notification_id, record.client_id, e
                );
                if let Err(e) = self
                    .store
                    .mark_notification_failed(&record.record_id, &e.to_string())
                    .await
                {
                    warn!("Failed to mark {} failed: {}", record.record_id, e);
                }
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn watch_ack(self: &Arc<Self>, record: &NotificationRecord) {
        if let Ok(mut pending) = self.pending_acks.lock() {
            pending.insert(
                record.record_id.clone(),
                PendingAck {
                    notification_id: record.notification_id.clone(),
                    client_id: record.client_id.clone(),
                },
            );
        }
        let manager = self.clone();
        let record_id = record.record_id.clone();
        let timeout = Duration::from_secs(record.ack_timeout_seconds);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_pending = manager
                .pending_acks
                .lock()
                .map(|mut p| p.remove(&record_id).is_some())
                .unwrap_or(false);
            if !still_pending {
                return;
            }
            match manager.store.expire_notification(&record_id).await {
                Ok(true) => {
                    manager.counters.expired.fetch_add(1, Ordering::Relaxed);
                    warn!("Ack timeout for notification record {}", record_id);
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to expire {}: {}", record_id, e),
            }
        });
    }

    /// Idempotent. Duplicate and late acks report their outcome and change
    /// nothing.
    pub async fn acknowledge(
        &self,
        notification_id: &str,
        client_id: &str,
    ) -> Result<AckOutcome, PipelineError> {
        let outcome = self
            .store
            .acknowledge_notification(notification_id, client_id)
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

        if let Ok(mut pending) = self.pending_acks.lock() {
            pending.retain(|_, p| !(p.notification_id == notification_id && p.client_id == client_id));
        }
        if let Some(client) = self.clients.read().await.get(client_id) {
            client.touch();
        }
        match outcome {
            AckOutcome::Acknowledged => {
                self.counters.acked.fetch_add(1, Ordering::Relaxed);
                debug!("Notification {} acknowledged by {}", notification_id, client_id);
            }
            AckOutcome::Late => {
                info!("Late ack for notification {} from {}", notification_id, client_id)
            }
            AckOutcome::AlreadyAcknowledged | AckOutcome::NotFound => {}
        }
        Ok(outcome)
    }

    /// Heartbeat idle clients and drop dead ones.
    pub async fn sweep_connections(&self) -> SweepReport {
        let now = now_ms();
        let snapshot: Vec<Arc<ClientConnection>> =
            self.clients.read().await.values().cloned().collect();
        let heartbeat_after = Duration::from_secs(self.config.heartbeat_interval_seconds);
        let mut report = SweepReport::default();

        for client in snapshot {
            match client.health(&self.config, now) {
                ConnectionHealth::Dead => {
                    if self
                        .unregister(&client.connection_id, &client.meta.client_id)
                        .await
                    {
                        warn!("Removed dead client {}", client.meta.client_id);
                        report.removed += 1;
                    }
                }
                health => {
                    if health != ConnectionHealth::Healthy || client.idle(now) >= heartbeat_after {
                        if client
                            .send(SseFrame::Heartbeat, self.config.send_timeout())
                            .await
                            .is_ok()
                        {
                            report.heartbeats += 1;
                        }
                    }
                }
            }
        }
        self.counters
            .heartbeats
            .fetch_add(report.heartbeats as u64, Ordering::Relaxed);
        self.counters
            .removed
            .fetch_add(report.removed as u64, Ordering::Relaxed);
        if report.removed > 0 || report.heartbeats > 0 {
            debug!(
                "Connection sweep: {} heartbeat(s), {} removed",
                report.heartbeats, report.removed
            );
        }
        report
    }

    pub async fn stats(&self) -> NotifyStats {
        let c = &self.counters;
        NotifyStats {
            connected_clients: self.connected_count().await,
            pending_acks: self.pending_acks.lock().map(|p| p.len()).unwrap_or(0),
            broadcasts: c.broadcasts.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            resent: c.resent.load(Ordering::Relaxed),
            heartbeats: c.heartbeats.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            removed: c.removed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::state::NotificationStatus;
    use crate::core::store::test_store;
    use crate::core::transport::message::tests::sample_alert;

    pub(crate) fn meta(client_id: &str) -> ClientMeta {
        ClientMeta {
            client_id: client_id.to_string(),
            ip: "127.0.0.1".to_string(),
            user_agent: Some("test".to_string()),
        }
    }

    fn quick_config() -> NotifyConfig {
        NotifyConfig {
            ack_timeout_seconds: 1,
            send_timeout_seconds: 0.05,
            max_queue_size: 2,
            ..NotifyConfig::default()
        }
    }

    async fn recv_json(handle: &mut ClientHandle) -> serde_json::Value {
        match handle.receiver.recv().await {
            Some(SseFrame::Data(body)) => serde_json::from_str(&body).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn broadcast_then_ack() {
        let store = test_store();
        let manager = NotificationManager::new(store.clone(), quick_config());
        let mut a = manager.register(meta("a")).await.unwrap();
        let mut b = manager.register(meta("b")).await.unwrap();

        let delivered = manager.broadcast(&sample_alert("alert-1", 2)).await;
        assert_eq!(delivered, 2);

        let frame = recv_json(&mut a).await;
        assert_eq!(frame["type"], "alert");
        assert_eq!(frame["alert"]["alertId"], "alert-1");
        let notification_id = frame["notificationId"].as_str().unwrap().to_string();
        recv_json(&mut b).await;

        assert_eq!(
            manager.acknowledge(&notification_id, "a").await.unwrap(),
            AckOutcome::Acknowledged
        );
        assert_eq!(
            manager.acknowledge(&notification_id, "a").await.unwrap(),
            AckOutcome::AlreadyAcknowledged
        );
        let rec = store
            .get_notification_for_client(&notification_id, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, NotificationStatus::AckReceived);
        let rec = store
            .get_notification_for_client(&notification_id, "b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, NotificationStatus::Delivered);
    }

    #[tokio::test]
    async fn slow_client_fails_alone() {
        let store = test_store();
        let manager = NotificationManager::new(store.clone(), quick_config());
        // never drained: queue size 2 fills after two alerts
        let _slow = manager.register(meta("slow")).await.unwrap();
        let mut fast = manager.register(meta("fast")).await.unwrap();

        for i in 0..3 {
            manager.broadcast(&sample_alert(&format!("alert-{i}"), 2)).await;
            recv_json(&mut fast).await;
        }
        let counts = store.count_notifications_by_status().await.unwrap();
        assert_eq!(counts.get("FAILED"), Some(&1));
        assert_eq!(counts.get("DELIVERED"), Some(&5));
        let failed = store.list_resend_candidates(0, 10).await.unwrap();
        assert_eq!(failed[0].client_id, "slow");
        assert!(
            failed[0]
                .error_message
                .as_deref()
                .unwrap()
                .contains("timed out")
        );
    }

    #[tokio::test]
    async fn unacked_notification_expires() {
        let store = test_store();
        let manager = NotificationManager::new(store.clone(), quick_config());
        let mut a = manager.register(meta("a")).await.unwrap();
        manager.broadcast(&sample_alert("alert-x", 2)).await;
        let frame = recv_json(&mut a).await;
        let notification_id = frame["notificationId"].as_str().unwrap().to_string();

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        let rec = store
            .get_notification_for_client(&notification_id, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, NotificationStatus::Expired);
        assert_eq!(rec.retries, 1);
        assert_eq!(
            manager.acknowledge(&notification_id, "a").await.unwrap(),
            AckOutcome::Late
        );
    }

    #[tokio::test]
    async fn disconnect_disarms_watcher_and_resend_targets_client() {
        let store = test_store();
        let manager = NotificationManager::new(store.clone(), quick_config());
        let a = manager.register(meta("a")).await.unwrap();
        manager.broadcast(&sample_alert("alert-y", 2)).await;
        assert!(manager.unregister(&a.connection_id, "a").await);
        assert_eq!(manager.stats().await.pending_acks, 0);

        // the watcher no longer fires; the durable record stays DELIVERED
        tokio::time::sleep(Duration::from_millis(1_300)).await;
        let counts = store.count_notifications_by_status().await.unwrap();
        assert_eq!(counts.get("DELIVERED"), Some(&1));

        // overdue sweep expires it, and a resend without the client fails
        assert_eq!(store.expire_overdue_notifications(now_ms() + 60_000).await.unwrap(), 1);
        let rec = store.list_resend_candidates(0, 10).await.unwrap().remove(0);
        assert!(store.claim_notification_for_resend(&rec.record_id).await.unwrap());
        let err = manager.resend(&rec).await.unwrap_err();
        assert!(matches!(err, PipelineError::ClientUnavailable { .. }));

        // once the client is back the resend lands on its new stream
        let mut again = manager.register(meta("a")).await.unwrap();
        let rec = store.list_resend_candidates(0, 10).await.unwrap().remove(0);
        assert!(store.claim_notification_for_resend(&rec.record_id).await.unwrap());
        manager.resend(&rec).await.unwrap();
        let frame = recv_json(&mut again).await;
        assert_eq!(frame["alert"]["alertId"], "alert-y");
    }

    #[tokio::test]
    async fn stale_unregister_keeps_newer_connection() {
        let manager = NotificationManager::new(test_store(), quick_config());
        let first = manager.register(meta("a")).await.unwrap();
        let _second = manager.register(meta("a")).await.unwrap();
        assert!(!manager.unregister(&first.connection_id, "a").await);
        assert_eq!(manager.connected_count().await, 1);
    }

    #[tokio::test]
    async fn admission_control() {
        let config = NotifyConfig {
            max_connections_per_ip: 1,
            ..quick_config()
        };
        let manager = NotificationManager::new(test_store(), config);
        let _a = manager.register(meta("a")).await.unwrap();
        let err = manager.register(meta("b")).await.err().unwrap();
        assert!(matches!(err, PipelineError::ClientRejected(_)));

        let restricted = NotificationManager::new(
            test_store(),
            NotifyConfig {
                ip_allow_list: vec!["10.0.0.1".into()],
                ..quick_config()
            },
        );
        assert!(restricted.register(meta("c")).await.is_err());
        assert_eq!(restricted.stats().await.rejected, 1);
    }

    #[tokio::test]
    async fn sweep_heartbeats_idle_and_removes_dead() {
        let manager = NotificationManager::new(test_store(), quick_config());
        let mut idle = manager.register(meta("idle")).await.unwrap();
        let gone = manager.register(meta("gone")).await.unwrap();
        drop(gone.receiver);
        {
            let clients = manager.clients.read().await;
            clients["idle"].backdate_activity(400_000);
        }

        let report = manager.sweep_connections().await;
        assert_eq!(report.removed, 1);
        assert_eq!(report.heartbeats, 1);
        assert_eq!(idle.receiver.recv().await, Some(SseFrame::Heartbeat));
        assert_eq!(manager.connected_count().await, 1);
    }
}
