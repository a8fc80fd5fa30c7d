//! Test doubles for the transport layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::broker::{Broker, BrokerError, Delivery, MessageHeaders, QueueSpec};
use super::sqlite_broker::SqliteBroker;
use crate::core::config::TransportConfig;

/// In-memory broker whose connection can be cut and restored at will.
pub(crate) struct FlakyBroker {
    inner: SqliteBroker,
    down: AtomicBool,
}

impl FlakyBroker {
    pub(crate) fn new() -> Self {
        Self {
            inner: SqliteBroker::open_in_memory().expect("in-memory broker"),
            down: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected("simulated outage".to_string()));
        }
        Ok(())
    }
}

impl Broker for FlakyBroker {
    fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.check()?;
        self.inner.declare_queue(spec)
    }

    fn publish(&self, queue: &str, body: &[u8], headers: &MessageHeaders) -> Result<(), BrokerError> {
        self.check()?;
        self.inner.publish(queue, body, headers)
    }

    fn basic_get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.check()?;
        self.inner.basic_get(queue)
    }

    fn ack(&self, tag: u64) -> Result<(), BrokerError> {
        self.check()?;
        self.inner.ack(tag)
    }

    fn nack(&self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.check()?;
        self.inner.nack(tag, requeue)
    }

    fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        self.check()?;
        self.inner.queue_depth(queue)
    }

    fn is_connected(&self) -> bool {
        !self.down.load(Ordering::SeqCst) && self.inner.is_connected()
    }

    fn reconnect(&self) -> Result<(), BrokerError> {
        self.check()?;
        self.inner.reconnect()
    }
}

pub(crate) fn test_transport_config() -> TransportConfig {
    TransportConfig {
        queue_name: "alerts".to_string(),
        dead_letter_queue: "alerts.dlq".to_string(),
        max_retries: 2,
        publish_attempts: 2,
        publish_backoff_ms: 10,
        poll_interval_ms: 10,
        unhealthy_probe_threshold: 2,
        ..TransportConfig::default()
    }
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub(crate) async fn collect_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
