use thiserror::Error;

use crate::core::error::PipelineError;

/// Why a message was moved to its dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadReason {
    Rejected,
    Expired,
    Maxlen,
}

impl DeadReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadReason::Rejected => "rejected",
            DeadReason::Expired => "expired",
            DeadReason::Maxlen => "maxlen",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "expired" => DeadReason::Expired,
            "maxlen" => DeadReason::Maxlen,
            _ => DeadReason::Rejected,
        }
    }
}

/// `x-death` style metadata, accumulated across dead-letter hops.
#[derive(Debug, Clone, PartialEq)]
pub struct DeathInfo {
    pub count: u32,
    pub reason: DeadReason,
    pub first_death_ms: i64,
    pub queue: String,
}

/// Per-message headers: `retryCount`, `firstAttemptTime` and the death
/// metadata, stored as typed columns by the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageHeaders {
    pub retry_count: u32,
    pub first_attempt_ms: i64,
    pub death: Option<DeathInfo>,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
}

#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: String,
    pub message_ttl_ms: Option<u64>,
    pub max_length: Option<u64>,
    pub dead_letter_queue: Option<String>,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker disconnected: {0}")]
    Disconnected(String),
    #[error("broker storage error: {0}")]
    Storage(String),
    #[error("queue {0} is not declared")]
    UnknownQueue(String),
    #[error("delivery tag {0} is not in flight")]
    UnknownDelivery(u64),
}

impl From<rusqlite::Error> for BrokerError {
    fn from(e: rusqlite::Error) -> Self {
        BrokerError::Storage(e.to_string())
    }
}

impl From<BrokerError> for PipelineError {
    fn from(e: BrokerError) -> Self {
        PipelineError::TransientTransport(e.to_string())
    }
}

/// Minimal AMQP-shaped broker surface. Calls block; async callers go
/// through `spawn_blocking`. `publish` returns only once the message is
/// durably stored (publisher confirm).
pub trait Broker: Send + Sync {
    fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    fn publish(&self, queue: &str, body: &[u8], headers: &MessageHeaders) -> Result<(), BrokerError>;

    /// Fetch one message with manual ack. `None` when the queue is empty.
    fn basic_get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    fn ack(&self, tag: u64) -> Result<(), BrokerError>;

    /// `requeue = false` routes the message to the queue's dead-letter queue.
    fn nack(&self, tag: u64, requeue: bool) -> Result<(), BrokerError>;

    fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError>;

    fn is_connected(&self) -> bool;

    /// Re-open the connection. Unacked deliveries return to their queues.
    fn reconnect(&self) -> Result<(), BrokerError>;
}
