//! Durable message transport between the merge stage and the consumers.
//!
//! The broker itself is synchronous; everything async goes through
//! `spawn_blocking`. Consumer workers are plain threads that pull with
//! manual ack and hand each alert to the async handlers over a channel.

pub mod broker;
mod health;
pub mod message;
mod publisher;
pub mod sqlite_broker;
#[cfg(test)]
pub(crate) mod testing;

pub use health::ProbeReport;
pub use publisher::AlertPublisher;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use self::broker::{Broker, BrokerError, Delivery, MessageHeaders, QueueSpec};
use self::message::{AlertPayload, DeadLetterItem, ReprocessAction};
use crate::core::compensation::backoff::capped_exponential;
use crate::core::config::TransportConfig;
use crate::core::error::PipelineError;
use crate::core::store::now_ms;

const PUBLISH_BACKOFF_CAP_MS: u64 = 5_000;
const DISPATCH_CHANNEL_SIZE: usize = 64;

/// Business handler invoked for every consumed alert. An `Err` leaves the
/// message to the retry/dead-letter path; `PoisonMessage` skips retries.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, alert: &AlertPayload) -> Result<(), PipelineError>;
}

struct DispatchRequest {
    alert: AlertPayload,
    reply: oneshot::Sender<Result<(), PipelineError>>,
}

struct ConsumerRuntime {
    stop: Arc<AtomicBool>,
    alive: Vec<Arc<AtomicBool>>,
}

#[derive(Default)]
struct TransportCounters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    consumed: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    poison: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TransportStats {
    pub connected: bool,
    pub consumers_alive: usize,
    pub consumers_expected: usize,
    pub published: u64,
    pub publish_failures: u64,
    pub consumed: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub poison: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub last_probe: Option<ProbeReport>,
}

pub struct Transport {
    broker: Arc<dyn Broker>,
    config: TransportConfig,
    handlers: Arc<RwLock<Vec<Arc<dyn AlertHandler>>>>,
    consumer: Mutex<Option<ConsumerRuntime>>,
    counters: Arc<TransportCounters>,
    health: health::HealthState,
}

impl Transport {
    pub fn new(broker: Arc<dyn Broker>, config: TransportConfig) -> Self {
        Self {
            broker,
            config,
            handlers: Arc::new(RwLock::new(Vec::new())),
            consumer: Mutex::new(None),
            counters: Arc::new(TransportCounters::default()),
            health: health::HealthState::default(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Broker) -> Result<T, BrokerError> + Send + 'static,
    {
        let broker = self.broker.clone();
        tokio::task::spawn_blocking(move || f(broker.as_ref()))
            .await
            .map_err(|e| PipelineError::TransientTransport(format!("broker task failed: {e}")))?
            .map_err(PipelineError::from)
    }

    /// Main queue plus its dead-letter queue. Idempotent.
    pub async fn declare_topology(&self) -> Result<(), PipelineError> {
        let dlq = QueueSpec {
            name: self.config.dead_letter_queue.clone(),
            message_ttl_ms: Some(self.config.dead_letter_ttl_ms),
            max_length: Some(self.config.dead_letter_max_length),
            dead_letter_queue: None,
        };
        let main = QueueSpec {
            name: self.config.queue_name.clone(),
            message_ttl_ms: Some(self.config.queue_ttl_ms),
            max_length: Some(self.config.queue_max_length),
            dead_letter_queue: Some(self.config.dead_letter_queue.clone()),
        };
        self.blocking(move |b| {
            b.declare_queue(&dlq)?;
            b.declare_queue(&main)
        })
        .await?;
        info!(
            "Declared queue {} (dead letters -> {})",
            self.config.queue_name, self.config.dead_letter_queue
        );
        Ok(())
    }

    /// Publish a fresh alert with confirm, retrying with backoff and a
    /// reconnect between attempts.
    pub async fn publish(&self, alert: &AlertPayload) -> Result<(), PipelineError> {
        let body = alert.to_bytes()?;
        let headers = MessageHeaders {
            retry_count: 0,
            first_attempt_ms: now_ms(),
            death: None,
        };
        self.publish_bytes(body, headers, self.config.publish_attempts)
            .await
    }

    /// Single-shot publish used by the producer lane, which does its own
    /// retry accounting.
    pub async fn publish_once(
        &self,
        body: Vec<u8>,
        first_attempt_ms: i64,
    ) -> Result<(), PipelineError> {
        let headers = MessageHeaders {
            retry_count: 0,
            first_attempt_ms,
            death: None,
        };
        self.publish_bytes(body, headers, 1).await
    }

    async fn publish_bytes(
        &self,
        body: Vec<u8>,
        headers: MessageHeaders,
        attempts: u32,
    ) -> Result<(), PipelineError> {
        let attempts = attempts.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            let queue = self.config.queue_name.clone();
            let body = body.clone();
            let headers = headers.clone();
            match self
                .blocking(move |b| b.publish(&queue, &body, &headers))
                .await
            {
                Ok(()) => {
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Publish attempt {}/{} failed: {}", attempt + 1, attempts, e);
                    last_error = e.to_string();
                    if attempt + 1 < attempts {
                        if let Err(e) = self.blocking(|b| b.reconnect()).await {
                            debug!("Reconnect before publish retry failed: {}", e);
                        }
                        tokio::time::sleep(capped_exponential(
                            self.config.publish_backoff_ms,
                            PUBLISH_BACKOFF_CAP_MS,
                            attempt,
                        ))
                        .await;
                    }
                }
            }
        }
        self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
        Err(PipelineError::TransientTransport(format!(
            "publish failed after {attempts} attempt(s): {last_error}"
        )))
    }

    /// Register a handler and make sure consumer workers are running.
    pub fn consume(&self, handler: Arc<dyn AlertHandler>) -> Result<(), PipelineError> {
        match self.handlers.write() {
            Ok(mut handlers) => {
                info!("Registered alert handler {}", handler.name());
                handlers.push(handler);
            }
            Err(_) => {
                return Err(PipelineError::TransientTransport(
                    "handler registry lock poisoned".to_string(),
                ));
            }
        }
        self.start_consumers()
    }

    fn has_handlers(&self) -> bool {
        self.handlers.read().map(|h| !h.is_empty()).unwrap_or(false)
    }

    fn start_consumers(&self) -> Result<(), PipelineError> {
        let mut slot = self.consumer.lock().map_err(|_| {
            PipelineError::TransientTransport("consumer runtime lock poisoned".to_string())
        })?;
        if slot.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            PipelineError::TransientTransport("consumers need a tokio runtime".to_string())
        })?;

        let (tx, rx) = mpsc::channel::<DispatchRequest>(DISPATCH_CHANNEL_SIZE);
        runtime.spawn(dispatch_loop(rx, self.handlers.clone()));

        let stop = Arc::new(AtomicBool::new(false));
        let mut alive = Vec::with_capacity(self.config.consumer_workers);
        for id in 0..self.config.consumer_workers {
            let flag = Arc::new(AtomicBool::new(true));
            let ctx = WorkerContext {
                id,
                broker: self.broker.clone(),
                queue: self.config.queue_name.clone(),
                max_retries: self.config.max_retries,
                poll: Duration::from_millis(self.config.poll_interval_ms),
                stop: stop.clone(),
                alive: flag.clone(),
                tx: tx.clone(),
                counters: self.counters.clone(),
            };
            if let Err(e) = std::thread::Builder::new()
                .name(format!("alert-consumer-{id}"))
                .spawn(move || worker_loop(ctx))
            {
                stop.store(true, Ordering::SeqCst);
                return Err(PipelineError::TransientTransport(format!(
                    "failed to spawn consumer worker: {e}"
                )));
            }
            alive.push(flag);
        }
        info!(
            "Started {} consumer worker(s) on {}",
            self.config.consumer_workers, self.config.queue_name
        );
        *slot = Some(ConsumerRuntime { stop, alive });
        Ok(())
    }

    /// Signal workers to exit after their current message. In-flight
    /// messages are acked or requeued before the worker stops.
    pub fn stop_consumers(&self) {
        let runtime = match self.consumer.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(runtime) = runtime {
            runtime.stop.store(true, Ordering::SeqCst);
            info!("Consumer workers signalled to stop");
        }
    }

    /// Replace the worker set, keeping the registered handlers.
    pub fn restart_consumers(&self) -> Result<(), PipelineError> {
        self.stop_consumers();
        if self.has_handlers() {
            self.start_consumers()?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// `(alive, expected)` worker counts. Expected is 0 when consumption
    /// was never started.
    pub fn consumer_counts(&self) -> (usize, usize) {
        match self.consumer.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(rt) => (
                    rt.alive.iter().filter(|a| a.load(Ordering::SeqCst)).count(),
                    rt.alive.len(),
                ),
                None => (0, 0),
            },
            Err(_) => (0, 0),
        }
    }

    pub async fn queue_depths(&self) -> Result<(u64, u64), PipelineError> {
        let main = self.config.queue_name.clone();
        let dlq = self.config.dead_letter_queue.clone();
        self.blocking(move |b| Ok((b.queue_depth(&main)?, b.queue_depth(&dlq)?)))
            .await
    }

    /// Fetch up to `max` dead-lettered messages without acking them. Every
    /// returned item must go back through `reprocess` or `release`.
    pub async fn peek_dead_lettered(&self, max: usize) -> Result<Vec<DeadLetterItem>, PipelineError> {
        let dlq = self.config.dead_letter_queue.clone();
        let deliveries: Vec<Delivery> = self
            .blocking(move |b| {
                let mut out = Vec::new();
                for _ in 0..max {
                    match b.basic_get(&dlq) {
                        Ok(Some(d)) => out.push(d),
                        Ok(None) => break,
                        Err(e) if out.is_empty() => return Err(e),
                        Err(e) => {
                            warn!("Dead-letter fetch stopped early: {}", e);
                            break;
                        }
                    }
                }
                Ok(out)
            })
            .await?;
        Ok(deliveries
            .into_iter()
            .map(DeadLetterItem::from_delivery)
            .collect())
    }

    /// Requeue to the main queue with `retryCount + 1`, or discard. The
    /// dead-letter copy is acked only after the republish is confirmed.
    pub async fn reprocess(
        &self,
        item: DeadLetterItem,
        action: ReprocessAction,
    ) -> Result<(), PipelineError> {
        let tag = item.delivery_tag;
        match action {
            ReprocessAction::Requeue => {
                let mut headers = item.delivery.headers.clone();
                headers.retry_count = item.retry_count.saturating_add(1);
                if headers.first_attempt_ms <= 0 {
                    headers.first_attempt_ms = now_ms();
                }
                let queue = self.config.queue_name.clone();
                let body = item.raw;
                self.blocking(move |b| match b.publish(&queue, &body, &headers) {
                    Ok(()) => b.ack(tag),
                    Err(e) => {
                        if let Err(nack_err) = b.nack(tag, true) {
                            warn!("Could not return dead letter {} to its queue: {}", tag, nack_err);
                        }
                        Err(e)
                    }
                })
                .await?;
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
            }
            ReprocessAction::Discard => {
                self.blocking(move |b| b.ack(tag)).await?;
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Put an unhandled dead letter back where it was.
    pub async fn release(&self, item: DeadLetterItem) -> Result<(), PipelineError> {
        let tag = item.delivery_tag;
        self.blocking(move |b| b.nack(tag, true)).await
    }

    pub fn stats(&self) -> TransportStats {
        let (alive, expected) = self.consumer_counts();
        let c = &self.counters;
        TransportStats {
            connected: self.is_connected(),
            consumers_alive: alive,
            consumers_expected: expected,
            published: c.published.load(Ordering::Relaxed),
            publish_failures: c.publish_failures.load(Ordering::Relaxed),
            consumed: c.consumed.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            poison: c.poison.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            last_probe: self.health.last_report(),
        }
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<DispatchRequest>,
    handlers: Arc<RwLock<Vec<Arc<dyn AlertHandler>>>>,
) {
    while let Some(req) = rx.recv().await {
        let snapshot: Vec<Arc<dyn AlertHandler>> =
            handlers.read().map(|h| h.clone()).unwrap_or_default();
        let mut result = if snapshot.is_empty() {
            Err(PipelineError::TransientTransport(
                "no alert handler registered".to_string(),
            ))
        } else {
            Ok(())
        };
        for handler in snapshot {
            if let Err(e) = handler.handle(&req.alert).await {
                warn!(
                    "Handler {} failed for alert {}: {}",
                    handler.name(),
                    req.alert.alert_id,
                    e
                );
                result = Err(e);
                break;
            }
        }
        let _ = req.reply.send(result);
    }
    debug!("Alert dispatcher stopped");
}

struct WorkerContext {
    id: usize,
    broker: Arc<dyn Broker>,
    queue: String,
    max_retries: u32,
    poll: Duration,
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    tx: mpsc::Sender<DispatchRequest>,
    counters: Arc<TransportCounters>,
}

fn worker_loop(ctx: WorkerContext) {
    debug!("Consumer worker {} polling {}", ctx.id, ctx.queue);
    while !ctx.stop.load(Ordering::SeqCst) {
        match ctx.broker.basic_get(&ctx.queue) {
            Ok(Some(delivery)) => {
                if !handle_delivery(&ctx, delivery) {
                    break;
                }
            }
            Ok(None) => std::thread::sleep(ctx.poll),
            Err(e) => {
                debug!("Consumer worker {} fetch failed: {}", ctx.id, e);
                std::thread::sleep(ctx.poll);
            }
        }
    }
    ctx.alive.store(false, Ordering::SeqCst);
    info!("Consumer worker {} stopped", ctx.id);
}

/// Returns false when the dispatcher is gone and the worker should exit.
fn handle_delivery(ctx: &WorkerContext, delivery: Delivery) -> bool {
    ctx.counters.consumed.fetch_add(1, Ordering::Relaxed);
    let tag = delivery.tag;

    let alert = match AlertPayload::from_bytes(&delivery.body) {
        Ok(alert) => alert,
        Err(e) => {
            warn!("Dead-lettering poison message {}: {}", tag, e);
            ctx.counters.poison.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = ctx.broker.nack(tag, false) {
                error!("Failed to reject poison message {}: {}", tag, e);
            }
            return true;
        }
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if ctx
        .tx
        .blocking_send(DispatchRequest {
            alert,
            reply: reply_tx,
        })
        .is_err()
    {
        if let Err(e) = ctx.broker.nack(tag, true) {
            warn!("Failed to requeue message {}: {}", tag, e);
        }
        return false;
    }
    let outcome = reply_rx.blocking_recv().unwrap_or_else(|_| {
        Err(PipelineError::TransientTransport(
            "dispatcher dropped the request".to_string(),
        ))
    });

    match outcome {
        Ok(()) => match ctx.broker.ack(tag) {
            Ok(()) => {
                ctx.counters.acked.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("Ack of message {} failed, it will be redelivered: {}", tag, e),
        },
        Err(PipelineError::PoisonMessage(reason)) => {
            warn!("Handler rejected message {} as poison: {}", tag, reason);
            ctx.counters.poison.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = ctx.broker.nack(tag, false) {
                error!("Failed to reject message {}: {}", tag, e);
            }
        }
        Err(e) if delivery.headers.retry_count < ctx.max_retries => {
            let mut headers = delivery.headers.clone();
            headers.retry_count += 1;
            let republished = ctx
                .broker
                .publish(&ctx.queue, &delivery.body, &headers)
                .and_then(|_| ctx.broker.ack(tag));
            match republished {
                Ok(()) => {
                    ctx.counters.retried.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Message {} retried ({}/{}) after: {}",
                        tag, headers.retry_count, ctx.max_retries, e
                    );
                }
                Err(pub_err) => {
                    warn!("Retry republish of {} failed: {}", tag, pub_err);
                    if let Err(e) = ctx.broker.nack(tag, true) {
                        warn!("Failed to requeue message {}: {}", tag, e);
                    }
                }
            }
        }
        Err(e) => {
            warn!(
                "Message {} exhausted {} retries, dead-lettering: {}",
                tag, ctx.max_retries, e
            );
            ctx.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = ctx.broker.nack(tag, false) {
                error!("Failed to dead-letter message {}: {}", tag, e);
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::testing::{FlakyBroker, collect_until, test_transport_config};
    use super::*;
    use crate::core::transport::message::tests::sample_alert;
    use std::sync::atomic::AtomicU32;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        async fn handle(&self, alert: &AlertPayload) -> Result<(), PipelineError> {
            self.seen.lock().unwrap().push(alert.alert_id.clone());
            Ok(())
        }
    }

    struct AlwaysFails {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AlertHandler for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }
        async fn handle(&self, _alert: &AlertPayload) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::TransientTransport("db down".into()))
        }
    }

    async fn transport(broker: Arc<dyn Broker>) -> Transport {
        let t = Transport::new(broker, test_transport_config());
        t.declare_topology().await.unwrap();
        t
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn published_alert_reaches_handler_and_is_acked() {
        let t = transport(Arc::new(FlakyBroker::new())).await;
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        t.consume(recorder.clone()).unwrap();
        t.publish(&sample_alert("a-1", 2)).await.unwrap();

        collect_until(|| recorder.seen.lock().unwrap().len() == 1).await;
        collect_until(|| t.stats().acked == 1).await;
        assert_eq!(t.queue_depths().await.unwrap(), (0, 0));
        t.stop_consumers();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_handler_retries_then_dead_letters() {
        let t = transport(Arc::new(FlakyBroker::new())).await;
        let handler = Arc::new(AlwaysFails {
            calls: AtomicU32::new(0),
        });
        t.consume(handler.clone()).unwrap();
        t.publish(&sample_alert("a-2", 3)).await.unwrap();

        // max_retries = 2: one first attempt plus two retries
        collect_until(|| t.stats().dead_lettered == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        t.stop_consumers();

        let items = t.peek_dead_lettered(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].retry_count, 2);
        assert_eq!(items[0].death_count, 1);
        assert_eq!(items[0].alert_id(), Some("a-2"));
        t.release(items.into_iter().next().unwrap()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn poison_message_skips_retries() {
        let broker = Arc::new(FlakyBroker::new());
        let t = transport(broker.clone()).await;
        let handler = Arc::new(AlwaysFails {
            calls: AtomicU32::new(0),
        });
        broker
            .publish("alerts", b"{garbage", &MessageHeaders::default())
            .unwrap();
        t.consume(handler.clone()).unwrap();

        collect_until(|| t.stats().poison == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        t.stop_consumers();
        let items = t.peek_dead_lettered(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].payload.is_none());
        assert!(items[0].parse_error.is_some());
    }

    #[tokio::test]
    async fn publish_reports_transient_error_when_broker_is_down() {
        let broker = Arc::new(FlakyBroker::new());
        let t = transport(broker.clone()).await;
        broker.set_down(true);
        let err = t.publish(&sample_alert("a-3", 2)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(t.stats().publish_failures, 1);

        broker.set_down(false);
        t.publish(&sample_alert("a-3", 2)).await.unwrap();
        assert_eq!(t.queue_depths().await.unwrap().0, 1);
    }

    #[tokio::test]
    async fn requeue_increments_retry_count_and_discard_acks() {
        let broker = Arc::new(FlakyBroker::new());
        let t = transport(broker.clone()).await;
        let body = sample_alert("a-4", 2).to_bytes().unwrap();
        for _ in 0..2 {
            broker
                .publish(
                    "alerts",
                    &body,
                    &MessageHeaders {
                        retry_count: 1,
                        first_attempt_ms: 42,
                        death: None,
                    },
                )
                .unwrap();
            let d = broker.basic_get("alerts").unwrap().unwrap();
            broker.nack(d.tag, false).unwrap();
        }

        let mut items = t.peek_dead_lettered(10).await.unwrap();
        assert_eq!(items.len(), 2);
        let second = items.pop().unwrap();
        let first = items.pop().unwrap();

        t.reprocess(first, ReprocessAction::Requeue).await.unwrap();
        t.reprocess(second, ReprocessAction::Discard).await.unwrap();
        assert_eq!(t.queue_depths().await.unwrap(), (1, 0));

        let requeued = broker.basic_get("alerts").unwrap().unwrap();
        assert_eq!(requeued.headers.retry_count, 2);
        assert_eq!(requeued.headers.first_attempt_ms, 42);
        assert_eq!(requeued.headers.death.as_ref().map(|d| d.count), Some(1));
    }
}
