//! Component E — Queue Fabric (spec §4.E).
//!
//! A single logical priority queue with topic-indexed subscribers,
//! backpressure, at-least-once/exactly-once delivery, and one-shot result
//! correlation. Grounded on the reference gateway's `NotificationMultiplexer`
//! (`gateway/streaming.rs`) for the topic-indexed-subscriber shape, and on
//! `idempotency.rs`'s `DashMap`-backed dedup-with-bounded-eviction pattern
//! for the exactly-once delivered-set. Re-architected per spec §9 away from
//! callback-style `EventEmitter` pub/sub into typed per-topic subscriber
//! lists driven by one dedicated dispatcher task.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Default cap on queue depth before `publish` rejects with `Backpressure`.
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 10_000;
/// Default number of delivery attempts before a message is dropped.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;
/// Default TTL applied when a publish omits one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
/// Cap on the exactly-once delivered-id set.
pub const DELIVERED_SET_CAP: usize = 10_000;
/// Number of ids bulk-evicted once the delivered-set exceeds its cap.
pub const DELIVERED_SET_EVICT_BATCH: usize = 1_000;
/// Dispatcher tick interval.
pub const DISPATCH_TICK: Duration = Duration::from_millis(10);
/// Drain deadline on shutdown.
pub const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(1);

/// Delivery semantics for a queued message (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliverySemantics {
    /// May redeliver on retry.
    AtLeastOnce,
    /// Suppresses replays via the delivered-id set.
    ExactlyOnce,
}

/// A message in flight through the fabric (spec §3 `Queued Message`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Unique message id.
    pub id: String,
    /// Topic this message was published to.
    pub topic: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Priority, 0 (lowest) to 10 (highest).
    pub priority: u8,
    /// Delivery semantics.
    pub delivery_semantics: DeliverySemantics,
    /// Time-to-live in milliseconds from publish.
    pub ttl_ms: u64,
    /// Originating request id, for result correlation.
    pub request_id: Option<String>,
    /// Unix-ms publish time.
    pub published_at: u64,
    /// Delivery attempts made so far.
    pub attempt: u32,
    /// Unix-ms this message expires.
    pub expires_at: u64,
}

impl QueuedMessage {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

/// Options accepted by [`QueueFabric::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Priority, defaults to `0`.
    pub priority: Option<u8>,
    /// TTL override.
    pub ttl: Option<Duration>,
    /// Delivery semantics override.
    pub delivery_semantics: Option<DeliverySemantics>,
    /// Originating request id, for result correlation.
    pub request_id: Option<String>,
}

type SubscriberFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
/// A subscriber callback: takes the delivered payload, returns a future
/// resolving to `Ok` on success or `Err(message)` on failure.
pub type SubscriberFn = Arc<dyn Fn(serde_json::Value) -> SubscriberFuture + Send + Sync>;

struct Subscriber {
    id: u64,
    handler: SubscriberFn,
    active: Arc<AtomicBool>,
}

/// Handle returned by [`QueueFabric::subscribe`].
pub struct Subscription {
    topic: String,
    id: u64,
    active: Arc<AtomicBool>,
    fabric: Arc<QueueFabricInner>,
}

impl Subscription {
    /// Deactivate and remove this subscription.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.fabric.remove_subscriber(&self.topic, self.id);
    }

    /// Whether this subscription is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The topic this subscription is bound to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Snapshot of backpressure state (spec §6 `getBackpressureStatus`).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BackpressureStatus {
    /// Whether the queue is currently at or above its effective max depth.
    pub active: bool,
    /// Current number of queued messages.
    pub queue_depth: usize,
    /// Effective max depth (base max times the enforcement factor).
    pub max_depth: usize,
    /// `queue_depth / max_depth` as a percentage.
    pub capacity_used_pct: f64,
}

/// Point-in-time fabric counters (spec §6 `getStats`).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    /// Total messages accepted by `publish`.
    pub published: u64,
    /// Total messages delivered to completion.
    pub delivered: u64,
    /// Messages dropped because their TTL elapsed.
    pub dropped_ttl: u64,
    /// Messages dropped after exhausting delivery attempts.
    pub dropped_max_attempts: u64,
    /// Publishes rejected due to backpressure.
    pub backpressure_rejections: u64,
}

type ResultHandler = Arc<dyn Fn(serde_json::Value) -> Result<(), String> + Send + Sync>;

struct QueueFabricInner {
    queue: Mutex<Vec<QueuedMessage>>,
    subscribers: DashMap<String, Vec<Subscriber>>,
    delivered_ids: Mutex<(HashSet<String>, VecDeque<String>)>,
    result_handlers: DashMap<String, ResultHandler>,
    next_sub_id: AtomicU64,
    base_max_queue_depth: AtomicUsize,
    backpressure_factor_pct: AtomicU64, // stored as fixed-point: pct * 1000
    max_delivery_attempts: AtomicU64,
    shutting_down: AtomicBool,
    stats: Mutex<QueueStats>,
}

impl QueueFabricInner {
    fn remove_subscriber(&self, topic: &str, id: u64) {
        if let Some(mut list) = self.subscribers.get_mut(topic) {
            list.retain(|s| s.id != id);
            let empty = list.is_empty();
            drop(list);
            if empty {
                self.subscribers.remove(topic);
            }
        }
    }

    fn effective_max_depth(&self) -> usize {
        let base = self.base_max_queue_depth.load(Ordering::Relaxed);
        let pct = self.backpressure_factor_pct.load(Ordering::Relaxed);
        ((base as u128 * pct as u128) / 100_000).max(1) as usize
    }

    fn insert_priority_sorted(queue: &mut Vec<QueuedMessage>, msg: QueuedMessage) {
        let pos = queue.iter().position(|m| m.priority < msg.priority);
        match pos {
            Some(i) => queue.insert(i, msg),
            None => queue.push(msg),
        }
    }
}

/// Component E: the Queue Fabric.
pub struct QueueFabric {
    inner: Arc<QueueFabricInner>,
}

impl Default for QueueFabric {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_DEPTH, DEFAULT_MAX_DELIVERY_ATTEMPTS)
    }
}

impl QueueFabric {
    /// Build a fabric with the given max queue depth and max delivery
    /// attempts.
    #[must_use]
    pub fn new(max_queue_depth: usize, max_delivery_attempts: u32) -> Self {
        Self {
            inner: Arc::new(QueueFabricInner {
                queue: Mutex::new(Vec::new()),
                subscribers: DashMap::new(),
                delivered_ids: Mutex::new((HashSet::new(), VecDeque::new())),
                result_handlers: DashMap::new(),
                next_sub_id: AtomicU64::new(1),
                base_max_queue_depth: AtomicUsize::new(max_queue_depth),
                backpressure_factor_pct: AtomicU64::new(100_000), // 100.000%
                max_delivery_attempts: AtomicU64::new(u64::from(max_delivery_attempts)),
                shutting_down: AtomicBool::new(false),
                stats: Mutex::new(QueueStats::default()),
            }),
        }
    }

    /// `publish(topic, payload, opts)`. Rejects with `Backpressure` when
    /// `queueDepth >= maxQueueDepth`; rejects with `ShuttingDown` after
    /// `shutdown()` has been called.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: serde_json::Value,
        opts: PublishOptions,
    ) -> Result<String, QueueError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.effective_max_depth() {
            self.inner.stats.lock().backpressure_rejections += 1;
            return Err(QueueError::Backpressure);
        }

        let now = now_ms();
        let ttl_ms = opts.ttl.unwrap_or(DEFAULT_TTL).as_millis() as u64;
        let msg = QueuedMessage {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload,
            priority: opts.priority.unwrap_or(0).min(10),
            delivery_semantics: opts.delivery_semantics.unwrap_or(DeliverySemantics::AtLeastOnce),
            ttl_ms,
            request_id: opts.request_id,
            published_at: now,
            attempt: 0,
            expires_at: now + ttl_ms,
        };
        let id = msg.id.clone();
        QueueFabricInner::insert_priority_sorted(&mut queue, msg);
        drop(queue);
        self.inner.stats.lock().published += 1;
        Ok(id)
    }

    /// `subscribe(topic, handler)`. Reference-counted: when the last
    /// subscription on a topic is dropped via `unsubscribe`, the topic
    /// entry is removed.
    pub fn subscribe(&self, topic: impl Into<String>, handler: SubscriberFn) -> Subscription {
        let topic = topic.into();
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));
        self.inner.subscribers.entry(topic.clone()).or_default().push(Subscriber {
            id,
            handler,
            active: active.clone(),
        });
        Subscription {
            topic,
            id,
            active,
            fabric: self.inner.clone(),
        }
    }

    /// `registerResultHandler(requestId, fn)`.
    pub fn register_result_handler(&self, request_id: impl Into<String>, handler: ResultHandler) {
        self.inner.result_handlers.insert(request_id.into(), handler);
    }

    /// `deliverResult(requestId, result)`. Invokes the registered handler
    /// once, then clears the mapping. Handler errors are logged, never
    /// propagated.
    pub fn deliver_result(&self, request_id: &str, result: serde_json::Value) {
        if let Some((_, handler)) = self.inner.result_handlers.remove(request_id) {
            if let Err(message) = handler(result) {
                tracing::warn!(request_id, error = %message, "result handler failed");
            }
        }
    }

    /// `getBackpressureStatus()`.
    #[must_use]
    pub fn backpressure_status(&self) -> BackpressureStatus {
        let depth = self.inner.queue.lock().len();
        let max = self.inner.effective_max_depth();
        BackpressureStatus {
            active: depth >= max,
            queue_depth: depth,
            max_depth: max,
            capacity_used_pct: (depth as f64 / max as f64) * 100.0,
        }
    }

    /// `enforceBackpressure(factor)`: multiplies the configured max depth by
    /// `factor` (clamped to `[0, 1]`).
    pub fn enforce_backpressure(&self, factor: f64) {
        let clamped = factor.clamp(0.0, 1.0);
        self.inner
            .backpressure_factor_pct
            .store((clamped * 100_000.0) as u64, Ordering::SeqCst);
    }

    /// `getStats()`.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        *self.inner.stats.lock()
    }

    /// Run a single dispatcher pass over the queue head (spec §4.E
    /// algorithm, steps 1-6). Exposed directly so tests can drive delivery
    /// deterministically instead of racing a background tick.
    pub async fn dispatch_once(&self) {
        let max_attempts = self.inner.max_delivery_attempts.load(Ordering::Relaxed) as u32;
        let now = now_ms();

        // Step 1: drop if expired.
        {
            let mut queue = self.inner.queue.lock();
            if let Some(head) = queue.first() {
                if head.is_expired(now) {
                    queue.remove(0);
                    self.inner.stats.lock().dropped_ttl += 1;
                    return;
                }
            } else {
                return;
            }
        }

        // Step 2: drop if exactly-once and already delivered.
        {
            let mut queue = self.inner.queue.lock();
            let Some(head) = queue.first() else { return };
            if head.delivery_semantics == DeliverySemantics::ExactlyOnce {
                let delivered = self.inner.delivered_ids.lock();
                if delivered.0.contains(&head.id) {
                    queue.remove(0);
                    return;
                }
            }
        }

        // Step 3: no subscribers -> leave head in place (open question §9:
        // the reference design relies on TTL expiry rather than per-topic
        // dispatch to resolve head-of-line blocking here).
        let topic = {
            let queue = self.inner.queue.lock();
            match queue.first() {
                Some(head) => head.topic.clone(),
                None => return,
            }
        };
        if !self.inner.subscribers.contains_key(&topic) {
            return;
        }

        // Steps 4-6: pop the head and attempt delivery outside the lock.
        let mut msg = {
            let mut queue = self.inner.queue.lock();
            if queue.is_empty() {
                return;
            }
            queue.remove(0)
        };

        let handlers: Vec<SubscriberFn> = self
            .inner
            .subscribers
            .get(&msg.topic)
            .map(|list| {
                list.iter()
                    .filter(|s| s.active.load(Ordering::SeqCst))
                    .map(|s| s.handler.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut any_failed = false;
        for handler in handlers {
            if let Err(err) = handler(msg.payload.clone()).await {
                tracing::warn!(message_id = %msg.id, error = %err, "subscriber delivery failed");
                any_failed = true;
            }
        }

        if any_failed {
            msg.attempt += 1;
            if msg.attempt >= max_attempts {
                tracing::error!(message_id = %msg.id, attempts = msg.attempt, "dropping message after max delivery attempts");
                self.inner.stats.lock().dropped_max_attempts += 1;
            } else {
                let mut queue = self.inner.queue.lock();
                QueueFabricInner::insert_priority_sorted(&mut queue, msg);
            }
            return;
        }

        self.inner.stats.lock().delivered += 1;
        if msg.delivery_semantics == DeliverySemantics::ExactlyOnce {
            let mut delivered = self.inner.delivered_ids.lock();
            delivered.0.insert(msg.id.clone());
            delivered.1.push_back(msg.id);
            if delivered.1.len() > DELIVERED_SET_CAP {
                for _ in 0..DELIVERED_SET_EVICT_BATCH {
                    if let Some(oldest) = delivered.1.pop_front() {
                        delivered.0.remove(&oldest);
                    }
                }
            }
        }
    }

    /// Spawn the background dispatcher task, ticking at [`DISPATCH_TICK`].
    pub fn spawn_dispatcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let fabric = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DISPATCH_TICK);
            loop {
                ticker.tick().await;
                if fabric.inner.shutting_down.load(Ordering::SeqCst) && fabric.inner.queue.lock().is_empty() {
                    return;
                }
                fabric.dispatch_once().await;
            }
        })
    }

    /// `shutdown()`. Refuses new publishes, drains up to a 1s deadline by
    /// pumping the dispatcher, then clears all state.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_DEADLINE;
        while tokio::time::Instant::now() < deadline {
            if self.inner.queue.lock().is_empty() {
                break;
            }
            self.dispatch_once().await;
        }
        self.inner.queue.lock().clear();
        self.inner.subscribers.clear();
        self.inner.result_handlers.clear();
        self.inner.delivered_ids.lock().0.clear();
        self.inner.delivered_ids.lock().1.clear();
    }
}

impl Clone for QueueFabric {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex as AsyncMutex;

    fn ok_handler() -> SubscriberFn {
        Arc::new(|_| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn s5_backpressure_rejects_third_publish_over_cap() {
        let fabric = QueueFabric::new(2, 3);
        fabric.publish("t", serde_json::json!({}), PublishOptions::default()).unwrap();
        fabric.publish("t", serde_json::json!({}), PublishOptions::default()).unwrap();
        let err = fabric
            .publish("t", serde_json::json!({}), PublishOptions::default())
            .unwrap_err();
        assert!(matches!(err, QueueError::Backpressure));
    }

    #[test]
    fn publish_after_shutdown_flag_rejects() {
        let fabric = QueueFabric::new(10, 3);
        fabric.inner.shutting_down.store(true, Ordering::SeqCst);
        let err = fabric
            .publish("t", serde_json::json!({}), PublishOptions::default())
            .unwrap_err();
        assert!(matches!(err, QueueError::ShuttingDown));
    }

    #[tokio::test]
    async fn s4_priority_ordering_delivers_highest_first() {
        let fabric = QueueFabric::new(100, 3);
        let order = Arc::new(AsyncMutex::new(Vec::new()));
        let order2 = order.clone();
        let handler: SubscriberFn = Arc::new(move |payload| {
            let order = order2.clone();
            Box::pin(async move {
                order.lock().await.push(payload["p"].as_u64().unwrap());
                Ok(())
            })
        });
        let _sub = fabric.subscribe("t", handler);

        fabric
            .publish("t", serde_json::json!({ "p": 1 }), PublishOptions { priority: Some(1), ..Default::default() })
            .unwrap();
        fabric
            .publish("t", serde_json::json!({ "p": 10 }), PublishOptions { priority: Some(10), ..Default::default() })
            .unwrap();
        fabric
            .publish("t", serde_json::json!({ "p": 5 }), PublishOptions { priority: Some(5), ..Default::default() })
            .unwrap();

        fabric.dispatch_once().await;
        fabric.dispatch_once().await;
        fabric.dispatch_once().await;

        assert_eq!(*order.lock().await, vec![10, 5, 1]);
    }

    #[tokio::test]
    async fn undelivered_head_without_subscribers_does_not_block_forever_once_subscribed() {
        let fabric = QueueFabric::new(10, 3);
        fabric.publish("lonely", serde_json::json!({}), PublishOptions::default()).unwrap();
        fabric.dispatch_once().await; // no subscribers yet: left in place
        assert_eq!(fabric.stats().delivered, 0);

        let _sub = fabric.subscribe("lonely", ok_handler());
        fabric.dispatch_once().await;
        assert_eq!(fabric.stats().delivered, 1);
    }

    #[tokio::test]
    async fn failed_delivery_retries_then_drops_after_max_attempts() {
        let fabric = QueueFabric::new(10, 2);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let handler: SubscriberFn = Arc::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err("boom".to_string()) })
        });
        let _sub = fabric.subscribe("t", handler);
        fabric.publish("t", serde_json::json!({}), PublishOptions::default()).unwrap();

        fabric.dispatch_once().await; // attempt 1 fails, requeued
        fabric.dispatch_once().await; // attempt 2 fails, attempt == max -> dropped

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(fabric.stats().dropped_max_attempts, 1);
    }

    #[tokio::test]
    async fn exactly_once_message_is_not_redelivered() {
        let fabric = QueueFabric::new(10, 3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let handler: SubscriberFn = Arc::new(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        });
        let _sub = fabric.subscribe("t", handler);
        fabric
            .publish(
                "t",
                serde_json::json!({}),
                PublishOptions { delivery_semantics: Some(DeliverySemantics::ExactlyOnce), ..Default::default() },
            )
            .unwrap();
        fabric.dispatch_once().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fabric.stats().delivered, 1);
    }

    #[test]
    fn result_delivery_invokes_handler_once_then_clears() {
        let fabric = QueueFabric::new(10, 3);
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        fabric.register_result_handler(
            "req-1",
            Arc::new(move |result| {
                *seen2.lock() = Some(result);
                Ok(())
            }),
        );
        fabric.deliver_result("req-1", serde_json::json!({ "ok": true }));
        assert_eq!(seen.lock().clone().unwrap()["ok"], true);
        // second delivery is a no-op: handler already cleared.
        fabric.deliver_result("req-1", serde_json::json!({ "ok": false }));
        assert_eq!(seen.lock().clone().unwrap()["ok"], true);
    }

    #[test]
    fn unsubscribe_removes_topic_entry_when_last_subscriber_leaves() {
        let fabric = QueueFabric::new(10, 3);
        let sub = fabric.subscribe("t", ok_handler());
        assert!(fabric.inner.subscribers.contains_key("t"));
        sub.unsubscribe();
        assert!(!fabric.inner.subscribers.contains_key("t"));
    }
}
