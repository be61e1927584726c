use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};

use super::transport::{BrokerChannel, BrokerError, BrokerTransport, Delivery, DeliveryTag, Subscription};

// ============================================================================
// In-Memory Broker
// ============================================================================
//
// Process-local broker with durable queues, competing consumers and manual
// acknowledgement. Unacknowledged messages go back to the head of their
// queue when the connection drops. Faults can be injected with
// `set_available` and `disconnect`.
//
// ============================================================================

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerState>,
}

struct BrokerState {
    available: AtomicBool,
    connect_attempts: AtomicU32,
    generation: watch::Sender<u64>,
    queues: Mutex<HashMap<String, MemoryQueue>>,
}

struct MemoryQueue {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<i64, StoredMessage>,
    next_offset: i64,
    notify: Arc<Notify>,
}

#[derive(Clone)]
struct StoredMessage {
    offset: i64,
    payload: Vec<u8>,
    persistent: bool,
    redelivered: bool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(BrokerState {
                available: AtomicBool::new(true),
                connect_attempts: AtomicU32::new(0),
                generation,
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// While unavailable, every connection attempt is refused.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Drop every open connection, returning unacked messages to their queues.
    pub fn disconnect(&self) {
        {
            let mut queues = self.inner.lock_queues();
            for queue in queues.values_mut() {
                let mut pending: Vec<StoredMessage> = queue.unacked.drain().map(|(_, m)| m).collect();
                pending.sort_by_key(|m| std::cmp::Reverse(m.offset));
                for mut message in pending {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
        self.inner.generation.send_modify(|generation| *generation += 1);
        tracing::warn!("In-memory broker dropped all connections");
    }

    /// Simulate a broker outage: refuse new connections and drop open ones.
    pub fn outage(&self) {
        self.set_available(false);
        self.disconnect();
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.lock_queues().contains_key(queue)
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.inner.lock_queues().get(queue).map(|q| q.durable)
    }

    /// Ready plus unacknowledged messages.
    pub fn depth(&self, queue: &str) -> usize {
        self.inner
            .lock_queues()
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    /// Payloads waiting in `queue`, oldest first, without consuming them.
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock_queues()
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether every message still held in `queue` was published as persistent.
    pub fn all_persistent(&self, queue: &str) -> bool {
        self.inner
            .lock_queues()
            .get(queue)
            .map(|q| q.ready.iter().chain(q.unacked.values()).all(|m| m.persistent))
            .unwrap_or(true)
    }

    /// Remove and return every ready payload, as an external consumer would.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock_queues()
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|m| m.payload).collect())
            .unwrap_or_default()
    }

    /// Publish from outside the service, e.g. as the inventory service would.
    pub fn inject(&self, queue: &str, payload: &[u8]) {
        let mut queues = self.inner.lock_queues();
        let queue = queues
            .entry(queue.to_string())
            .or_insert_with(|| MemoryQueue::new(true));
        queue.push(payload.to_vec(), true);
    }
}

impl BrokerState {
    fn lock_queues(&self) -> MutexGuard<'_, HashMap<String, MemoryQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }
}

impl MemoryQueue {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            next_offset: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&mut self, payload: Vec<u8>, persistent: bool) {
        let offset = self.next_offset;
        self.next_offset += 1;
        self.ready.push_back(StoredMessage {
            offset,
            payload,
            persistent,
            redelivered: false,
        });
        self.notify.notify_one();
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect("in-memory broker is unavailable".to_string()));
        }

        let (closed, _) = watch::channel(false);
        Ok(Arc::new(MemoryChannel {
            state: Arc::new(ChannelState {
                broker: self.inner.clone(),
                generation: self.inner.current_generation(),
                closed,
            }),
        }))
    }
}

struct ChannelState {
    broker: Arc<BrokerState>,
    generation: u64,
    closed: watch::Sender<bool>,
}

impl ChannelState {
    fn is_open(&self) -> bool {
        !*self.closed.borrow() && self.broker.current_generation() == self.generation
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    async fn wait_closed(&self) {
        let mut generation_rx = self.broker.generation.subscribe();
        let mut closed_rx = self.closed.subscribe();
        loop {
            if !self.is_open() {
                return;
            }
            tokio::select! {
                changed = generation_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = closed_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

pub struct MemoryChannel {
    state: Arc<ChannelState>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_queue(&self, queue: &str, durable: bool) -> Result<(), BrokerError> {
        self.state.ensure_open()?;

        let mut queues = self.state.broker.lock_queues();
        match queues.get(queue) {
            Some(existing) if existing.durable != durable => Err(BrokerError::QueueAssert {
                queue: queue.to_string(),
                reason: format!("queue exists with durable={}", existing.durable),
            }),
            Some(_) => Ok(()),
            None => {
                queues.insert(queue.to_string(), MemoryQueue::new(durable));
                Ok(())
            }
        }
    }

    async fn publish(&self, queue: &str, payload: &[u8], persistent: bool) -> Result<(), BrokerError> {
        self.state.ensure_open()?;

        let mut queues = self.state.broker.lock_queues();
        let target = queues.get_mut(queue).ok_or_else(|| BrokerError::Publish {
            queue: queue.to_string(),
            reason: "queue does not exist".to_string(),
        })?;
        target.push(payload.to_vec(), persistent);
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        self.state.ensure_open()?;

        if !self.state.broker.lock_queues().contains_key(queue) {
            return Err(BrokerError::Subscribe {
                queue: queue.to_string(),
                reason: "queue does not exist".to_string(),
            });
        }

        Ok(Box::new(MemorySubscription {
            state: self.state.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn closed(&self) {
        self.state.wait_closed().await;
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.closed.send_replace(true);
        Ok(())
    }
}

struct MemorySubscription {
    state: Arc<ChannelState>,
    queue: String,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            if !self.state.is_open() {
                return None;
            }

            let notify = {
                let mut queues = self.state.broker.lock_queues();
                let queue = queues.get_mut(&self.queue)?;
                if let Some(message) = queue.ready.pop_front() {
                    queue.unacked.insert(message.offset, message.clone());
                    return Some(Ok(Delivery {
                        queue: self.queue.clone(),
                        payload: message.payload,
                        tag: DeliveryTag {
                            partition: 0,
                            offset: message.offset,
                        },
                        redelivered: message.redelivered,
                    }));
                }
                queue.notify.clone()
            };

            let state = self.state.clone();
            tokio::select! {
                _ = notify.notified() => {}
                _ = state.wait_closed() => return None,
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.state.ensure_open()?;

        let mut queues = self.state.broker.lock_queues();
        let queue = queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| BrokerError::Ack(format!("unknown queue {}", delivery.queue)))?;
        queue
            .unacked
            .remove(&delivery.tag.offset)
            .map(|_| ())
            .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {}", delivery.tag.offset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_requires_asserted_queue() {
        let broker = InMemoryBroker::new();
        let channel = broker.open().await.unwrap();

        assert!(channel.publish("orders", b"x", true).await.is_err());
        channel.assert_queue("orders", true).await.unwrap();
        channel.publish("orders", b"x", true).await.unwrap();

        assert_eq!(broker.depth("orders"), 1);
        assert!(broker.all_persistent("orders"));
    }

    #[tokio::test]
    async fn test_durability_mismatch_is_rejected() {
        let broker = InMemoryBroker::new();
        let channel = broker.open().await.unwrap();

        channel.assert_queue("orders", true).await.unwrap();
        assert!(matches!(
            channel.assert_queue("orders", false).await,
            Err(BrokerError::QueueAssert { .. })
        ));
    }

    #[tokio::test]
    async fn test_unacked_messages_are_redelivered_after_disconnect() {
        let broker = InMemoryBroker::new();
        let channel = broker.open().await.unwrap();
        channel.assert_queue("orders", true).await.unwrap();
        channel.publish("orders", b"first", true).await.unwrap();

        let mut subscription = channel.subscribe("orders").await.unwrap();
        let delivery = subscription.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"first");
        assert!(!delivery.redelivered);

        broker.disconnect();
        assert!(!channel.is_open());
        assert!(subscription.next().await.is_none());

        let channel = broker.open().await.unwrap();
        let mut subscription = channel.subscribe("orders").await.unwrap();
        let delivery = subscription.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"first");
        assert!(delivery.redelivered);

        subscription.ack(&delivery).await.unwrap();
        assert_eq!(broker.depth("orders"), 0);
    }

    #[tokio::test]
    async fn test_closed_resolves_on_disconnect() {
        let broker = InMemoryBroker::new();
        let channel = broker.open().await.unwrap();

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.closed().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.disconnect();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);

        assert!(matches!(broker.open().await, Err(BrokerError::Connect(_))));
        assert_eq!(broker.connect_attempts(), 1);
    }
}
