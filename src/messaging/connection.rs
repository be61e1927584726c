use futures_util::future::{BoxFuture, FutureExt};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use super::consumer::{self, ConsumerContext, DeadLetterSink, FailurePolicy, MessageHandler};
use super::transport::{BrokerChannel, BrokerError, BrokerTransport};
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

// ============================================================================
// Broker Connection Supervisor
// ============================================================================
//
// Owns the process' single broker channel. Responsibilities:
// - Connect with exponential backoff, bounded by `RetryConfig`
// - Watch the live channel and reconnect in the background when it drops
// - Durable publish (queue asserted once per channel, messages persistent)
// - Consumer registration; consumers are resumed after every reconnect
//
// While there is no open channel, `publish` and `consume` fail fast with
// `BrokerError::NotConnected` instead of waiting for the outage to end.
// Once the retry budget is exhausted the supervisor stays `Failed` until
// `connect()` is called again.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; waiting for a manual `connect()`.
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    /// Value exported on the connection state gauge.
    pub fn as_gauge(&self) -> i64 {
        match self {
            ConnectionState::Connected => 2,
            ConnectionState::Connecting => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Registration {
    queue: String,
    handler: Arc<dyn MessageHandler>,
}

struct LiveChannel {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

pub struct BrokerConnection {
    transport: Arc<dyn BrokerTransport>,
    retry: RetryConfig,
    context: Arc<ConsumerContext>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    live: RwLock<Option<LiveChannel>>,
    generation: Mutex<u64>,
    connect_lock: tokio::sync::Mutex<()>,
    asserted: Mutex<HashSet<String>>,
    registrations: Mutex<Vec<Arc<Registration>>>,
    consumer_tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrokerConnection {
    pub fn builder(transport: Arc<dyn BrokerTransport>) -> BrokerConnectionBuilder {
        BrokerConnectionBuilder {
            transport,
            retry: RetryConfig::broker_reconnect(),
            policy: FailurePolicy::default(),
            dead_letters: None,
            metrics: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Connect, retrying with exponential backoff.
    ///
    /// Returns `BrokerError::RetriesExhausted` once the budget is spent; the
    /// process keeps running and may call `connect()` again later.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BrokerError> {
        self.shutdown.send_replace(false);
        let _guard = self.connect_lock.lock().await;
        if self.current_channel().await.is_ok() {
            return Ok(());
        }
        self.establish().await
    }

    /// Publish a persistent message to a durable queue.
    pub async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.publish_with_durability(queue, payload, true).await
    }

    pub async fn publish_with_durability(&self, queue: &str, payload: &[u8], durable: bool) -> Result<(), BrokerError> {
        let channel = self.current_channel().await?;
        self.assert_queue(&channel, queue, durable).await?;
        channel.publish(queue, payload, durable).await?;

        tracing::debug!(queue = %queue, bytes = payload.len(), "Published message");
        Ok(())
    }

    /// Register `handler` for `queue`.
    ///
    /// The registration is kept even when this returns an error, so the
    /// consumer starts on the next successful (re)connect.
    pub async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<(), BrokerError> {
        let registration = Arc::new(Registration {
            queue: queue.to_string(),
            handler,
        });
        // Registered under the same guard `install` takes to publish a new
        // channel: either the next install resumes it or we start it here.
        let channel = {
            let live = self.live.read().await;
            lock(&self.registrations).push(registration.clone());
            match live.as_ref() {
                Some(live) if live.channel.is_open() => live.channel.clone(),
                _ => return Err(BrokerError::NotConnected),
            }
        };
        self.start_consumer(&channel, &registration).await
    }

    /// Release the channel and stop every consumer. No reconnect follows.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.shutdown.send_replace(true);
        self.stop_consumers();

        let live = self.live.write().await.take();
        self.set_state(ConnectionState::Closed);

        if let Some(live) = live {
            live.channel.close().await?;
        }
        tracing::info!(transport = self.transport.name(), "Broker connection closed");
        Ok(())
    }

    // ========================================================================
    // Supervision
    // ========================================================================

    async fn establish(self: &Arc<Self>) -> Result<(), BrokerError> {
        self.set_state(ConnectionState::Connecting);

        let transport = self.transport.clone();
        let metrics = self.context.metrics.clone();
        let attempts = retry_on_transient(&self.retry, |attempt| {
            let transport = transport.clone();
            let metrics = metrics.clone();
            async move {
                if let Some(metrics) = &metrics {
                    metrics.broker_connect_attempts.inc();
                }
                tracing::info!(attempt = attempt, transport = transport.name(), "Connecting to broker");
                transport.open().await
            }
        });

        let outcome = tokio::select! {
            outcome = attempts => outcome,
            _ = shutdown_requested(self.shutdown.subscribe()) => {
                self.set_state(ConnectionState::Closed);
                return Err(BrokerError::Closed);
            }
        };

        match outcome {
            RetryResult::Success(channel) => {
                if *self.shutdown.borrow() {
                    let _ = channel.close().await;
                    self.set_state(ConnectionState::Closed);
                    return Err(BrokerError::Closed);
                }
                self.install(channel).await;
                Ok(())
            }
            RetryResult::Failed(error) => {
                self.set_state(ConnectionState::Failed);
                tracing::error!(
                    attempts = self.retry.max_attempts,
                    error = %error,
                    "Giving up on broker connection, retrying stopped"
                );
                Err(BrokerError::RetriesExhausted {
                    attempts: self.retry.max_attempts,
                    last_error: error.to_string(),
                })
            }
            RetryResult::PermanentFailure(error) => {
                self.set_state(ConnectionState::Failed);
                tracing::error!(error = %error, "Broker connection failed permanently");
                Err(error)
            }
        }
    }

    async fn install(self: &Arc<Self>, channel: Arc<dyn BrokerChannel>) {
        let generation = {
            let mut generation = lock(&self.generation);
            *generation += 1;
            *generation
        };

        lock(&self.asserted).clear();
        let registrations = {
            let mut live = self.live.write().await;
            *live = Some(LiveChannel {
                generation,
                channel: channel.clone(),
            });
            lock(&self.registrations).clone()
        };
        self.set_state(ConnectionState::Connected);
        tracing::info!(transport = self.transport.name(), generation = generation, "Broker connected");

        self.spawn_watchdog(generation, channel.clone());

        for registration in registrations {
            if let Err(error) = self.start_consumer(&channel, &registration).await {
                tracing::error!(queue = %registration.queue, error = %error, "Failed to resume consumer");
            }
        }
    }

    fn spawn_watchdog(self: &Arc<Self>, generation: u64, channel: Arc<dyn BrokerChannel>) {
        let connection = Arc::downgrade(self);
        tokio::spawn(async move {
            channel.closed().await;
            drop(channel);
            reconnect(connection, generation).await;
        });
    }

    async fn on_channel_lost(self: Arc<Self>, generation: u64) {
        if *self.shutdown.borrow() {
            return;
        }
        {
            let mut live = self.live.write().await;
            match live.as_ref() {
                Some(current) if current.generation == generation => *live = None,
                _ => return,
            }
        }

        self.stop_consumers();
        self.set_state(ConnectionState::Disconnected);
        tracing::warn!(transport = self.transport.name(), "Broker connection lost, reconnecting");

        let _guard = self.connect_lock.lock().await;
        if self.current_channel().await.is_ok() || *self.shutdown.borrow() {
            return;
        }
        if let Err(error) = self.establish().await {
            tracing::error!(error = %error, "Broker reconnection failed");
        }
    }

    // ========================================================================
    // Channel Helpers
    // ========================================================================

    async fn current_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        match self.live.read().await.as_ref() {
            Some(live) if live.channel.is_open() => Ok(live.channel.clone()),
            _ => Err(BrokerError::NotConnected),
        }
    }

    async fn assert_queue(&self, channel: &Arc<dyn BrokerChannel>, queue: &str, durable: bool) -> Result<(), BrokerError> {
        if lock(&self.asserted).contains(queue) {
            return Ok(());
        }
        channel.assert_queue(queue, durable).await?;
        lock(&self.asserted).insert(queue.to_string());
        Ok(())
    }

    async fn start_consumer(&self, channel: &Arc<dyn BrokerChannel>, registration: &Registration) -> Result<(), BrokerError> {
        self.assert_queue(channel, &registration.queue, true).await?;
        let subscription = channel.subscribe(&registration.queue).await?;

        let task = tokio::spawn(consumer::run(
            registration.queue.clone(),
            registration.handler.clone(),
            channel.clone(),
            subscription,
            self.context.clone(),
        ));
        lock(&self.consumer_tasks).push(task);
        Ok(())
    }

    fn stop_consumers(&self) {
        for task in lock(&self.consumer_tasks).drain(..) {
            task.abort();
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Broker connection state changed");
        }
        if let Some(metrics) = &self.context.metrics {
            metrics.broker_connection_state.set(state.as_gauge());
        }
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.stop_consumers();
    }
}

// Boxed to keep the watchdog → reconnect → watchdog cycle out of the future type.
fn reconnect(connection: Weak<BrokerConnection>, generation: u64) -> BoxFuture<'static, ()> {
    async move {
        if let Some(connection) = connection.upgrade() {
            connection.on_channel_lost(generation).await;
        }
    }
    .boxed()
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct BrokerConnectionBuilder {
    transport: Arc<dyn BrokerTransport>,
    retry: RetryConfig,
    policy: FailurePolicy,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    metrics: Option<Arc<Metrics>>,
}

impl BrokerConnectionBuilder {
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Arc<BrokerConnection> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Arc::new(BrokerConnection {
            transport: self.transport,
            retry: self.retry,
            context: Arc::new(ConsumerContext {
                policy: self.policy,
                dead_letters: self.dead_letters,
                metrics: self.metrics,
            }),
            state,
            shutdown,
            live: RwLock::new(None),
            generation: Mutex::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            asserted: Mutex::new(HashSet::new()),
            registrations: Mutex::new(Vec::new()),
            consumer_tasks: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::consumer::HandlerError;
    use crate::messaging::memory::InMemoryBroker;
    use crate::messaging::transport::Delivery;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        }
    }

    fn connection(broker: &InMemoryBroker, max_attempts: u32) -> Arc<BrokerConnection> {
        BrokerConnection::builder(Arc::new(broker.clone()))
            .retry(fast_retry(max_attempts))
            .build()
    }

    struct Forward(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
            let _ = self.0.send(delivery.payload.clone());
            Ok(())
        }
    }

    async fn wait_for_state(connection: &BrokerConnection, wanted: ConnectionState) {
        let mut state = connection.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == wanted))
            .await
            .expect("timed out waiting for connection state")
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_asserts_durable_queue() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker, 3);
        connection.connect().await.unwrap();

        connection.publish("order.created", b"{}").await.unwrap();

        assert_eq!(broker.is_durable("order.created"), Some(true));
        assert!(broker.all_persistent("order.created"));
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_publish_and_consume_round_trip() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker, 3);
        connection.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.consume("work", Arc::new(Forward(tx))).await.unwrap();
        connection.publish("work", b"hello").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(received, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_connect_retries_until_broker_is_back() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let connection = connection(&broker, 10);

        let restore = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                broker.set_available(true);
            })
        };

        connection.connect().await.unwrap();
        restore.await.unwrap();

        assert!(broker.connect_attempts() > 1);
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let connection = connection(&broker, 4);

        let result = connection.connect().await;

        assert!(matches!(result, Err(BrokerError::RetriesExhausted { attempts: 4, .. })));
        assert_eq!(broker.connect_attempts(), 4);
        assert_eq!(connection.state(), ConnectionState::Failed);

        // No background retrying once the budget is spent.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.connect_attempts(), 4);

        broker.set_available(true);
        connection.connect().await.unwrap();
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_publish_fails_fast_while_disconnected() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker, 3);

        assert!(matches!(connection.publish("q", b"x").await, Err(BrokerError::NotConnected)));

        connection.connect().await.unwrap();
        broker.set_available(false);
        broker.disconnect();

        let started = std::time::Instant::now();
        assert!(matches!(connection.publish("q", b"x").await, Err(BrokerError::NotConnected)));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_reconnect_restores_publish_and_consume() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker, 10);
        connection.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.consume("work", Arc::new(Forward(tx))).await.unwrap();

        broker.outage();
        wait_for_state(&connection, ConnectionState::Connecting).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.set_available(true);
        wait_for_state(&connection, ConnectionState::Connected).await;

        connection.publish("work", b"after-outage").await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(received, Some(b"after-outage".to_vec()));
    }

    #[tokio::test]
    async fn test_reconnect_stops_after_retry_budget() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker, 3);
        connection.connect().await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);

        broker.outage();
        wait_for_state(&connection, ConnectionState::Failed).await;

        assert_eq!(broker.connect_attempts(), 1 + 3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.connect_attempts(), 1 + 3);
    }

    #[tokio::test]
    async fn test_consume_registered_while_down_starts_after_connect() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker, 3);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = connection.consume("work", Arc::new(Forward(tx))).await;
        assert!(matches!(result, Err(BrokerError::NotConnected)));

        connection.connect().await.unwrap();
        connection.publish("work", b"late").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(received, Some(b"late".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_consume_racing_connect_starts_one_consumer() {
        for _ in 0..50 {
            let broker = InMemoryBroker::new();
            let connection = connection(&broker, 3);
            let (tx, _rx) = mpsc::unbounded_channel();

            let connecting = tokio::spawn({
                let connection = connection.clone();
                async move { connection.connect().await }
            });
            let consuming = tokio::spawn({
                let connection = connection.clone();
                async move { connection.consume("work", Arc::new(Forward(tx))).await }
            });
            connecting.await.unwrap().unwrap();
            let _ = consuming.await.unwrap();

            assert_eq!(lock(&connection.registrations).len(), 1);
            assert_eq!(lock(&connection.consumer_tasks).len(), 1);
        }
    }

    #[tokio::test]
    async fn test_close_releases_channel_without_reconnecting() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker, 3);
        connection.connect().await.unwrap();

        connection.close().await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(matches!(connection.publish("q", b"x").await, Err(BrokerError::NotConnected)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.connect_attempts(), 1);
    }
}
