use async_trait::async_trait;
use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord, Producer},
    types::RDKafkaErrorCode,
    util::Timeout,
    Message, Offset, TopicPartitionList,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::transport::{BrokerChannel, BrokerError, BrokerTransport, Delivery, DeliveryTag, Subscription};

// ============================================================================
// Redpanda Transport (Kafka protocol via rdkafka)
// ============================================================================
//
// Queue → topic. Durable queues are replicated topics with unbounded
// retention; persistent publishes use an idempotent producer with acks=all.
// Consumers commit offsets manually, one delivery at a time, so an
// unacknowledged message is redelivered to the consumer group.
//
// librdkafka reconnects on its own underneath; connection loss is detected
// here with a metadata heartbeat so the supervisor can rebuild the channel.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RedpandaSettings {
    pub brokers: String,
    pub consumer_group: String,
    pub partitions: i32,
    pub replication_factor: i32,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl RedpandaSettings {
    pub fn new(brokers: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            consumer_group: consumer_group.into(),
            partitions: 1,
            replication_factor: 1,
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

pub struct RedpandaTransport {
    settings: RedpandaSettings,
}

impl RedpandaTransport {
    pub fn new(settings: RedpandaSettings) -> Self {
        Self { settings }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.settings.brokers)
            .set("socket.timeout.ms", self.settings.request_timeout.as_millis().to_string());
        config
    }
}

#[async_trait]
impl BrokerTransport for RedpandaTransport {
    fn name(&self) -> &'static str {
        "redpanda"
    }

    async fn open(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let producer: FutureProducer = self
            .client_config()
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BrokerError::Configuration(format!("Failed to create producer: {e}")))?;

        let admin: AdminClient<DefaultClientContext> = self
            .client_config()
            .create()
            .map_err(|e| BrokerError::Configuration(format!("Failed to create admin client: {e}")))?;

        // Producers connect lazily; fetch metadata to prove the cluster is reachable.
        fetch_metadata(&producer, self.settings.request_timeout)
            .await
            .map_err(BrokerError::Connect)?;

        tracing::info!(brokers = %self.settings.brokers, "Connected to Redpanda");

        let (closed, _) = watch::channel(false);
        Ok(Arc::new(RedpandaChannel {
            settings: self.settings.clone(),
            consumer_config: self.client_config(),
            producer,
            admin,
            open: AtomicBool::new(true),
            closed,
        }))
    }
}

async fn fetch_metadata(producer: &FutureProducer, timeout: Duration) -> Result<(), String> {
    let producer = producer.clone();
    tokio::task::spawn_blocking(move || {
        producer
            .client()
            .fetch_metadata(None, Timeout::After(timeout))
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| format!("metadata task failed: {e}"))?
}

pub struct RedpandaChannel {
    settings: RedpandaSettings,
    consumer_config: ClientConfig,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    open: AtomicBool,
    closed: watch::Sender<bool>,
}

impl RedpandaChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl BrokerChannel for RedpandaChannel {
    async fn assert_queue(&self, queue: &str, durable: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let (replication, retention) = if durable {
            (self.settings.replication_factor, "-1")
        } else {
            (1, "3600000")
        };
        let topic = NewTopic::new(queue, self.settings.partitions, TopicReplication::Fixed(replication))
            .set("retention.ms", retention);

        let results = self
            .admin
            .create_topics([&topic], &AdminOptions::new().request_timeout(Some(self.settings.request_timeout)))
            .await
            .map_err(|e| BrokerError::QueueAssert {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        for result in results {
            match result {
                Ok(_) => tracing::info!(queue = %queue, durable = durable, "Created topic"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((_, code)) => {
                    return Err(BrokerError::QueueAssert {
                        queue: queue.to_string(),
                        reason: code.to_string(),
                    })
                }
            }
        }

        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], persistent: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let headers = OwnedHeaders::new().insert(Header {
            key: "persistent",
            value: Some(if persistent { "true" } else { "false" }),
        });
        let record = FutureRecord::<(), [u8]>::to(queue)
            .payload(payload)
            .headers(headers);

        self.producer
            .send(record, Timeout::After(self.settings.request_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| BrokerError::Publish {
                queue: queue.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        self.ensure_open()?;

        let consumer: StreamConsumer = self
            .consumer_config
            .clone()
            .set("group.id", &self.settings.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .create()
            .map_err(|e| BrokerError::Subscribe {
                queue: queue.to_string(),
                reason: format!("Failed to create consumer: {e}"),
            })?;

        consumer.subscribe(&[queue]).map_err(|e| BrokerError::Subscribe {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            queue = %queue,
            consumer_group = %self.settings.consumer_group,
            manual_commit = true,
            "Subscribed to topic"
        );

        Ok(Box::new(RedpandaSubscription {
            consumer,
            closed: self.closed.subscribe(),
        }))
    }

    async fn closed(&self) {
        let mut closed_rx = self.closed.subscribe();
        loop {
            if !self.is_open() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.heartbeat_interval) => {
                    if let Err(error) = fetch_metadata(&self.producer, self.settings.request_timeout).await {
                        tracing::warn!(error = %error, "Redpanda heartbeat failed");
                        self.mark_closed();
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

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.mark_closed();

        let producer = self.producer.clone();
        let timeout = self.settings.request_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?
            .map_err(|e| BrokerError::Publish {
                queue: "*".to_string(),
                reason: format!("flush on close failed: {e}"),
            })
    }
}

struct RedpandaSubscription {
    consumer: StreamConsumer,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl Subscription for RedpandaSubscription {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            if *self.closed.borrow() {
                return None;
            }
            tokio::select! {
                received = self.consumer.recv() => {
                    return Some(match received {
                        Ok(message) => Ok(Delivery {
                            queue: message.topic().to_string(),
                            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                            tag: DeliveryTag {
                                partition: message.partition(),
                                offset: message.offset(),
                            },
                            redelivered: false,
                        }),
                        Err(e) => Err(BrokerError::Subscribe {
                            queue: "*".to_string(),
                            reason: e.to_string(),
                        }),
                    });
                }
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&delivery.queue, delivery.tag.partition, Offset::Offset(delivery.tag.offset + 1))
            .map_err(|e| BrokerError::Ack(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
