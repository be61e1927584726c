use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::transport::{BrokerChannel, Delivery, Subscription};
use crate::metrics::Metrics;

// ============================================================================
// Consumer Task
// ============================================================================
//
// One task per registered queue. For each delivery the handler is invoked
// and its outcome is turned into an explicit `Disposition`; the task, never
// the handler, settles the message with the broker. A failing or panicking
// handler does not stop the loop.
//
// ============================================================================

/// Handler for messages arriving on a queue.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// The message body does not match the expected schema. Never retried.
    #[error("Message does not match the expected schema: {0}")]
    Schema(String),

    #[error("Message processing failed: {0}")]
    Processing(String),
}

/// What happens to a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Acknowledge and park a copy in the dead-letter queue.
    #[default]
    DeadLetter,
    /// Republish to the tail of the same queue, then acknowledge.
    Requeue,
}

impl FailurePolicy {
    pub fn disposition_for(&self, outcome: &Result<(), HandlerError>) -> Disposition {
        match (outcome, self) {
            (Ok(()), _) => Disposition::Ack,
            (Err(HandlerError::Schema(_)), _) => Disposition::DeadLetter,
            (Err(HandlerError::Processing(_)), FailurePolicy::DeadLetter) => Disposition::DeadLetter,
            (Err(HandlerError::Processing(_)), FailurePolicy::Requeue) => Disposition::Requeue,
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dead-letter" | "dead_letter" | "dlq" => Ok(FailurePolicy::DeadLetter),
            "requeue" => Ok(FailurePolicy::Requeue),
            other => Err(format!("unknown consumer failure policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Requeue => "requeue",
            Disposition::DeadLetter => "dead_letter",
        }
    }
}

// ============================================================================
// Dead Letters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterOrigin {
    /// A consumed message whose handler failed.
    Consume,
    /// A domain event that could not be published after its state change committed.
    Publish,
}

impl DeadLetterOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterOrigin::Consume => "consume",
            DeadLetterOrigin::Publish => "publish",
        }
    }
}

impl fmt::Display for DeadLetterOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub origin: DeadLetterOrigin,
    pub queue: String,
    pub payload: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(origin: DeadLetterOrigin, queue: impl Into<String>, payload: &[u8], error: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            origin,
            queue: queue.into(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Destination for messages nobody could process.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn park(&self, letter: DeadLetter);
}

// ============================================================================
// Consumer Loop
// ============================================================================

/// Pause before a failed message goes back to its queue.
const REQUEUE_DELAY: Duration = Duration::from_millis(20);

pub(crate) struct ConsumerContext {
    pub policy: FailurePolicy,
    pub dead_letters: Option<Arc<dyn DeadLetterSink>>,
    pub metrics: Option<Arc<Metrics>>,
}

/// Drive `subscription` until its channel goes away.
pub(crate) async fn run(
    queue: String,
    handler: Arc<dyn MessageHandler>,
    channel: Arc<dyn BrokerChannel>,
    mut subscription: Box<dyn Subscription>,
    context: Arc<ConsumerContext>,
) {
    tracing::info!(queue = %queue, "Consumer started");

    while let Some(next) = subscription.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(error) => {
                tracing::warn!(queue = %queue, error = %error, "Failed to receive message");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        tracing::debug!(
            queue = %queue,
            offset = delivery.tag.offset,
            redelivered = delivery.redelivered,
            "Received message"
        );

        let started = Instant::now();
        let outcome = AssertUnwindSafe(handler.handle(&delivery))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Processing(panic_message(panic.as_ref()))));

        let disposition = context.policy.disposition_for(&outcome);
        if let Some(metrics) = &context.metrics {
            metrics.record_message_consumed(&queue, disposition, started.elapsed().as_secs_f64());
        }

        match (&outcome, disposition) {
            (Ok(()), _) => {}
            (Err(error), Disposition::Requeue) => {
                tracing::warn!(queue = %queue, error = %error, "Handler failed, requeueing message");
                tokio::time::sleep(REQUEUE_DELAY).await;
                if let Err(publish_error) = channel.publish(&queue, &delivery.payload, true).await {
                    // Leave it unacknowledged; the broker redelivers it after reconnect.
                    tracing::error!(
                        queue = %queue,
                        error = %publish_error,
                        "Failed to requeue message, leaving it unacknowledged"
                    );
                    continue;
                }
            }
            (Err(error), _) => {
                tracing::error!(queue = %queue, error = %error, "Handler failed, dead-lettering message");
                park(&context, DeadLetter::new(DeadLetterOrigin::Consume, &queue, &delivery.payload, error.to_string())).await;
            }
        }

        if let Err(error) = subscription.ack(&delivery).await {
            tracing::warn!(queue = %queue, error = %error, "Failed to acknowledge message");
        }
    }

    tracing::info!(queue = %queue, "Consumer stopped");
}

pub(crate) async fn park(context: &ConsumerContext, letter: DeadLetter) {
    if let Some(metrics) = &context.metrics {
        metrics.record_dead_letter(letter.origin.as_str());
    }
    match &context.dead_letters {
        Some(sink) => sink.park(letter).await,
        None => tracing::error!(
            queue = %letter.queue,
            payload = %letter.payload,
            "No dead-letter sink configured, dropping message"
        ),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::messaging::memory::InMemoryBroker;
    use crate::messaging::transport::BrokerTransport;
    use std::sync::Mutex;

    /// Keeps every parked letter for inspection.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub letters: Mutex<Vec<DeadLetter>>,
    }

    impl RecordingSink {
        pub fn parked(&self) -> Vec<DeadLetter> {
            self.letters.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn park(&self, letter: DeadLetter) {
            self.letters.lock().unwrap().push(letter);
        }
    }

    struct ScriptedHandler {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
            let body = String::from_utf8_lossy(&delivery.payload).into_owned();
            self.seen.lock().unwrap().push(body.clone());
            match body.as_str() {
                "bad-schema" => Err(HandlerError::Schema("no data".into())),
                "fail" => Err(HandlerError::Processing("store down".into())),
                "panic" => panic!("boom"),
                _ => Ok(()),
            }
        }
    }

    async fn run_until_idle(policy: FailurePolicy, messages: &[&str]) -> (InMemoryBroker, Arc<RecordingSink>, Vec<String>) {
        let broker = InMemoryBroker::new();
        let channel = broker.open().await.unwrap();
        channel.assert_queue("work", true).await.unwrap();
        for message in messages {
            channel.publish("work", message.as_bytes(), true).await.unwrap();
        }

        let sink = Arc::new(RecordingSink::default());
        let handler = Arc::new(ScriptedHandler { seen: Mutex::new(Vec::new()) });
        let context = Arc::new(ConsumerContext {
            policy,
            dead_letters: Some(sink.clone()),
            metrics: None,
        });

        let subscription = channel.subscribe("work").await.unwrap();
        let task = tokio::spawn(run("work".into(), handler.clone(), channel.clone(), subscription, context));

        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.close().await.unwrap();
        task.await.unwrap();

        let seen = handler.seen.lock().unwrap().clone();
        (broker, sink, seen)
    }

    #[test]
    fn test_disposition_table() {
        let schema = Err(HandlerError::Schema("x".into()));
        let processing = Err(HandlerError::Processing("x".into()));

        assert_eq!(FailurePolicy::DeadLetter.disposition_for(&Ok(())), Disposition::Ack);
        assert_eq!(FailurePolicy::Requeue.disposition_for(&Ok(())), Disposition::Ack);
        assert_eq!(FailurePolicy::Requeue.disposition_for(&schema), Disposition::DeadLetter);
        assert_eq!(FailurePolicy::DeadLetter.disposition_for(&processing), Disposition::DeadLetter);
        assert_eq!(FailurePolicy::Requeue.disposition_for(&processing), Disposition::Requeue);
    }

    #[test]
    fn test_parse_failure_policy() {
        assert_eq!("dead-letter".parse::<FailurePolicy>().unwrap(), FailurePolicy::DeadLetter);
        assert_eq!("REQUEUE".parse::<FailurePolicy>().unwrap(), FailurePolicy::Requeue);
        assert!("drop".parse::<FailurePolicy>().is_err());
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_loop() {
        let (broker, sink, seen) =
            run_until_idle(FailurePolicy::DeadLetter, &["ok-1", "fail", "panic", "bad-schema", "ok-2"]).await;

        assert_eq!(seen, vec!["ok-1", "fail", "panic", "bad-schema", "ok-2"]);
        assert_eq!(broker.depth("work"), 0);

        let parked = sink.parked();
        assert_eq!(parked.len(), 3);
        assert!(parked.iter().all(|l| l.origin == DeadLetterOrigin::Consume && l.queue == "work"));
        assert!(parked[1].error.contains("handler panicked: boom"));
    }

    #[tokio::test]
    async fn test_requeue_policy_republishes_processing_failures() {
        let broker = InMemoryBroker::new();
        let channel = broker.open().await.unwrap();
        channel.assert_queue("work", true).await.unwrap();
        channel.publish("work", b"bad-schema", true).await.unwrap();
        channel.publish("work", b"fail", true).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let handler = Arc::new(ScriptedHandler { seen: Mutex::new(Vec::new()) });
        let context = Arc::new(ConsumerContext {
            policy: FailurePolicy::Requeue,
            dead_letters: Some(sink.clone()),
            metrics: None,
        });

        let subscription = channel.subscribe("work").await.unwrap();
        let task = tokio::spawn(run("work".into(), handler.clone(), channel.clone(), subscription, context));

        // "fail" keeps coming back until the consumer stops.
        tokio::time::sleep(Duration::from_millis(200)).await;
        channel.close().await.unwrap();
        task.await.unwrap();

        let seen = handler.seen.lock().unwrap().clone();
        assert!(seen.iter().filter(|m| m.as_str() == "fail").count() >= 2);
        assert_eq!(sink.parked().len(), 1);
        assert_eq!(sink.parked()[0].payload, "bad-schema");
        assert_eq!(broker.depth("work"), 1);
    }
}
