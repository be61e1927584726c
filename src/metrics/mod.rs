// Private module declaration
mod server;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::messaging::Disposition;

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Covers:
// - Order lifecycle (creations, status transitions)
// - Event publication outcomes per event type
// - Broker connection state and reconnect attempts
// - Consumed messages, handler latency and settlement outcome
// - Dead letters and swallowed notification failures
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

/// Central metrics registry for the service
pub struct Metrics {
    registry: Registry,

    // Order Lifecycle
    pub orders_created: IntCounter,
    pub status_transitions: IntCounterVec,
    pub compensations: IntCounterVec,

    // Events
    pub events_published: IntCounterVec,
    pub events_failed: IntCounterVec,

    // Broker
    pub broker_connect_attempts: IntCounter,
    pub broker_connection_state: IntGauge,
    pub messages_consumed: IntCounterVec,
    pub message_handling_duration: HistogramVec,

    // Failures
    pub dead_letters: IntCounterVec,
    pub notification_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let orders_created = IntCounter::new("orders_created_total", "Total orders created")?;
        registry.register(Box::new(orders_created.clone()))?;

        let status_transitions = IntCounterVec::new(
            Opts::new("order_status_transitions_total", "Order status transitions"),
            &["from", "to"],
        )?;
        registry.register(Box::new(status_transitions.clone()))?;

        let compensations = IntCounterVec::new(
            Opts::new("order_compensations_total", "Stock-failure compensation outcomes"),
            &["outcome"],
        )?;
        registry.register(Box::new(compensations.clone()))?;

        let events_published = IntCounterVec::new(
            Opts::new("events_published_total", "Domain events published"),
            &["event"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let events_failed = IntCounterVec::new(
            Opts::new("events_failed_total", "Domain events that failed to publish"),
            &["event"],
        )?;
        registry.register(Box::new(events_failed.clone()))?;

        let broker_connect_attempts = IntCounter::new(
            "broker_connect_attempts_total",
            "Broker connection attempts, including reconnects",
        )?;
        registry.register(Box::new(broker_connect_attempts.clone()))?;

        let broker_connection_state = IntGauge::new(
            "broker_connection_state",
            "Broker connection state (0=Down, 1=Connecting, 2=Connected)",
        )?;
        registry.register(Box::new(broker_connection_state.clone()))?;

        let messages_consumed = IntCounterVec::new(
            Opts::new("messages_consumed_total", "Messages consumed by outcome"),
            &["queue", "outcome"],
        )?;
        registry.register(Box::new(messages_consumed.clone()))?;

        let message_handling_duration = HistogramVec::new(
            HistogramOpts::new("message_handling_duration_seconds", "Message handler duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["queue"],
        )?;
        registry.register(Box::new(message_handling_duration.clone()))?;

        let dead_letters = IntCounterVec::new(
            Opts::new("dead_letters_total", "Messages parked in the dead letter queue"),
            &["origin"],
        )?;
        registry.register(Box::new(dead_letters.clone()))?;

        let notification_failures = IntCounterVec::new(
            Opts::new("notification_failures_total", "Notifications that failed and were ignored"),
            &["kind"],
        )?;
        registry.register(Box::new(notification_failures.clone()))?;

        Ok(Self {
            registry,
            orders_created,
            status_transitions,
            compensations,
            events_published,
            events_failed,
            broker_connect_attempts,
            broker_connection_state,
            messages_consumed,
            message_handling_duration,
            dead_letters,
            notification_failures,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_status_transition(&self, from: &str, to: &str) {
        self.status_transitions.with_label_values(&[from, to]).inc();
    }

    pub fn record_compensation(&self, outcome: &str) {
        self.compensations.with_label_values(&[outcome]).inc();
    }

    pub fn record_event_published(&self, event: &str, success: bool) {
        if success {
            self.events_published.with_label_values(&[event]).inc();
        } else {
            self.events_failed.with_label_values(&[event]).inc();
        }
    }

    pub fn record_message_consumed(&self, queue: &str, disposition: Disposition, duration_secs: f64) {
        self.messages_consumed
            .with_label_values(&[queue, disposition.as_str()])
            .inc();
        self.message_handling_duration
            .with_label_values(&[queue])
            .observe(duration_secs);
    }

    pub fn record_dead_letter(&self, origin: &str) {
        self.dead_letters.with_label_values(&[origin]).inc();
    }

    pub fn record_notification_failure(&self, kind: &str) {
        self.notification_failures.with_label_values(&[kind]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(metrics: &Metrics, name: &str) -> Vec<f64> {
        metrics
            .registry
            .gather()
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.metric.iter().filter_map(|x| x.counter.value).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.orders_created.inc();
        assert!(!metrics.registry().gather().is_empty());
        assert_eq!(counter_value(&metrics, "orders_created_total"), vec![1.0]);
    }

    #[test]
    fn test_record_event_outcomes() {
        let metrics = Metrics::new().unwrap();
        metrics.record_event_published("order.created", true);
        metrics.record_event_published("order.created", true);
        metrics.record_event_published("order.shipped", false);

        assert_eq!(counter_value(&metrics, "events_published_total"), vec![2.0]);
        assert_eq!(counter_value(&metrics, "events_failed_total"), vec![1.0]);
    }

    #[test]
    fn test_record_consumed_by_outcome() {
        let metrics = Metrics::new().unwrap();
        metrics.record_message_consumed("order.failed.stock", Disposition::Ack, 0.01);
        metrics.record_message_consumed("order.failed.stock", Disposition::DeadLetter, 0.02);

        assert_eq!(counter_value(&metrics, "messages_consumed_total").len(), 2);
    }

    #[test]
    fn test_connection_state_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.broker_connection_state.set(2);

        let gathered = metrics.registry.gather();
        let state = gathered.iter().find(|m| m.name() == "broker_connection_state").unwrap();
        assert_eq!(state.metric[0].gauge.value, Some(2.0));
    }
}
