use chrono::Utc;
use kameo::actor::ActorRef;
use kameo::error::Infallible;
use kameo::message::{Context, Message};
use kameo::reply::{Reply, ReplyError};
use kameo::Actor;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use uuid::Uuid;

use super::dlq::{CheckDlqHealth, DlqActor};
use crate::actors::core::{ComponentHealth, HealthStatus};
use crate::messaging::{BrokerConnection, ConnectionState};
use crate::store::OrderStore;

// ============================================================================
// Health Monitor Actor - Monitors system health
// ============================================================================
//
// Responsibilities:
// - Poll the broker connection, the order store and the dead letter queue
// - Aggregate component health into a system-wide status
// - Drive the gRPC health service (SERVING only while the broker is up)
//
// ============================================================================

pub const BROKER_COMPONENT: &str = "broker";
pub const STORE_COMPONENT: &str = "order_store";

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub struct UpdateHealth {
    pub component: String,
    pub status: HealthStatus,
    pub details: Option<String>,
}

#[derive(Debug)]
pub struct GetSystemHealth;

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub check_time: chrono::DateTime<Utc>,
}

// Implement Reply for SystemHealth to use it as a message reply type
impl Reply for SystemHealth {
    type Ok = Self;
    type Error = Infallible;
    type Value = Self;

    fn to_result(self) -> Result<Self, Infallible> {
        Ok(self)
    }

    fn into_any_err(self) -> Option<Box<dyn ReplyError>> {
        None
    }

    fn into_value(self) -> Self::Value {
        self
    }
}

// ============================================================================
// Health Monitor Actor
// ============================================================================

pub struct HealthMonitorActor {
    components: HashMap<String, ComponentHealth>,
    broker: Option<Arc<BrokerConnection>>,
    store: Option<Arc<dyn OrderStore>>,
    dlq: Option<ActorRef<DlqActor>>,
    reporter: Option<(HealthReporter, &'static str)>,
    interval: Duration,
}

impl HealthMonitorActor {
    pub fn new(broker: Arc<BrokerConnection>) -> Self {
        Self {
            components: HashMap::new(),
            broker: Some(broker),
            store: None,
            dlq: None,
            reporter: None,
            interval: Duration::from_secs(10),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn OrderStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_dlq(mut self, dlq: ActorRef<DlqActor>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Report `service` through the gRPC health service.
    pub fn with_reporter(mut self, reporter: HealthReporter, service: &'static str) -> Self {
        self.reporter = Some((reporter, service));
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn compute_overall_status(&self) -> HealthStatus {
        let mut has_degraded = false;
        let mut unhealthy_components = Vec::new();

        for (name, health) in &self.components {
            match &health.status {
                HealthStatus::Unhealthy(msg) => {
                    unhealthy_components.push(format!("{}: {}", name, msg));
                }
                HealthStatus::Degraded(_) => {
                    has_degraded = true;
                }
                HealthStatus::Healthy => {}
            }
        }

        if !unhealthy_components.is_empty() {
            unhealthy_components.sort();
            HealthStatus::Unhealthy(unhealthy_components.join(", "))
        } else if has_degraded {
            HealthStatus::Degraded("Some components degraded".to_string())
        } else {
            HealthStatus::Healthy
        }
    }
}

pub fn broker_health(state: ConnectionState) -> HealthStatus {
    match state {
        ConnectionState::Connected => HealthStatus::Healthy,
        ConnectionState::Connecting => HealthStatus::Degraded("Reconnecting to broker".to_string()),
        other => HealthStatus::Unhealthy(format!("Broker connection {other}")),
    }
}

async fn probe_store(store: &dyn OrderStore) -> HealthStatus {
    match store.find_by_id(Uuid::nil(), false).await {
        Ok(_) => HealthStatus::Healthy,
        Err(e) => HealthStatus::Unhealthy(e.to_string()),
    }
}

impl Actor for HealthMonitorActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(state: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!("HealthMonitorActor started");

        // Clone what we need for the periodic task
        let broker = state.broker.clone();
        let store = state.store.clone();
        let dlq = state.dlq.clone();
        let period = state.interval;
        let weak = actor_ref.downgrade();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(actor_ref) = weak.upgrade() else {
                    break;
                };

                let mut updates = Vec::new();
                if let Some(broker) = &broker {
                    let state = broker.state();
                    updates.push(UpdateHealth {
                        component: BROKER_COMPONENT.to_string(),
                        status: broker_health(state),
                        details: Some(broker.transport_name().to_string()),
                    });
                }
                if let Some(store) = &store {
                    updates.push(UpdateHealth {
                        component: STORE_COMPONENT.to_string(),
                        status: probe_store(store.as_ref()).await,
                        details: None,
                    });
                }
                if let Some(dlq) = &dlq {
                    if let Ok(health) = dlq.ask(CheckDlqHealth).await {
                        updates.push(UpdateHealth {
                            component: health.name,
                            status: health.status,
                            details: health.details,
                        });
                    }
                }

                // Fire and forget - use tell
                for update in updates {
                    let _ = actor_ref.tell(update).send().await;
                }
            }
        });

        Ok(state)
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<UpdateHealth> for HealthMonitorActor {
    type Reply = ();

    async fn handle(&mut self, msg: UpdateHealth, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let previous = self.components.get(&msg.component).map(|h| h.status.clone());
        if previous.as_ref() != Some(&msg.status) {
            tracing::info!(component = %msg.component, status = ?msg.status, "Component health changed");
        }

        if msg.component == BROKER_COMPONENT {
            if let Some((reporter, service)) = &mut self.reporter {
                let serving = if msg.status.is_unhealthy() {
                    ServingStatus::NotServing
                } else {
                    ServingStatus::Serving
                };
                reporter.set_service_status(*service, serving).await;
            }
        }

        let health = ComponentHealth {
            name: msg.component.clone(),
            status: msg.status,
            last_check: Utc::now(),
            details: msg.details,
        };
        self.components.insert(msg.component, health);
    }
}

impl Message<GetSystemHealth> for HealthMonitorActor {
    type Reply = SystemHealth;

    async fn handle(&mut self, _msg: GetSystemHealth, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let overall_status = self.compute_overall_status();

        SystemHealth {
            overall_status,
            components: self.components.clone(),
            check_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryBroker;
    use crate::store::InMemoryOrderStore;
    use crate::utils::RetryConfig;
    use kameo::prelude::*;

    fn connection(broker: &InMemoryBroker) -> Arc<BrokerConnection> {
        BrokerConnection::builder(Arc::new(broker.clone()))
            .retry(RetryConfig {
                max_attempts: 1,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                multiplier: 1.0,
            })
            .build()
    }

    #[test]
    fn test_broker_state_mapping() {
        assert!(broker_health(ConnectionState::Connected).is_healthy());
        assert!(matches!(broker_health(ConnectionState::Connecting), HealthStatus::Degraded(_)));
        assert!(broker_health(ConnectionState::Failed).is_unhealthy());
        assert!(broker_health(ConnectionState::Disconnected).is_unhealthy());
    }

    #[tokio::test]
    async fn test_aggregates_component_updates() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker);
        connection.connect().await.unwrap();
        let monitor = HealthMonitorActor::spawn(
            HealthMonitorActor::new(connection).with_interval(Duration::from_secs(3600)),
        );

        monitor
            .tell(UpdateHealth {
                component: "order_store".into(),
                status: HealthStatus::Healthy,
                details: None,
            })
            .send()
            .await
            .unwrap();
        monitor
            .tell(UpdateHealth {
                component: "dead_letter_queue".into(),
                status: HealthStatus::Degraded("1 dead letters awaiting replay".into()),
                details: None,
            })
            .send()
            .await
            .unwrap();

        let health = monitor.ask(GetSystemHealth).await.unwrap();
        assert!(matches!(health.overall_status, HealthStatus::Degraded(_)));
        assert!(health.components.contains_key("order_store"));
        assert!(health.components.contains_key("dead_letter_queue"));
    }

    #[tokio::test]
    async fn test_polls_broker_and_store() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker);
        connection.connect().await.unwrap();
        let monitor = HealthMonitorActor::spawn(
            HealthMonitorActor::new(connection.clone())
                .with_store(Arc::new(InMemoryOrderStore::new()))
                .with_interval(Duration::from_millis(10)),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let health = monitor.ask(GetSystemHealth).await.unwrap();
        assert!(health.overall_status.is_healthy());
        assert!(health.components.contains_key(BROKER_COMPONENT));
        assert!(health.components.contains_key(STORE_COMPONENT));

        connection.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let health = monitor.ask(GetSystemHealth).await.unwrap();
        assert!(health.overall_status.is_unhealthy());
    }

    #[tokio::test]
    async fn test_reports_grpc_serving_status() {
        let (reporter, _service) = tonic_health::server::health_reporter();
        let broker = InMemoryBroker::new();
        let monitor = HealthMonitorActor::spawn(
            HealthMonitorActor::new(connection(&broker))
                .with_reporter(reporter, "order.lifecycle.v1.Orders")
                .with_interval(Duration::from_secs(3600)),
        );

        monitor
            .tell(UpdateHealth {
                component: BROKER_COMPONENT.into(),
                status: HealthStatus::Unhealthy("Broker connection failed".into()),
                details: None,
            })
            .send()
            .await
            .unwrap();

        let health = monitor.ask(GetSystemHealth).await.unwrap();
        assert!(health.overall_status.is_unhealthy());
    }
}
