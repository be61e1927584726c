use anyhow::Context as _;
use kameo::prelude::*;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use order_lifecycle::actors::{DlqActor, HealthMonitorActor, DEFAULT_DLQ_CAPACITY};
use order_lifecycle::clients::{InMemoryInventory, LogNotifier};
use order_lifecycle::config::{AppConfig, ScyllaConfig, TransportKind};
use order_lifecycle::domain::order::{CreateOrder, NewOrderItem, OrderStatus, UpdateStatus};
use order_lifecycle::messaging::{
    BrokerConnection, BrokerTransport, EventPublisher, InMemoryBroker, RedpandaSettings, RedpandaTransport,
};
use order_lifecycle::metrics::{self, Metrics};
use order_lifecycle::orchestrator::OrderOrchestrator;
use order_lifecycle::rpc::SERVICE_NAME;
use order_lifecycle::store::{InMemoryOrderStore, OrderStore, ScyllaOrderStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,order_lifecycle=debug"))
        )
        .init();

    tracing::info!("🚀 Starting order lifecycle service");

    // === 1. Configuration ===
    let config = AppConfig::from_env()?;

    // === 2. Initialize Prometheus metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // === 3. Order store ===
    let session = match &config.scylla {
        Some(scylla) => Some(connect_scylla(scylla).await?),
        None => None,
    };
    let store: Arc<dyn OrderStore> = match &session {
        Some(session) => {
            let store = ScyllaOrderStore::new(session.clone());
            store.ensure_schema().await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("SCYLLA_NODES not set, orders are kept in memory");
            Arc::new(InMemoryOrderStore::new())
        }
    };

    // === 4. Dead letter queue ===
    let dlq = match &session {
        Some(session) => DlqActor::new(DEFAULT_DLQ_CAPACITY).with_scylla(session.clone()).await?,
        None => DlqActor::new(DEFAULT_DLQ_CAPACITY),
    };
    let dlq = DlqActor::spawn(dlq);

    // === 5. Broker connection ===
    let transport: Arc<dyn BrokerTransport> = match config.broker.transport {
        TransportKind::Redpanda => {
            let mut settings = RedpandaSettings::new(&config.broker.url, &config.broker.consumer_group);
            settings.heartbeat_interval = config.broker.heartbeat;
            Arc::new(RedpandaTransport::new(settings))
        }
        TransportKind::Memory => Arc::new(InMemoryBroker::new()),
    };
    let connection = BrokerConnection::builder(transport)
        .retry(config.broker.reconnect.clone())
        .failure_policy(config.broker.failure_policy)
        .dead_letters(Arc::new(dlq.clone()))
        .metrics(metrics.clone())
        .build();

    // === 6. Health: gRPC health service + monitor actor ===
    let (reporter, health_service) = tonic_health::server::health_reporter();
    let health = HealthMonitorActor::spawn(
        HealthMonitorActor::new(connection.clone())
            .with_store(store.clone())
            .with_dlq(dlq.clone())
            .with_reporter(reporter, SERVICE_NAME),
    );

    let health_addr = config.health_grpc_addr;
    tokio::spawn(async move {
        tracing::info!(addr = %health_addr, "gRPC health service listening");
        if let Err(e) = tonic::transport::Server::builder()
            .add_service(health_service)
            .serve(health_addr)
            .await
        {
            tracing::error!("gRPC health server error: {}", e);
        }
    });

    // Start metrics HTTP server in background thread
    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = config.metrics_port;
    let metrics_health = health.clone();
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("Metrics runtime error: {}", e);
                return;
            }
        };
        rt.block_on(async {
            if let Err(e) = metrics::start_metrics_server(metrics_registry, Some(metrics_health), metrics_port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    });

    // === 7. Connect ===
    // Health and metrics are already up, so health checks see the broker state
    // while the backoff runs. A broker outage at startup is not fatal: the service
    // keeps serving reads until a later connect succeeds.
    if let Err(e) = connection.connect().await {
        tracing::error!(error = %e, "Could not connect to the broker, continuing without it");
    }

    // === 8. Orchestrator + stock failure compensation ===
    let publisher = Arc::new(EventPublisher::new(connection.clone(), config.queues.clone()).with_metrics(metrics.clone()));
    let inventory = Arc::new(InMemoryInventory::new());
    let orchestrator = Arc::new(
        OrderOrchestrator::new(store.clone(), inventory.clone(), Arc::new(LogNotifier::new()), publisher)
            .with_dead_letters(Arc::new(dlq.clone()))
            .with_metrics(metrics.clone()),
    );
    if let Err(e) = orchestrator.register_compensation(&connection, &config.queues).await {
        tracing::error!(error = %e, "Stock failure compensation is not running");
    }

    // === 9. Optional demo lifecycle ===
    if config.run_demo {
        if let Err(e) = run_demo(&orchestrator, &inventory).await {
            tracing::error!(error = ?e, "Demo lifecycle failed");
        }
    }

    tracing::info!("✅ Order lifecycle service ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    connection.close().await?;
    Ok(())
}

async fn connect_scylla(config: &ScyllaConfig) -> anyhow::Result<Arc<Session>> {
    tracing::info!(nodes = ?config.nodes, "Connecting to ScyllaDB...");
    let session: Session = SessionBuilder::new().known_nodes(&config.nodes).build().await?;

    session
        .query_unpaged(
            format!(
                "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                 {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
                config.keyspace
            ),
            &[],
        )
        .await?;
    session.use_keyspace(&config.keyspace, false).await?;

    Ok(Arc::new(session))
}

/// Walk one order through its whole lifecycle.
async fn run_demo(orchestrator: &OrderOrchestrator, inventory: &InMemoryInventory) -> anyhow::Result<()> {
    tracing::info!("📝 Demonstrating order lifecycle");
    inventory.set_stock("keyboard", 10).await;
    inventory.set_stock("mouse", 10).await;

    let order = orchestrator
        .create(CreateOrder {
            client_id: "demo-client".to_string(),
            client_name: "Demo Client".to_string(),
            client_email: "demo@example.com".to_string(),
            shipping_address: "Av. Siempre Viva 742".to_string(),
            items: vec![
                NewOrderItem {
                    product_id: "keyboard".to_string(),
                    product_name: "Mechanical keyboard".to_string(),
                    product_image_url: None,
                    unit_price: 8_999,
                    quantity: 1,
                },
                NewOrderItem {
                    product_id: "mouse".to_string(),
                    product_name: "Wireless mouse".to_string(),
                    product_image_url: None,
                    unit_price: 2_499,
                    quantity: 2,
                },
            ],
        })
        .await?;
    tracing::info!(order_id = %order.id, total = order.total(), "✅ Order created");

    let steps = [
        UpdateStatus::to(OrderStatus::EnProcesamiento),
        UpdateStatus::to(OrderStatus::Enviado).with_tracking_number("DEMO-TRACK-001"),
        UpdateStatus::to(OrderStatus::Entregado),
    ];
    for step in steps {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let order = orchestrator.update_status(order.id, step).await?;
        tracing::info!(order_id = %order.id, status = %order.status(), "✅ Order advanced");
    }

    tracing::info!("🎉 Demo complete!");
    Ok(())
}
