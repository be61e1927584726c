use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use kameo::actor::ActorRef;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

use crate::actors::{GetSystemHealth, HealthMonitorActor};

struct ServerState {
    registry: Arc<Registry>,
    health: Option<ActorRef<HealthMonitorActor>>,
}

/// Start the metrics HTTP server
/// This should be called in a separate thread/runtime to avoid conflicts
pub async fn start_metrics_server(
    registry: Arc<Registry>,
    health: Option<ActorRef<HealthMonitorActor>>,
    port: u16,
) -> std::io::Result<()> {
    tracing::info!("📊 Starting metrics server on http://0.0.0.0:{}/metrics", port);

    let state = web::Data::new(ServerState { registry, health });
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

async fn metrics_handler(state: web::Data<ServerState>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

async fn health_handler(state: web::Data<ServerState>) -> impl Responder {
    let Some(monitor) = &state.health else {
        return HttpResponse::Ok().json(serde_json::json!({
            "status": "healthy",
            "service": "order-lifecycle"
        }));
    };

    match monitor.ask(GetSystemHealth).await {
        Ok(health) if health.overall_status.is_unhealthy() => HttpResponse::ServiceUnavailable().json(health),
        Ok(health) => HttpResponse::Ok().json(health),
        Err(e) => {
            tracing::error!(error = %e, "Health monitor unavailable");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "status": "unhealthy",
                "reason": "health monitor unavailable"
            }))
        }
    }
}
