//! HTTP server wiring — control routes behind bearer auth, unauthenticated
//! probes, and the Prometheus exporter on its own port.

use crate::rest::{self, AppState};
use crate::state::ControlPlane;
use axum::routing::{get, post, put};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    plane: Arc<ControlPlane>,
}

impl ApiServer {
    pub fn new(plane: Arc<ControlPlane>) -> Self {
        Self { plane }
    }

    /// The full application router. Public so tests can drive it without a
    /// socket.
    pub fn router(&self) -> Router {
        let state = AppState {
            plane: self.plane.clone(),
        };

        let control = Router::new()
            .route("/deploy", post(rest::deploy))
            .route("/flags", post(rest::create_flag))
            .route("/flags/:name", put(rest::update_flag))
            .route("/migrations", post(rest::run_migration))
            .route("/rollback", post(rest::rollback))
            .route("/emergency-stop", post(rest::emergency_stop))
            .route("/freeze", post(rest::freeze))
            .route("/unfreeze", post(rest::unfreeze))
            .route("/status", get(rest::status))
            .route("/dashboard", get(rest::dashboard))
            .route("/dashboard/stream", get(rest::dashboard_stream))
            .route("/audit", get(rest::audit_log))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                rest::require_auth,
            ));

        Router::new()
            .merge(control)
            .route("/health", get(rest::health_check))
            .route("/ready", get(rest::readiness))
            .route("/live", get(rest::liveness))
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let addr = SocketAddr::new(
            self.plane.config.api.host.parse()?,
            self.plane.config.api.http_port,
        );
        info!(addr = %addr, "Starting control API server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Start the Prometheus exporter on the metrics port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        let handle = builder
            .with_http_listener(SocketAddr::new(
                self.plane.config.api.host.parse()?,
                self.plane.config.metrics.port,
            ))
            .install_recorder()?;

        info!(port = self.plane.config.metrics.port, "Metrics exporter started");

        // Keep the recorder alive for the process lifetime.
        std::mem::forget(handle);
        Ok(())
    }
}
