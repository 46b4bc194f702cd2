use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use tollgate_core::config::GatewayConfig;
use tollgate_core::event::EventBus;
use tollgate_engine::{ApprovalBroker, GraphEngine, SessionManager};

use crate::routes;
use crate::state::AppState;

/// WebSocket + HTTP approval gateway built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Arc<GraphEngine>,
    event_bus: Arc<EventBus>,
    sessions: Arc<SessionManager>,
    broker: Arc<ApprovalBroker>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        engine: Arc<GraphEngine>,
        event_bus: Arc<EventBus>,
        sessions: Arc<SessionManager>,
        broker: Arc<ApprovalBroker>,
    ) -> Self {
        Self {
            config,
            engine,
            event_bus,
            sessions,
            broker,
        }
    }

    fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
            event_bus: self.event_bus.clone(),
            sessions: self.sessions.clone(),
            broker: self.broker.clone(),
        });

        Router::new()
            .route("/ws", get(routes::ws_handler))
            .route("/api/health", get(routes::health))
            .route(
                "/api/workflows",
                get(routes::list_workflows).post(routes::start_workflow),
            )
            .route("/api/workflows/{id}/cancel", post(routes::cancel_workflow))
            .route("/api/approvals", get(routes::list_approvals))
            .route("/api/approvals/{id}", post(routes::respond_approval))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
