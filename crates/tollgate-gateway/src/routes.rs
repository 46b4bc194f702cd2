use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::{debug, info};

use tollgate_core::approval::ApprovalDecision;
use tollgate_core::state::StateRecord;

use crate::connection;
use crate::state::AppState;

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// GET /api/workflows
pub async fn list_workflows(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "instances": state.sessions.list() }))
}

#[derive(Deserialize)]
pub struct StartWorkflowBody {
    #[serde(default)]
    pub description: String,
}

// POST /api/workflows
pub async fn start_workflow(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartWorkflowBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let description = body.description.trim();
    if description.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let initial = StateRecord::new().with("description", description);
    let instance_id = state.start_workflow(description, initial, None);
    Ok(Json(serde_json::json!({ "instance_id": instance_id })))
}

// POST /api/workflows/:id/cancel
pub async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let instance_id = tollgate_core::types::InstanceId::from_string(&id);
    if !state.sessions.cancel(&instance_id) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

// GET /api/approvals
pub async fn list_approvals(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let pending = state.broker.pending_requests().await;
    Json(serde_json::json!({ "approvals": pending }))
}

#[derive(Deserialize)]
pub struct RespondBody {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

// POST /api/approvals/:id
pub async fn respond_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RespondBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let request_id = connection::resolve_request_id(&state, &id).await;
    let decision = ApprovalDecision::from_parts(body.approved, body.feedback);
    if !state.broker.respond(request_id.as_str(), decision).await {
        return Err(StatusCode::NOT_FOUND);
    }
    info!(request_id = %request_id, approved = body.approved, "Approval resolved over HTTP");
    Ok(Json(serde_json::json!({
        "resolved": true,
        "request_id": request_id,
    })))
}

// GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>) {
    info!("WebSocket client connected");
    connection::handle_connection(socket, state).await;
    debug!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tollgate_core::config::GatewayConfig;
    use tollgate_core::event::EventBus;
    use tollgate_engine::{ApprovalBroker, ApprovalGate, Edge, GraphEngine, SessionManager, StepDescriptor};
    use tollgate_test_utils::CountingStep;

    fn app_state() -> Arc<AppState> {
        let bus = Arc::new(EventBus::default());
        let broker = Arc::new(ApprovalBroker::new(bus.clone()));
        let engine = GraphEngine::builder("draft")
            .add_step(StepDescriptor::new("draft", CountingStep::new()))
            .add_step(StepDescriptor::gate(
                "review",
                ApprovalGate::new("draft_runs", broker.clone()),
            ))
            .add_edge(Edge::always("draft", "review"))
            .event_bus(bus.clone())
            .build()
            .unwrap();
        Arc::new(AppState {
            config: GatewayConfig::default(),
            engine: Arc::new(engine),
            event_bus: bus,
            sessions: Arc::new(SessionManager::new()),
            broker,
        })
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn start_requires_description() {
        let state = app_state();
        let res = start_workflow(
            State(state),
            Json(StartWorkflowBody {
                description: "   ".into(),
            }),
        )
        .await;
        assert_eq!(res.unwrap_err(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn respond_to_unknown_request_is_not_found() {
        let res = respond_approval(
            State(app_state()),
            Path("nope".into()),
            Json(RespondBody {
                approved: true,
                feedback: None,
            }),
        )
        .await;
        assert_eq!(res.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_unknown_instance_is_not_found() {
        let res = cancel_workflow(State(app_state()), Path("missing".into())).await;
        assert_eq!(res.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn approve_pending_request_over_http() {
        let state = app_state();
        let mut listener = state.broker.register_listener().await;

        let Json(started) = start_workflow(
            State(state.clone()),
            Json(StartWorkflowBody {
                description: "poster".into(),
            }),
        )
        .await
        .unwrap();
        assert!(started["instance_id"].is_string());

        let req = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.subject, "draft_runs");

        let Json(listed) = list_approvals(State(state.clone())).await;
        assert_eq!(listed["approvals"].as_array().unwrap().len(), 1);

        let Json(resolved) = respond_approval(
            State(state.clone()),
            Path(req.id.short().to_string()),
            Json(RespondBody {
                approved: true,
                feedback: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(resolved["resolved"], true);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !state.sessions.list().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let Json(listed) = list_workflows(State(state)).await;
        assert!(listed["instances"].as_array().unwrap().is_empty());
    }
}
