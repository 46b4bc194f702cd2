use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tollgate_core::approval::{ApprovalDecision, ApprovalRequest, CorrelationId};
use tollgate_core::state::StateRecord;
use tollgate_core::types::{InstanceId, WorkflowEvent};

use crate::protocol::{ClientFrame, ServerEvent, ServerResponse};
use crate::state::AppState;

/// Per-connection bookkeeping shared by the reader and the forwarders.
pub struct ConnectionContext {
    pub conn_id: String,
    pub state: Arc<AppState>,
    /// Instances started over this connection.
    pub owned: Mutex<HashSet<InstanceId>>,
}

impl ConnectionContext {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            conn_id: format!("ws-{}", Uuid::new_v4().simple()),
            state,
            owned: Mutex::new(HashSet::new()),
        }
    }
}

/// Handle a single WebSocket connection (axum WebSocket).
///
/// The connection registers as an approval listener for its lifetime. Every
/// approval request is pushed to it; run outcomes are pushed only for the
/// instances it started. Closing the connection cancels those instances.
pub async fn handle_connection(ws: WebSocket, state: Arc<AppState>) {
    let (ws_tx, mut ws_rx) = ws.split();
    let ws_tx = Arc::new(Mutex::new(ws_tx));
    let ctx = Arc::new(ConnectionContext::new(state.clone()));

    // Forward approval requests broadcast by the broker
    let mut listener = state.broker.register_listener().await;
    let listener_id = listener.id;
    let approval_ws_tx = ws_tx.clone();
    let approval_task = tokio::spawn(async move {
        while let Some(request) = listener.recv().await {
            let evt = approval_frame(&request);
            if let Ok(json) = serde_json::to_string(&evt) {
                let mut tx = approval_ws_tx.lock().await;
                if tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Forward run outcomes for owned instances
    let mut event_rx = state.event_bus.subscribe();
    let event_ws_tx = ws_tx.clone();
    let event_ctx = ctx.clone();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            if !event_ctx.owned.lock().await.contains(event.instance_id()) {
                continue;
            }
            let Some(evt) = event_frame(&event) else {
                continue;
            };
            if let Ok(json) = serde_json::to_string(&evt) {
                let mut tx = event_ws_tx.lock().await;
                if tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Read incoming frames
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "WebSocket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let resp = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => {
                        let result = process_request(&frame.method, &frame.params, &ctx).await;
                        ServerResponse::ok(frame.id, result)
                    }
                    Err(e) => {
                        ServerResponse::err("0".to_string(), -32700, format!("Parse error: {}", e))
                    }
                };
                match serde_json::to_string(&resp) {
                    Ok(json) => {
                        let mut tx = ws_tx.lock().await;
                        let _ = tx.send(Message::Text(json.into())).await;
                    }
                    Err(e) => warn!(error = %e, "Failed to encode response"),
                }
            }
            Message::Close(_) => break,
            Message::Ping(data) => {
                let mut tx = ws_tx.lock().await;
                let _ = tx.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }

    approval_task.abort();
    event_task.abort();
    state.broker.deregister_listener(listener_id).await;
    let cancelled = state.sessions.cancel_owned_by(&ctx.conn_id);
    info!(conn_id = %ctx.conn_id, cancelled, "Connection closed");
}

pub fn approval_frame(request: &ApprovalRequest) -> ServerEvent {
    ServerEvent::new(request.instance_id.to_string(), "approval_requested").with_data(json!({
        "id": request.id,
        "subject": request.subject,
        "payload": request.payload,
        "timestamp": request.timestamp,
    }))
}

/// Map a workflow event to the frame pushed to the owning connection.
pub fn event_frame(event: &WorkflowEvent) -> Option<ServerEvent> {
    match event {
        WorkflowEvent::RunComplete {
            instance_id,
            steps_executed,
            state,
        } => Some(
            ServerEvent::new(instance_id.to_string(), "run_complete").with_data(json!({
                "steps_executed": steps_executed,
                "state": state,
            })),
        ),
        WorkflowEvent::RunFailed {
            instance_id,
            step_id,
            error,
        } => Some(
            ServerEvent::new(instance_id.to_string(), "run_failed").with_data(json!({
                "step_id": step_id,
                "error": error,
            })),
        ),
        _ => None,
    }
}

/// Initial state and label for `workflow.start`.
///
/// Accepts `{"description": "..."}`, `{"state": {...}}` or both; a
/// description is stored in the `description` field.
fn start_params(params: &Value) -> std::result::Result<(String, StateRecord), String> {
    let mut initial = match &params["state"] {
        Value::Null => StateRecord::new(),
        v @ Value::Object(_) => StateRecord::from_json(v.clone()),
        _ => return Err("state must be an object".to_string()),
    };
    let description = params["description"].as_str().unwrap_or("").trim();
    if !description.is_empty() {
        initial.set_str("description", description);
    }
    if initial.is_empty() {
        return Err("description or state is required".to_string());
    }
    let label = if description.is_empty() {
        "workflow".to_string()
    } else {
        description.to_string()
    };
    Ok((label, initial))
}

pub async fn process_request(method: &str, params: &Value, ctx: &ConnectionContext) -> Value {
    let state = &ctx.state;
    match method {
        "workflow.start" => match start_params(params) {
            Ok((label, initial)) => {
                let instance_id = state.start_workflow(&label, initial, Some(&ctx.conn_id));
                ctx.owned.lock().await.insert(instance_id.clone());
                json!({"instance_id": instance_id})
            }
            Err(e) => json!({"error": e}),
        },
        "workflow.cancel" => {
            let id = params["instance_id"].as_str().unwrap_or("");
            if id.is_empty() {
                return json!({"error": "instance_id is required"});
            }
            let cancelled = state.sessions.cancel(&InstanceId::from_string(id));
            json!({"cancelled": cancelled})
        }
        "workflow.list" => json!({"instances": state.sessions.list()}),
        "approval.list" => json!({"approvals": state.broker.pending_requests().await}),
        "approval.respond" => {
            let request_id = params["request_id"].as_str().unwrap_or("");
            if request_id.is_empty() {
                return json!({"error": "request_id is required"});
            }
            let Some(approved) = params["approved"].as_bool() else {
                return json!({"error": "approved is required"});
            };
            let feedback = params["feedback"].as_str().map(str::to_string);
            let id = resolve_request_id(state, request_id).await;
            let resolved = state
                .broker
                .respond(id.as_str(), ApprovalDecision::from_parts(approved, feedback))
                .await;
            json!({"resolved": resolved, "request_id": id})
        }
        _ => {
            warn!(method, "Unknown method");
            json!({"error": format!("Unknown method: {}", method)})
        }
    }
}

/// Accept a full correlation id or an unambiguous prefix of one.
pub async fn resolve_request_id(state: &AppState, id: &str) -> CorrelationId {
    match state.broker.find_by_prefix(id).await {
        Some(full) => full,
        None => CorrelationId::from_string(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tollgate_core::config::GatewayConfig;
    use tollgate_core::event::EventBus;
    use tollgate_core::traits::step_fn;
    use tollgate_engine::{
        ApprovalBroker, ApprovalGate, Edge, GraphEngine, SessionManager, StepDescriptor, Target,
    };

    /// draft -> draft_approval, looping on rejection.
    fn test_state() -> Arc<AppState> {
        let bus = Arc::new(EventBus::default());
        let broker = Arc::new(ApprovalBroker::new(bus.clone()));
        let engine = GraphEngine::builder("draft")
            .add_step(StepDescriptor::new(
                "draft",
                step_fn(|state, _| {
                    let n = state.bump("drafts");
                    state.set_str("draft", format!("draft-{n}"));
                    Ok(())
                }),
            ))
            .add_step(StepDescriptor::gate(
                "draft_approval",
                ApprovalGate::new("draft", broker.clone()),
            ))
            .add_edge(Edge::always("draft", "draft_approval"))
            .add_edge(Edge::conditional("draft_approval", "draft", "!draft_approved"))
            .add_edge(Edge::conditional("draft_approval", Target::End, "draft_approved"))
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

    #[test]
    fn start_params_variants() {
        let (label, s) = start_params(&json!({"description": "jazz night"})).unwrap();
        assert_eq!(label, "jazz night");
        assert_eq!(s.get_str("description"), Some("jazz night"));

        let (label, s) = start_params(&json!({"state": {"topic": "x"}})).unwrap();
        assert_eq!(label, "workflow");
        assert_eq!(s.get_str("topic"), Some("x"));

        assert!(start_params(&json!({})).is_err());
        assert!(start_params(&json!({"state": [1, 2]})).is_err());
    }

    #[test]
    fn only_outcome_events_are_forwarded() {
        let id = InstanceId::from_string("i-1");
        let done = WorkflowEvent::RunComplete {
            instance_id: id.clone(),
            steps_executed: 3,
            state: json!({}),
        };
        assert_eq!(event_frame(&done).unwrap().event.kind, "run_complete");

        let started = WorkflowEvent::RunStarted {
            instance_id: id,
            entry: "draft".into(),
        };
        assert!(event_frame(&started).is_none());
    }

    #[tokio::test]
    async fn unknown_method_and_missing_params() {
        let ctx = ConnectionContext::new(test_state());
        let r = process_request("workflow.bogus", &Value::Null, &ctx).await;
        assert!(r["error"].as_str().unwrap().contains("Unknown method"));

        let r = process_request("approval.respond", &json!({}), &ctx).await;
        assert_eq!(r["error"], "request_id is required");

        let r = process_request("approval.respond", &json!({"request_id": "abc"}), &ctx).await;
        assert_eq!(r["error"], "approved is required");

        let r = process_request("workflow.cancel", &json!({}), &ctx).await;
        assert_eq!(r["error"], "instance_id is required");
    }

    #[tokio::test]
    async fn start_review_and_complete_over_requests() {
        let state = test_state();
        let mut events = state.event_bus.subscribe();
        let mut listener = state.broker.register_listener().await;
        let ctx = ConnectionContext::new(state.clone());

        let r = process_request("workflow.start", &json!({"description": "flyer"}), &ctx).await;
        let instance_id = r["instance_id"].as_str().unwrap().to_string();
        assert!(ctx.owned.lock().await.contains(&InstanceId::from_string(&instance_id)));

        // First draft: reject by prefix with feedback.
        let req = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.payload, json!("draft-1"));
        let listed = process_request("approval.list", &Value::Null, &ctx).await;
        assert_eq!(listed["approvals"].as_array().unwrap().len(), 1);
        let prefix = &req.id.as_str()[..8];
        let r = process_request(
            "approval.respond",
            &json!({"request_id": prefix, "approved": false, "feedback": "shorter"}),
            &ctx,
        )
        .await;
        assert_eq!(r["resolved"], true);

        // Second draft: approve by full id.
        let req = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.payload, json!("draft-2"));
        let r = process_request(
            "approval.respond",
            &json!({"request_id": req.id.as_str(), "approved": true}),
            &ctx,
        )
        .await;
        assert_eq!(r["resolved"], true);

        // A second response to the same id is ignored.
        let r = process_request(
            "approval.respond",
            &json!({"request_id": req.id.as_str(), "approved": false}),
            &ctx,
        )
        .await;
        assert_eq!(r["resolved"], false);

        let complete = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(WorkflowEvent::RunComplete { state, .. }) = events.recv().await {
                    return state;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(complete["draft"], "draft-2");
        assert_eq!(complete["draft_approved"], true);
    }

    #[tokio::test]
    async fn cancel_started_workflow() {
        let state = test_state();
        let mut listener = state.broker.register_listener().await;
        let ctx = ConnectionContext::new(state.clone());

        let r = process_request("workflow.start", &json!({"description": "x"}), &ctx).await;
        let instance_id = r["instance_id"].as_str().unwrap().to_string();
        let listed = process_request("workflow.list", &Value::Null, &ctx).await;
        assert_eq!(listed["instances"].as_array().unwrap().len(), 1);

        // Wait until the gate is pending, then cancel.
        let _ = tokio::time::timeout(Duration::from_secs(5), listener.recv()).await;
        let r = process_request("workflow.cancel", &json!({"instance_id": instance_id}), &ctx).await;
        assert_eq!(r["cancelled"], true);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !state.sessions.list().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(state.broker.pending_requests().await.is_empty());
    }
}
