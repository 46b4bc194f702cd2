use std::sync::Arc;

use tracing::{info, warn};

use tollgate_core::config::GatewayConfig;
use tollgate_core::event::EventBus;
use tollgate_core::state::StateRecord;
use tollgate_core::types::InstanceId;
use tollgate_engine::{ApprovalBroker, GraphEngine, SessionManager};

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Arc<GraphEngine>,
    pub event_bus: Arc<EventBus>,
    pub sessions: Arc<SessionManager>,
    pub broker: Arc<ApprovalBroker>,
}

impl AppState {
    /// Start a workflow instance in the background and return its id.
    ///
    /// The instance is forgotten by the session manager once it ends; its
    /// outcome is reported on the event bus.
    pub fn start_workflow(&self, label: &str, initial: StateRecord, owner: Option<&str>) -> InstanceId {
        let (instance_id, cancel) = self.sessions.register(label, owner);
        let engine = self.engine.clone();
        let sessions = self.sessions.clone();
        let id = instance_id.clone();
        tokio::spawn(async move {
            match engine.run_instance(id.clone(), initial, cancel).await {
                Ok(result) => {
                    info!(instance_id = %id, steps = result.steps_executed, "Workflow finished")
                }
                Err(failure) => {
                    warn!(instance_id = %id, step_id = %failure.step_id, error = %failure.error, "Workflow failed")
                }
            }
            sessions.finish(&id);
        });
        instance_id
    }
}
