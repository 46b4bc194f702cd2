use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tollgate_core::state::StateRecord;
use tollgate_core::types::InstanceId;

use crate::graph::{ExecutionResult, GraphEngine, RunFailure};

/// Tracks running workflow instances and their cancellation tokens.
pub struct SessionManager {
    instances: Mutex<HashMap<InstanceId, InstanceInfo>>,
}

struct InstanceInfo {
    label: String,
    owner: Option<String>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Public view of a running instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub instance_id: InstanceId,
    pub label: String,
    pub owner: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new instance. `owner` identifies the connection that started
    /// it, if any.
    pub fn register(&self, label: &str, owner: Option<&str>) -> (InstanceId, CancellationToken) {
        let instance_id = InstanceId::new();
        let cancel = CancellationToken::new();
        self.instances.lock().unwrap().insert(
            instance_id.clone(),
            InstanceInfo {
                label: label.to_string(),
                owner: owner.map(str::to_string),
                started_at: Utc::now(),
                cancel: cancel.clone(),
            },
        );
        (instance_id, cancel)
    }

    /// Forget a finished instance.
    pub fn finish(&self, instance_id: &InstanceId) -> bool {
        self.instances.lock().unwrap().remove(instance_id).is_some()
    }

    /// Trigger an instance's cancellation token.
    pub fn cancel(&self, instance_id: &InstanceId) -> bool {
        match self.instances.lock().unwrap().get(instance_id) {
            Some(info) => {
                info.cancel.cancel();
                info!(instance_id = %instance_id, "Workflow instance cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every instance started by `owner`. Returns how many were cancelled.
    pub fn cancel_owned_by(&self, owner: &str) -> usize {
        let instances = self.instances.lock().unwrap();
        let mut count = 0;
        for info in instances.values() {
            if info.owner.as_deref() == Some(owner) && !info.cancel.is_cancelled() {
                info.cancel.cancel();
                count += 1;
            }
        }
        count
    }

    pub fn contains(&self, instance_id: &InstanceId) -> bool {
        self.instances.lock().unwrap().contains_key(instance_id)
    }

    /// Running instances, oldest first.
    pub fn list(&self) -> Vec<InstanceSummary> {
        let mut list: Vec<InstanceSummary> = self
            .instances
            .lock()
            .unwrap()
            .iter()
            .map(|(id, info)| InstanceSummary {
                instance_id: id.clone(),
                label: info.label.clone(),
                owner: info.owner.clone(),
                started_at: info.started_at,
            })
            .collect();
        list.sort_by_key(|s| s.started_at);
        list
    }

    /// Register an instance, run it to completion and forget it.
    pub async fn run(
        &self,
        engine: &GraphEngine,
        label: &str,
        initial: StateRecord,
    ) -> Result<ExecutionResult, RunFailure> {
        let (instance_id, cancel) = self.register(label, None);
        let result = engine
            .run_instance(instance_id.clone(), initial, cancel)
            .await;
        self.finish(&instance_id);
        result
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
