use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tollgate_core::error::{Result, TollgateError};
use tollgate_core::event::EventBus;
use tollgate_core::state::StateRecord;
use tollgate_core::traits::StepContext;
use tollgate_core::types::{InstanceId, StepKind, WorkflowEvent};

use super::edge::{Edge, Target};
use super::router::EdgeRouter;
use super::step::StepDescriptor;

const DEFAULT_HISTORY_LIMIT: usize = 256;

/// One executed step, as kept in the run trail.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step_id: String,
    pub kind: StepKind,
    /// Execution time in milliseconds.
    pub elapsed_ms: u64,
}

/// Result of a run that reached the end of every branch.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub instance_id: InstanceId,
    /// The final state record.
    pub state: StateRecord,
    /// The most recent executed steps, oldest first.
    pub trail: Vec<StepRecord>,
    /// Total number of steps executed, including those dropped from the trail.
    pub steps_executed: u64,
    /// Total execution time in milliseconds.
    pub total_elapsed_ms: u64,
}

/// A run that stopped on an error. Carries the state as of the failure.
#[derive(Debug, Error)]
#[error("Run {instance_id} failed at step '{step_id}': {error}")]
pub struct RunFailure {
    pub instance_id: InstanceId,
    pub step_id: String,
    #[source]
    pub error: TollgateError,
    pub state: StateRecord,
    pub trail: Vec<StepRecord>,
    pub steps_executed: u64,
}

/// Builder for a [`GraphEngine`].
pub struct GraphBuilder {
    entry: String,
    steps: Vec<StepDescriptor>,
    edges: Vec<Edge>,
    history_limit: usize,
    event_bus: Option<Arc<EventBus>>,
}

impl GraphBuilder {
    pub fn add_step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    pub fn add_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Maximum number of executed steps retained in the trail.
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Validate the graph and build the engine.
    ///
    /// Step ids must be unique, the entry must exist and every edge must start
    /// at a known step. Statically known edge targets must exist too; targets
    /// computed by selectors are checked when they are taken.
    pub fn build(self) -> Result<GraphEngine> {
        let mut steps = HashMap::with_capacity(self.steps.len());
        for step in self.steps {
            if steps.contains_key(&step.id) {
                return Err(TollgateError::DuplicateStep(step.id));
            }
            steps.insert(step.id.clone(), step);
        }

        if !steps.contains_key(&self.entry) {
            return Err(TollgateError::UnknownStep(self.entry));
        }

        for edge in &self.edges {
            if !steps.contains_key(&edge.from) {
                return Err(TollgateError::GraphBuild(format!(
                    "edge leaves unknown step '{}'",
                    edge.from
                )));
            }
            if let Some(Target::Step(to)) = edge.static_target() {
                if !steps.contains_key(to) {
                    return Err(TollgateError::GraphBuild(format!(
                        "edge from '{}' targets unknown step '{}'",
                        edge.from, to
                    )));
                }
            }
        }

        Ok(GraphEngine {
            steps,
            router: EdgeRouter::new(self.edges),
            entry: self.entry,
            history_limit: self.history_limit,
            event_bus: self.event_bus,
        })
    }
}

/// Runs workflow instances over a validated step graph.
///
/// Ready steps are kept in a FIFO queue seeded with the entry step. Steps run
/// one at a time; after each, the router's targets are appended unless already
/// queued, so several branches arriving at the same step merge into one
/// execution. A join step is held back while any non-join step is queued. A
/// branch ends at the terminal marker or at a step without outgoing edges, and
/// the run completes once the queue drains.
///
/// There is no iteration cap: rejection loops run until approved or cancelled.
/// Memory per run stays bounded because only the last `history_limit` step
/// records are retained.
pub struct GraphEngine {
    steps: HashMap<String, StepDescriptor>,
    router: EdgeRouter,
    entry: String,
    history_limit: usize,
    event_bus: Option<Arc<EventBus>>,
}

impl GraphEngine {
    pub fn builder(entry: impl Into<String>) -> GraphBuilder {
        GraphBuilder {
            entry: entry.into(),
            steps: Vec::new(),
            edges: Vec::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            event_bus: None,
        }
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn router(&self) -> &EdgeRouter {
        &self.router
    }

    /// Run a fresh instance to completion.
    pub async fn run(&self, initial: StateRecord) -> std::result::Result<ExecutionResult, RunFailure> {
        self.run_instance(InstanceId::new(), initial, CancellationToken::new())
            .await
    }

    /// Run an instance under a caller-supplied id and cancellation token.
    pub async fn run_instance(
        &self,
        instance_id: InstanceId,
        initial: StateRecord,
        cancel: CancellationToken,
    ) -> std::result::Result<ExecutionResult, RunFailure> {
        let start = Instant::now();
        let mut run = RunState {
            instance_id,
            state: initial,
            trail: VecDeque::new(),
            steps_executed: 0,
        };
        let mut queue: VecDeque<String> = VecDeque::from([self.entry.clone()]);

        info!(instance_id = %run.instance_id, entry = %self.entry, "Workflow run started");
        self.emit(WorkflowEvent::RunStarted {
            instance_id: run.instance_id.clone(),
            entry: self.entry.clone(),
        });

        while let Some(step_id) = self.next_ready(&mut queue) {
            if cancel.is_cancelled() {
                return Err(self.fail(run, step_id, TollgateError::Cancelled));
            }

            let Some(descriptor) = self.steps.get(&step_id) else {
                return Err(self.fail(run, step_id.clone(), TollgateError::UnknownStep(step_id)));
            };

            if let Some(field) = descriptor
                .requires
                .iter()
                .find(|f| !run.state.contains(f))
            {
                let err = TollgateError::MissingField {
                    step: step_id.clone(),
                    field: field.clone(),
                };
                return Err(self.fail(run, step_id, err));
            }

            debug!(instance_id = %run.instance_id, step_id = %step_id, kind = ?descriptor.kind, "Executing step");
            self.emit(WorkflowEvent::StepStarted {
                instance_id: run.instance_id.clone(),
                step_id: step_id.clone(),
                step_kind: descriptor.kind,
            });

            let ctx = StepContext {
                instance_id: run.instance_id.clone(),
                step_id: step_id.clone(),
                cancel: cancel.clone(),
            };
            let step_start = Instant::now();
            let result = tokio::select! {
                biased;
                r = descriptor.step().execute(&mut run.state, &ctx) => r,
                _ = cancel.cancelled() => Err(TollgateError::Cancelled),
            };
            let elapsed_ms = step_start.elapsed().as_millis() as u64;

            if let Err(e) = result {
                error!(instance_id = %run.instance_id, step_id = %step_id, error = %e, "Step failed");
                self.emit(WorkflowEvent::StepFailed {
                    instance_id: run.instance_id.clone(),
                    step_id: step_id.clone(),
                    error: e.to_string(),
                });
                return Err(self.fail(run, step_id, e));
            }

            run.record(
                StepRecord {
                    step_id: step_id.clone(),
                    kind: descriptor.kind,
                    elapsed_ms,
                },
                self.history_limit,
            );
            self.emit(WorkflowEvent::StepCompleted {
                instance_id: run.instance_id.clone(),
                step_id: step_id.clone(),
                elapsed_ms,
            });

            let routing = match self.router.route(&step_id, &run.state) {
                Ok(r) => r,
                Err(e) => return Err(self.fail(run, step_id, e)),
            };
            if routing.terminal {
                debug!(instance_id = %run.instance_id, step_id = %step_id, "Branch reached end");
            }
            for next in routing.next {
                if !self.steps.contains_key(&next) {
                    return Err(self.fail(run, step_id, TollgateError::UnknownStep(next)));
                }
                if !queue.contains(&next) {
                    queue.push_back(next);
                }
            }
        }

        let total_elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            instance_id = %run.instance_id,
            steps_executed = run.steps_executed,
            total_elapsed_ms,
            "Workflow run complete"
        );
        self.emit(WorkflowEvent::RunComplete {
            instance_id: run.instance_id.clone(),
            steps_executed: run.steps_executed,
            state: run.state.to_json(),
        });

        Ok(ExecutionResult {
            instance_id: run.instance_id,
            state: run.state,
            trail: run.trail.into(),
            steps_executed: run.steps_executed,
            total_elapsed_ms,
        })
    }

    /// Pop the first queued non-join step, or the first join if only joins remain.
    fn next_ready(&self, queue: &mut VecDeque<String>) -> Option<String> {
        let pos = queue
            .iter()
            .position(|id| !self.steps.get(id).is_some_and(|d| d.join))
            .unwrap_or(0);
        queue.remove(pos)
    }

    fn fail(&self, run: RunState, step_id: String, error: TollgateError) -> RunFailure {
        if matches!(error, TollgateError::Cancelled) {
            warn!(instance_id = %run.instance_id, step_id = %step_id, "Workflow run cancelled");
        } else {
            error!(instance_id = %run.instance_id, step_id = %step_id, error = %error, "Workflow run failed");
        }
        self.emit(WorkflowEvent::RunFailed {
            instance_id: run.instance_id.clone(),
            step_id: step_id.clone(),
            error: error.to_string(),
        });
        RunFailure {
            instance_id: run.instance_id,
            step_id,
            error,
            state: run.state,
            trail: run.trail.into(),
            steps_executed: run.steps_executed,
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

struct RunState {
    instance_id: InstanceId,
    state: StateRecord,
    trail: VecDeque<StepRecord>,
    steps_executed: u64,
}

impl RunState {
    fn record(&mut self, record: StepRecord, limit: usize) {
        self.steps_executed += 1;
        if limit == 0 {
            return;
        }
        if self.trail.len() == limit {
            self.trail.pop_front();
        }
        self.trail.push_back(record);
    }
}
