use std::sync::Arc;

use tollgate_core::traits::Step;
use tollgate_core::types::StepKind;

use crate::gate::ApprovalGate;

/// A step registered in the graph.
///
/// `requires` lists the state fields the step reads; the engine checks them at
/// step entry. A `join` step waits until every other queued branch has run.
#[derive(Clone)]
pub struct StepDescriptor {
    /// Unique identifier within the graph.
    pub id: String,
    pub kind: StepKind,
    pub requires: Vec<String>,
    pub join: bool,
    step: Arc<dyn Step>,
}

impl StepDescriptor {
    /// A plain step.
    pub fn new(id: impl Into<String>, step: impl Step) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::Plain,
            requires: vec![],
            join: false,
            step: Arc::new(step),
        }
    }

    /// An approval gate step. The gate's artifact field is required at entry.
    pub fn gate(id: impl Into<String>, gate: ApprovalGate) -> Self {
        let artifact = gate.fields().artifact.clone();
        Self {
            id: id.into(),
            kind: StepKind::ApprovalGate,
            requires: vec![artifact],
            join: false,
            step: Arc::new(gate),
        }
    }

    /// Declare the fields this step reads.
    pub fn with_requires<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Mark this step as a join point.
    pub fn as_join(mut self) -> Self {
        self.join = true;
        self
    }

    pub fn step(&self) -> &Arc<dyn Step> {
        &self.step
    }
}

impl std::fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("requires", &self.requires)
            .field("join", &self.join)
            .finish()
    }
}
