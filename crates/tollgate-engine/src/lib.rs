pub mod broker;
pub mod gate;
pub mod graph;
pub mod session;

pub use broker::{ApprovalBroker, Listener, Submission, Ticket};
pub use gate::{ApprovalGate, GateState};
pub use graph::{
    evaluate_condition, Edge, EdgeRouter, ExecutionResult, GraphBuilder, GraphEngine, Route,
    Routing, RunFailure, StepDescriptor, StepRecord, Target,
};
pub use session::{InstanceSummary, SessionManager};
