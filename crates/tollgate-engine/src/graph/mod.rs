//! Graph execution engine: cyclic step graphs with approval gates.
//!
//! A workflow is a directed graph of named steps connected by edges. Each step
//! transforms a shared `StateRecord`. Edges are either unconditional (several
//! of them fan out to parallel branches) or conditional on the state; an
//! approval rejection is expressed as a conditional edge back to the step that
//! regenerates the artifact.
//!
//! The `GraphEngine` runs one instance's steps strictly one at a time from the
//! entry step until no branch has work left.

pub mod edge;
pub mod executor;
pub mod router;
pub mod step;

pub use edge::{evaluate_condition, Edge, Route, Target};
pub use executor::{ExecutionResult, GraphBuilder, GraphEngine, RunFailure, StepRecord};
pub use router::{EdgeRouter, Routing};
pub use step::StepDescriptor;
