use tracing::{debug, warn};

use tollgate_core::error::{Result, TollgateError};
use tollgate_core::state::StateRecord;

use super::edge::{evaluate_condition, Edge, Route, Target};

/// Outcome of routing out of one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routing {
    /// Steps to schedule, in edge registration order.
    pub next: Vec<String>,
    /// This branch reached the terminal marker (or a step with no edges).
    pub terminal: bool,
}

impl Routing {
    /// The branch ends here and nothing further is scheduled.
    pub fn is_dead_end(&self) -> bool {
        self.next.is_empty()
    }

    fn push(&mut self, target: &Target) {
        match target {
            Target::End => self.terminal = true,
            Target::Step(id) => {
                if !self.next.contains(id) {
                    self.next.push(id.clone());
                }
            }
        }
    }
}

/// Decides which step(s) run after a step finishes.
///
/// Every unconditional edge out of a step is followed, in registration order.
/// Of the conditional edges (predicate, expression, selector) only the first
/// that matches is followed. A step with no outgoing edges is terminal. A step
/// whose edges are all conditional and none match is a routing error.
#[derive(Debug, Clone, Default)]
pub struct EdgeRouter {
    edges: Vec<Edge>,
}

impl EdgeRouter {
    pub fn new(edges: Vec<Edge>) -> Self {
        Self { edges }
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edges of a step, in registration order.
    pub fn outgoing<'a>(&'a self, from: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == from)
    }

    pub fn route(&self, from: &str, state: &StateRecord) -> Result<Routing> {
        let mut routing = Routing::default();
        let mut has_edges = false;
        let mut has_always = false;
        let mut chosen: Option<Target> = None;

        for edge in self.outgoing(from) {
            has_edges = true;
            let candidate = match &edge.route {
                Route::Always(to) => {
                    has_always = true;
                    routing.push(to);
                    continue;
                }
                Route::When { predicate, to } => predicate(state).then(|| to.clone()),
                Route::Conditional { expr, to } => {
                    evaluate_condition(expr, state).then(|| to.clone())
                }
                Route::Select(selector) => Some(selector(state)),
            };

            if let Some(target) = candidate {
                match &chosen {
                    None => chosen = Some(target),
                    Some(first) => warn!(
                        step_id = %from,
                        taken = ?first,
                        ignored = ?target,
                        "Multiple conditional edges matched, taking the first"
                    ),
                }
            }
        }

        if !has_edges {
            debug!(step_id = %from, "No outgoing edges, branch complete");
            routing.terminal = true;
            return Ok(routing);
        }

        match chosen {
            Some(target) => routing.push(&target),
            None if !has_always => {
                return Err(TollgateError::NoRoute(from.to_string()));
            }
            None => {}
        }

        Ok(routing)
    }
}
