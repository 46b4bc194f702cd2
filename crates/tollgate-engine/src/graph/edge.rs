use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use tollgate_core::state::StateRecord;

/// Where an edge leads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Step(String),
    /// The terminal marker: this branch of the run ends here.
    End,
}

impl Target {
    pub fn step(id: impl Into<String>) -> Self {
        Self::Step(id.into())
    }
}

impl From<&str> for Target {
    fn from(id: &str) -> Self {
        Self::Step(id.to_string())
    }
}

impl From<String> for Target {
    fn from(id: String) -> Self {
        Self::Step(id)
    }
}

pub type Predicate = Arc<dyn Fn(&StateRecord) -> bool + Send + Sync>;
pub type Selector = Arc<dyn Fn(&StateRecord) -> Target + Send + Sync>;

/// Resolution rule of an edge.
#[derive(Clone)]
pub enum Route {
    /// Always traverse. Several of these from one step fan out.
    Always(Target),
    /// Traverse if the predicate holds.
    When { predicate: Predicate, to: Target },
    /// Traverse if a simple expression matches (see [`evaluate_condition`]).
    Conditional { expr: String, to: Target },
    /// Pick the target from the state.
    Select(Selector),
}

impl Route {
    pub fn is_conditional(&self) -> bool {
        !matches!(self, Self::Always(_))
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always(to) => f.debug_tuple("Always").field(to).finish(),
            Self::When { to, .. } => f.debug_struct("When").field("to", to).finish(),
            Self::Conditional { expr, to } => f
                .debug_struct("Conditional")
                .field("expr", expr)
                .field("to", to)
                .finish(),
            Self::Select(_) => f.write_str("Select"),
        }
    }
}

/// An edge leaving a step.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Source step id.
    pub from: String,
    pub route: Route,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<Target>) -> Self {
        Self {
            from: from.into(),
            route: Route::Always(to.into()),
        }
    }

    /// Create an unconditional edge to the terminal marker.
    pub fn to_end(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            route: Route::Always(Target::End),
        }
    }

    /// Create an edge guarded by a predicate over the state.
    pub fn when<F>(from: impl Into<String>, to: impl Into<Target>, predicate: F) -> Self
    where
        F: Fn(&StateRecord) -> bool + Send + Sync + 'static,
    {
        Self {
            from: from.into(),
            route: Route::When {
                predicate: Arc::new(predicate),
                to: to.into(),
            },
        }
    }

    /// Create an edge guarded by an expression.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<Target>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            route: Route::Conditional {
                expr: expr.into(),
                to: to.into(),
            },
        }
    }

    /// Create an edge whose target is computed from the state.
    pub fn select<F>(from: impl Into<String>, selector: F) -> Self
    where
        F: Fn(&StateRecord) -> Target + Send + Sync + 'static,
    {
        Self {
            from: from.into(),
            route: Route::Select(Arc::new(selector)),
        }
    }

    /// The statically known target, if any.
    pub fn static_target(&self) -> Option<&Target> {
        match &self.route {
            Route::Always(to) | Route::When { to, .. } | Route::Conditional { to, .. } => Some(to),
            Route::Select(_) => None,
        }
    }
}

/// Evaluate a simple conditional expression against the state.
///
/// Supported expressions:
/// - `key == "value"` / `key != "value"`: string match
/// - `key == true`, `key == 3`: bool and number literals
/// - `key contains "substr"`: substring match
/// - `key`: field is present and truthy
/// - `!key`: field is missing or falsy
///
/// Returns `false` for unparseable expressions.
pub fn evaluate_condition(expr: &str, state: &StateRecord) -> bool {
    let expr = expr.trim();

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return state
            .get_str(key)
            .is_some_and(|s| s.contains(substr.trim_matches('"')));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return state.get(key).is_some_and(|v| !literal_eq(v, value));
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return state.get(key).is_some_and(|v| literal_eq(v, value));
    }

    // !key
    if let Some(key) = expr.strip_prefix('!') {
        let key = key.trim();
        return is_identifier(key) && !truthy(state.get(key));
    }

    // key
    if is_identifier(expr) {
        return truthy(state.get(expr));
    }

    false
}

/// Parse `key OP value` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if !is_identifier(key) {
        return None;
    }
    Some((key, val.trim()))
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

fn literal_eq(value: &Value, literal: &str) -> bool {
    if literal.len() >= 2 && literal.starts_with('"') && literal.ends_with('"') {
        return value.as_str() == Some(&literal[1..literal.len() - 1]);
    }
    match literal {
        "true" => value.as_bool() == Some(true),
        "false" => value.as_bool() == Some(false),
        "null" => value.is_null(),
        other => match other.parse::<f64>() {
            Ok(n) => value.as_f64() == Some(n),
            Err(_) => value.as_str() == Some(other),
        },
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}
