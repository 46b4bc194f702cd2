use thiserror::Error;

#[derive(Debug, Error)]
pub enum TollgateError {
    // Step errors
    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Step '{step}' read field '{field}' before any predecessor produced it")]
    MissingField { step: String, field: String },

    #[error("Step '{step}' expected field '{field}' to be {expected}")]
    FieldType {
        step: String,
        field: String,
        expected: &'static str,
    },

    // Graph errors
    #[error("Step not found in graph: {0}")]
    UnknownStep(String),

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Graph build error: {0}")]
    GraphBuild(String),

    #[error("No outgoing edge matched after step '{0}'")]
    NoRoute(String),

    #[error("Workflow cancelled")]
    Cancelled,

    // Content generation errors
    #[error("Generation request failed: {0}")]
    Generation(String),

    #[error("Generated payload could not be parsed: {0}")]
    Parse(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TollgateError {
    /// Shorthand for a step-level failure.
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Whether this error is the join/missing-field class of bug.
    pub fn is_missing_field(&self) -> bool {
        matches!(self, Self::MissingField { .. })
    }
}

pub type Result<T> = std::result::Result<T, TollgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_message_names_step_and_field() {
        let err = TollgateError::MissingField {
            step: "compose".into(),
            field: "caption".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("compose"));
        assert!(msg.contains("caption"));
        assert!(err.is_missing_field());
    }

    #[test]
    fn step_shorthand() {
        let err = TollgateError::step("plan", "upstream 500");
        assert_eq!(err.to_string(), "Step 'plan' failed: upstream 500");
        assert!(!err.is_missing_field());
    }
}
