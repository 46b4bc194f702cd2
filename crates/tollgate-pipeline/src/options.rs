use std::time::Duration;

use tollgate_core::config::AppConfig;

/// Which review stages the flyer pipeline runs.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Put the plan through an approval loop before fanning out.
    pub plan_review: bool,
    /// Put the text through an approval loop. When off, text is approved as generated.
    pub text_review: bool,
    /// Rejections allowed per artifact (0 = unbounded).
    pub max_revisions: u64,
    pub approval_timeout: Option<Duration>,
    pub history_limit: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            plan_review: false,
            text_review: true,
            max_revisions: 0,
            approval_timeout: None,
            history_limit: 256,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            plan_review: config.workflow.plan_review,
            text_review: config.workflow.text_review,
            max_revisions: config.workflow.max_revisions,
            approval_timeout: config.approval.timeout(),
            history_limit: config.workflow.history_limit,
        }
    }

    /// Whether another revision is allowed after `rejections` rejections.
    pub fn may_revise(&self, rejections: u64) -> bool {
        self.max_revisions == 0 || rejections <= self.max_revisions
    }
}
