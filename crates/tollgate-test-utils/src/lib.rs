//! Scripted collaborators and fixtures shared by Tollgate's tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;

use tollgate_core::approval::{ApprovalDecision, ApprovalRequest};
use tollgate_core::error::{Result, TollgateError};
use tollgate_core::state::StateRecord;
use tollgate_core::traits::{ContentGenerator, OutputSink, Step, StepContext};
use tollgate_core::types::CompletionRequest;
use tollgate_engine::broker::ApprovalBroker;

enum Reply {
    Text(String),
    Fail(String),
}

struct Rule {
    needle: String,
    replies: VecDeque<Reply>,
}

/// A content generator answering from a script.
///
/// Completions are matched by a substring of the system prompt; each rule
/// replays its replies in order and repeats the last one. Images are
/// numbered references: `https://images.test/1.png`, `.../2.png`, ...
#[derive(Default)]
pub struct ScriptedGenerator {
    rules: Mutex<Vec<Rule>>,
    requests: Mutex<Vec<CompletionRequest>>,
    image_prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `text` to completions whose system prompt contains `needle`.
    pub fn reply(self, needle: &str, text: &str) -> Self {
        self.push(needle, Reply::Text(text.to_string()));
        self
    }

    /// Fail completions whose system prompt contains `needle`.
    pub fn fail(self, needle: &str, message: &str) -> Self {
        self.push(needle, Reply::Fail(message.to_string()));
        self
    }

    fn push(&self, needle: &str, reply: Reply) {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| r.needle == needle) {
            Some(rule) => rule.replies.push_back(reply),
            None => rules.push(Rule {
                needle: needle.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
    }

    /// Every completion request received, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Completion requests whose system prompt contains `needle`.
    pub fn requests_matching(&self, needle: &str) -> Vec<CompletionRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.system.contains(needle))
            .collect()
    }

    pub fn image_prompts(&self) -> Vec<String> {
        self.image_prompts.lock().unwrap().clone()
    }

    fn answer(&self, request: &CompletionRequest) -> Result<String> {
        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|r| request.system.contains(&r.needle)) else {
            return Ok("ok".to_string());
        };
        let reply = if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            None
        };
        let reply = reply.as_ref().or(rule.replies.front());
        match reply {
            Some(Reply::Text(t)) => Ok(t.clone()),
            Some(Reply::Fail(m)) => Err(TollgateError::Generation(m.clone())),
            None => Ok("ok".to_string()),
        }
    }
}

impl ContentGenerator for ScriptedGenerator {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        let result = self.answer(&request);
        self.requests.lock().unwrap().push(request);
        Box::pin(async move { result })
    }

    fn generate_image(&self, prompt: String) -> BoxFuture<'_, Result<String>> {
        let n = {
            let mut prompts = self.image_prompts.lock().unwrap();
            prompts.push(prompt);
            prompts.len()
        };
        Box::pin(async move { Ok(format!("https://images.test/{n}.png")) })
    }
}

/// A broker listener that answers requests from a script.
///
/// The script receives the request and its 1-based position among requests
/// with the same subject. Returning `None` leaves the request pending.
pub struct AutoResponder {
    seen: Arc<Mutex<Vec<ApprovalRequest>>>,
    task: JoinHandle<()>,
}

impl AutoResponder {
    pub async fn spawn<F>(broker: Arc<ApprovalBroker>, mut decide: F) -> Self
    where
        F: FnMut(&ApprovalRequest, usize) -> Option<ApprovalDecision> + Send + 'static,
    {
        let mut listener = broker.register_listener().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let task = tokio::spawn(async move {
            let mut per_subject: HashMap<String, usize> = HashMap::new();
            while let Some(req) = listener.recv().await {
                let nth = {
                    let n = per_subject.entry(req.subject.clone()).or_default();
                    *n += 1;
                    *n
                };
                log.lock().unwrap().push(req.clone());
                if let Some(decision) = decide(&req, nth) {
                    broker.respond(req.id.as_str(), decision).await;
                }
            }
        });
        Self { seen, task }
    }

    /// Approve everything.
    pub async fn approve_all(broker: Arc<ApprovalBroker>) -> Self {
        Self::spawn(broker, |_, _| Some(ApprovalDecision::Approved)).await
    }

    /// Reject the first `times` requests for `subject` with `feedback`, approve
    /// everything else.
    pub async fn reject_first(
        broker: Arc<ApprovalBroker>,
        subject: &str,
        times: usize,
        feedback: &str,
    ) -> Self {
        let subject = subject.to_string();
        let feedback = feedback.to_string();
        Self::spawn(broker, move |req, nth| {
            if req.subject == subject && nth <= times {
                Some(ApprovalDecision::Rejected {
                    feedback: feedback.clone(),
                })
            } else {
                Some(ApprovalDecision::Approved)
            }
        })
        .await
    }

    /// Reject every request for `subject`, approve everything else.
    pub async fn always_reject(broker: Arc<ApprovalBroker>, subject: &str, feedback: &str) -> Self {
        Self::reject_first(broker, subject, usize::MAX, feedback).await
    }

    /// Never answer.
    pub async fn silent(broker: Arc<ApprovalBroker>) -> Self {
        Self::spawn(broker, |_, _| None).await
    }

    /// Requests delivered so far.
    pub fn seen(&self) -> Vec<ApprovalRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn seen_subjects(&self) -> Vec<String> {
        self.seen().into_iter().map(|r| r.subject).collect()
    }
}

impl Drop for AutoResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A step that counts its executions and bumps `{step_id}_runs` in the state.
#[derive(Clone, Default)]
pub struct CountingStep {
    calls: Arc<AtomicUsize>,
}

impl CountingStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Step for CountingStep {
    fn execute<'a>(
        &'a self,
        state: &'a mut StateRecord,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<()>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        state.bump(&format!("{}_runs", ctx.step_id));
        Box::pin(async { Ok(()) })
    }
}

/// An output sink that keeps everything in memory.
#[derive(Default)]
pub struct RecordingSink {
    outputs: Mutex<Vec<Value>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outputs(&self) -> Vec<Value> {
        self.outputs.lock().unwrap().clone()
    }
}

impl OutputSink for RecordingSink {
    fn write(&self, output: &Value) -> BoxFuture<'_, Result<String>> {
        let location = {
            let mut outputs = self.outputs.lock().unwrap();
            outputs.push(output.clone());
            format!("memory://{}", outputs.len())
        };
        Box::pin(async move { Ok(location) })
    }
}

/// Write `contents` to a `tollgate.toml` inside a fresh temp dir.
pub fn config_file(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("tollgate.toml");
    std::fs::write(&path, contents).expect("write config");
    (dir, path)
}

/// A flyer text reply in the JSON shape the text step expects.
pub fn text_reply(headline: &str, subtext: &str, position: &str) -> String {
    serde_json::json!({
        "headline": headline,
        "subtext": subtext,
        "position": position,
    })
    .to_string()
}
