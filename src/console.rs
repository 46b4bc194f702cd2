use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tollgate_core::approval::{ApprovalDecision, ApprovalRequest};
use tollgate_engine::ApprovalBroker;

/// Answer approval requests from the terminal.
///
/// Requests are handled one at a time; a request raised while another prompt
/// is open waits in the listener queue.
pub async fn spawn_listener(broker: Arc<ApprovalBroker>) -> JoinHandle<()> {
    let mut listener = broker.register_listener().await;
    tokio::spawn(async move {
        while let Some(request) = listener.recv().await {
            eprintln!("{}", describe(&request));
            let prompt = request.subject.clone();
            let decision = tokio::task::spawn_blocking(move || ask(&prompt)).await;
            match decision {
                Ok(Some(decision)) => {
                    if !broker.respond(request.id.as_str(), decision).await {
                        eprintln!("[approval {} is no longer pending]", request.id.short());
                    }
                }
                Ok(None) => debug!(request_id = %request.id, "Prompt closed without a decision"),
                Err(e) => warn!(error = %e, "Approval prompt task failed"),
            }
        }
    })
}

fn describe(request: &ApprovalRequest) -> String {
    let payload = match &request.payload {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    format!(
        "\n[APPROVAL {}] {}\n{}",
        request.id.short(),
        request.subject,
        payload
    )
}

/// Blocking prompt. `None` when the terminal is unavailable.
fn ask(subject: &str) -> Option<ApprovalDecision> {
    let approved = dialoguer::Confirm::new()
        .with_prompt(format!("Approve {subject}?"))
        .default(true)
        .interact()
        .ok()?;
    if approved {
        return Some(ApprovalDecision::Approved);
    }
    let feedback: String = dialoguer::Input::new()
        .with_prompt("Feedback")
        .allow_empty(true)
        .interact_text()
        .ok()?;
    Some(ApprovalDecision::from_parts(false, Some(feedback)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tollgate_core::approval::CorrelationId;
    use tollgate_core::types::InstanceId;

    fn request(payload: serde_json::Value) -> ApprovalRequest {
        ApprovalRequest {
            id: CorrelationId::from_string("a1b2c3d4-1-inst"),
            instance_id: InstanceId::from_string("inst"),
            subject: "image".into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn describe_plain_and_structured_payloads() {
        let text = describe(&request(json!("https://images.test/1.png")));
        assert!(text.contains("[APPROVAL a1b2c3d4] image"));
        assert!(text.ends_with("https://images.test/1.png"));

        let text = describe(&request(json!({"image": "u", "prompt": "p"})));
        assert!(text.contains("\"prompt\": \"p\""));
    }
}
