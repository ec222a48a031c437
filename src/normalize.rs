//! Converts a parsed provider payload into a `TaskRequest`, or flags it as
//! ignored, per the trigger rules in SPEC_FULL.md §4.2.

use serde::Deserialize;
use serde_json::Value;

use crate::model::{Provider, SourceMetadata, TaskRequest, ThreadOrigin};

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("payload missing required field: {0}")]
    MissingField(&'static str),
}

pub enum Normalized {
    Task(TaskRequest),
    Ignored { reason: &'static str },
}

const AGENT_HANDLE: &str = "taskforge-bot";

pub fn normalize(
    provider: Provider,
    installation_id: &str,
    body: &Value,
    delivery_id: &str,
) -> Result<Normalized, NormalizeError> {
    match provider {
        Provider::CodeForge => normalize_code_forge(installation_id, body, delivery_id),
        Provider::Tracker => normalize_tracker(installation_id, body, delivery_id),
        Provider::Chat => normalize_chat(installation_id, body, delivery_id),
        Provider::ErrorMonitor => normalize_error_monitor(installation_id, body, delivery_id),
    }
}

fn str_field<'a>(body: &'a Value, field: &'static str) -> Result<&'a str, NormalizeError> {
    body.get(field)
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingField(field))
}

fn mentions_agent(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains(&format!("@{AGENT_HANDLE}")) || lower.contains("/agent")
}

#[derive(Deserialize)]
struct CodeForgeEvent {
    action: Option<String>,
    repository: Option<RepoRef>,
    #[serde(default)]
    is_bot_actor: bool,
    number: Option<i64>,
    comment: Option<CommentRef>,
    body: Option<String>,
    /// Present (an object, possibly empty) only when the event concerns a
    /// pull request rather than a plain issue.
    #[serde(default)]
    pull_request: Option<Value>,
}

#[derive(Deserialize)]
struct RepoRef {
    full_name: String,
}

#[derive(Deserialize)]
struct CommentRef {
    id: String,
    body: String,
}

fn normalize_code_forge(
    installation_id: &str,
    body: &Value,
    delivery_id: &str,
) -> Result<Normalized, NormalizeError> {
    let event: CodeForgeEvent =
        serde_json::from_value(body.clone()).map_err(|_| NormalizeError::MissingField("body"))?;

    if event.is_bot_actor {
        return Ok(Normalized::Ignored { reason: "bot-actor" });
    }

    let text = event
        .comment
        .as_ref()
        .map(|c| c.body.clone())
        .or_else(|| event.body.clone())
        .unwrap_or_default();

    let is_new_pr_opened = event.action.as_deref() == Some("opened");
    if !mentions_agent(&text) && !is_new_pr_opened {
        return Ok(Normalized::Ignored {
            reason: "no-trigger",
        });
    }

    let repo = event.repository.ok_or(NormalizeError::MissingField("repository"))?;
    let fingerprint = format!(
        "code-forge:{}:{}",
        installation_id,
        event.comment.as_ref().map(|c| c.id.as_str()).unwrap_or(delivery_id)
    );
    let is_pull_request = event.pull_request.is_some();

    Ok(Normalized::Task(TaskRequest {
        provider: Provider::CodeForge,
        installation_id: installation_id.to_string(),
        actor_handle: "unknown".to_string(),
        message: text,
        fingerprint,
        priority: if is_new_pr_opened { 10 } else { 5 },
        source: SourceMetadata {
            repo_full_name: Some(repo.full_name),
            issue_or_pr_number: event.number,
            comment_id: event.comment.map(|c| c.id),
            is_pull_request: Some(is_pull_request),
            ..Default::default()
        },
    }))
}

#[derive(Deserialize)]
struct TrackerEvent {
    issue_key: String,
    project: String,
    assignee: Option<String>,
    labels: Vec<String>,
    summary: Option<String>,
}

fn normalize_tracker(
    installation_id: &str,
    body: &Value,
    _delivery_id: &str,
) -> Result<Normalized, NormalizeError> {
    let event: TrackerEvent =
        serde_json::from_value(body.clone()).map_err(|_| NormalizeError::MissingField("body"))?;

    let assigned_to_agent = event.assignee.as_deref() == Some(AGENT_HANDLE);
    let watched_label = event.labels.iter().any(|l| l == "ai-agent");
    if !assigned_to_agent && !watched_label {
        return Ok(Normalized::Ignored {
            reason: "no-trigger",
        });
    }

    let fingerprint = format!("tracker:{}:{}", installation_id, event.issue_key);
    Ok(Normalized::Task(TaskRequest {
        provider: Provider::Tracker,
        installation_id: installation_id.to_string(),
        actor_handle: "unknown".to_string(),
        message: event.summary.unwrap_or_default(),
        fingerprint,
        priority: 10,
        source: SourceMetadata {
            issue_key: Some(event.issue_key),
            project: Some(event.project),
            ..Default::default()
        },
    }))
}

#[derive(Deserialize)]
struct ChatEvent {
    channel_id: String,
    #[serde(rename = "ts")]
    timestamp: String,
    #[serde(default)]
    thread_ts: Option<String>,
    text: String,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    is_direct_message: bool,
}

fn normalize_chat(
    installation_id: &str,
    body: &Value,
    _delivery_id: &str,
) -> Result<Normalized, NormalizeError> {
    let event: ChatEvent =
        serde_json::from_value(body.clone()).map_err(|_| NormalizeError::MissingField("body"))?;

    if event.bot_id.as_deref() == Some(AGENT_HANDLE) {
        return Ok(Normalized::Ignored { reason: "self-echo" });
    }
    if !mentions_agent(&event.text) && !event.is_direct_message {
        return Ok(Normalized::Ignored {
            reason: "no-trigger",
        });
    }

    let (thread_id, thread_origin) = match &event.thread_ts {
        Some(parent) => (parent.clone(), ThreadOrigin::Parent),
        None => (event.timestamp.clone(), ThreadOrigin::SelfTimestamp),
    };

    let fingerprint = format!("chat:{}:{}", installation_id, event.timestamp);
    Ok(Normalized::Task(TaskRequest {
        provider: Provider::Chat,
        installation_id: installation_id.to_string(),
        actor_handle: "unknown".to_string(),
        message: event.text,
        fingerprint,
        priority: 1,
        source: SourceMetadata {
            channel_id: Some(event.channel_id),
            thread_id: Some(thread_id),
            thread_origin: Some(thread_origin),
            ..Default::default()
        },
    }))
}

fn normalize_error_monitor(
    installation_id: &str,
    body: &Value,
    _delivery_id: &str,
) -> Result<Normalized, NormalizeError> {
    let is_new_or_regression = matches!(
        str_field(body, "event_type").ok(),
        Some("issue.created") | Some("issue.regression")
    );
    if !is_new_or_regression {
        return Ok(Normalized::Ignored {
            reason: "no-trigger",
        });
    }
    let org_slug = str_field(body, "org_slug")?.to_string();
    let project_slug = str_field(body, "project_slug")?.to_string();
    let issue_id = str_field(body, "issue_id")?.to_string();
    let title = body
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let fingerprint = format!("error-monitor:{installation_id}:{issue_id}");
    Ok(Normalized::Task(TaskRequest {
        provider: Provider::ErrorMonitor,
        installation_id: installation_id.to_string(),
        actor_handle: "monitor".to_string(),
        message: title,
        fingerprint,
        priority: 3,
        source: SourceMetadata {
            org_slug: Some(org_slug),
            project_slug: Some(project_slug),
            monitor_issue_id: Some(issue_id),
            ..Default::default()
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn code_forge_pr_opened_triggers() {
        let body = json!({
            "action": "opened",
            "repository": {"full_name": "acme/widgets"},
            "number": 42,
        });
        match normalize(Provider::CodeForge, "inst-1", &body, "d1").unwrap() {
            Normalized::Task(req) => {
                assert_eq!(req.source.issue_or_pr_number, Some(42));
                assert_eq!(req.fingerprint, "code-forge:inst-1:d1");
            }
            Normalized::Ignored { .. } => panic!("expected a task"),
        }
    }

    #[test]
    fn code_forge_pull_request_sets_is_pull_request() {
        let body = json!({
            "action": "opened",
            "repository": {"full_name": "acme/widgets"},
            "number": 7,
            "pull_request": {},
        });
        match normalize(Provider::CodeForge, "inst-1", &body, "d5").unwrap() {
            Normalized::Task(req) => assert_eq!(req.source.is_pull_request, Some(true)),
            Normalized::Ignored { .. } => panic!("expected a task"),
        }
    }

    #[test]
    fn code_forge_issue_comment_is_not_pull_request() {
        let body = json!({
            "action": "created",
            "repository": {"full_name": "acme/widgets"},
            "comment": {"id": "c9", "body": "@taskforge-bot please look"},
        });
        match normalize(Provider::CodeForge, "inst-1", &body, "d6").unwrap() {
            Normalized::Task(req) => assert_eq!(req.source.is_pull_request, Some(false)),
            Normalized::Ignored { .. } => panic!("expected a task"),
        }
    }

    #[test]
    fn code_forge_unrelated_comment_ignored() {
        let body = json!({
            "action": "created",
            "repository": {"full_name": "acme/widgets"},
            "comment": {"id": "c1", "body": "looks good to me"},
        });
        assert!(matches!(
            normalize(Provider::CodeForge, "inst-1", &body, "d2").unwrap(),
            Normalized::Ignored { .. }
        ));
    }

    #[test]
    fn chat_self_echo_ignored() {
        let body = json!({
            "channel_id": "C1",
            "ts": "1.1",
            "text": "done",
            "bot_id": "taskforge-bot",
        });
        assert!(matches!(
            normalize(Provider::Chat, "inst-1", &body, "d3").unwrap(),
            Normalized::Ignored { reason: "self-echo" }
        ));
    }

    #[test]
    fn chat_thread_origin_parent_when_present() {
        let body = json!({
            "channel_id": "C1",
            "ts": "2.2",
            "thread_ts": "1.1",
            "text": "@taskforge-bot help",
        });
        match normalize(Provider::Chat, "inst-1", &body, "d4").unwrap() {
            Normalized::Task(req) => {
                assert_eq!(req.source.thread_id, Some("1.1".to_string()));
                assert_eq!(req.source.thread_origin, Some(ThreadOrigin::Parent));
            }
            Normalized::Ignored { .. } => panic!("expected a task"),
        }
    }
}
