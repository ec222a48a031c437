//! Shared data types for the task lifecycle (see SPEC_FULL.md §3).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The external service that originated (or will receive) a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    CodeForge,
    Tracker,
    Chat,
    ErrorMonitor,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::CodeForge => "code-forge",
            Provider::Tracker => "tracker",
            Provider::Chat => "chat",
            Provider::ErrorMonitor => "error-monitor",
        }
    }

    pub fn from_path_segment(s: &str) -> Option<Self> {
        match s {
            "code-forge" => Some(Provider::CodeForge),
            "tracker" => Some(Provider::Tracker),
            "chat" => Some(Provider::Chat),
            "error-monitor" => Some(Provider::ErrorMonitor),
            _ => None,
        }
    }
}

/// Status lifecycle: `Queued -> Running -> {Completed | Failed | Cancelled}`,
/// with `AwaitingApproval` a reserved interior state between `Running` and
/// a terminal status. Transitions only ever move forward (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingApproval => "awaiting-approval",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => TaskStatus::Queued,
            "running" => TaskStatus::Running,
            "awaiting-approval" => TaskStatus::AwaitingApproval,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => return None,
        })
    }
}

/// Where a chat `TaskRequest`'s thread id came from (§4.2 open-question resolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadOrigin {
    Parent,
    SelfTimestamp,
}

/// Source-specific addressing metadata threaded from ingress through to the
/// Completion Router. Shape varies by provider; unused fields stay `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub repo_full_name: Option<String>,
    pub issue_or_pr_number: Option<i64>,
    pub comment_id: Option<String>,
    pub issue_key: Option<String>,
    pub project: Option<String>,
    pub channel_id: Option<String>,
    pub thread_id: Option<String>,
    pub thread_origin: Option<ThreadOrigin>,
    pub org_slug: Option<String>,
    pub project_slug: Option<String>,
    pub monitor_issue_id: Option<String>,
    /// Code-forge only: `Some(true)` for a pull request, `Some(false)` for a
    /// plain issue, `None` for providers where the distinction is moot (§4.10).
    pub is_pull_request: Option<bool>,
}

/// Normalized webhook output; lives only until a `Task` is created (§3).
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub provider: Provider,
    pub installation_id: String,
    pub actor_handle: String,
    pub message: String,
    pub fingerprint: String,
    pub priority: i32,
    pub source: SourceMetadata,
}

/// The durable unit of work (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub installation_id: String,
    pub provider: Provider,
    pub status: TaskStatus,
    pub priority: i32,
    pub input_message: String,
    pub source: SourceMetadata,
    pub fingerprint: String,
    pub execution_metadata: serde_json::Value,
    pub output_text: Option<String>,
    pub error_text: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: Decimal,
    pub post_status: Option<String>,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub dequeued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_id: Uuid, req: &TaskRequest) -> Self {
        Self {
            task_id,
            installation_id: req.installation_id.clone(),
            provider: req.provider,
            status: TaskStatus::Queued,
            priority: req.priority,
            input_message: req.message.clone(),
            source: req.source.clone(),
            fingerprint: req.fingerprint.clone(),
            execution_metadata: serde_json::Value::Null,
            output_text: None,
            error_text: None,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: Decimal::ZERO,
            post_status: None,
            attempt_count: 0,
            created_at: Utc::now(),
            dequeued_at: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A metrics delta applied as the CLI Driver streams `result` events (§4.3).
#[derive(Debug, Clone, Default)]
pub struct MetricsDelta {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: Decimal,
}

/// The outbound message posted back to the source (§3).
#[derive(Debug, Clone)]
pub struct Artifact {
    pub task_id: Uuid,
    pub provider: Provider,
    pub target: SourceMetadata,
    pub body: String,
    pub idempotency_key: String,
}

/// An installation's credentials for one external service (§3).
#[derive(Debug, Clone)]
pub struct Installation {
    pub installation_id: String,
    pub service_kind: Provider,
    pub org_handle: String,
    pub access_token: String,
    pub webhook_secret: String,
}
