//! Worker Loop (§4.11): dequeues tasks, orchestrates the workspace, CLI
//! driver and completion router, and finalizes the Task Store and Flow Log.
//! Startup lease reconciliation (§5) mirrors the teacher's
//! `prune_stale_sessions` age-based sweep, retargeted from session idle time
//! to lease expiry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cli_driver::{CliDriver, CliError, Outcome, RunRequest};
use crate::flowlog::{FlowLog, Stream as LogStream};
use crate::model::{Artifact, MetricsDelta, Task, TaskStatus};
use crate::queue::{Queue, QueueEntry};
use crate::repo::WorkspaceManager;
use crate::router::{self, CompletionRouter, PostOutcome, RouterError};
use crate::store::{StoreError, TaskStore, TransitionPatch};

pub struct WorkerConfig {
    pub task_deadline: Duration,
    pub lease_seconds: u64,
    pub max_attempts: i32,
    pub dequeue_block: Duration,
    pub model: String,
    pub allowed_tools: Vec<String>,
}

pub struct Worker {
    pub queue: Arc<dyn Queue>,
    pub store: Arc<dyn TaskStore>,
    pub flow_log: Arc<FlowLog>,
    pub workspace: Arc<WorkspaceManager>,
    pub cli_driver: Arc<CliDriver>,
    pub router: Arc<CompletionRouter>,
    pub config: WorkerConfig,
}

/// Tasks stuck `running` past their lease are requeued (if attempts remain)
/// or failed outright; `awaiting-approval` tasks past their lease auto-fail
/// instead, per the decided open question in SPEC_FULL.md §9 (§5). A free
/// function over trait objects so it can be exercised against fakes without
/// standing up the full `Worker`.
async fn reconcile_expired_leases(
    store: &dyn TaskStore,
    queue: &dyn Queue,
    lease_seconds: u64,
    max_attempts: i32,
) -> anyhow::Result<()> {
    let expired = store.find_expired_leases(lease_seconds).await?;
    for task in expired {
        if task.status == TaskStatus::AwaitingApproval {
            store
                .transition(
                    task.task_id,
                    task.status,
                    TaskStatus::Failed,
                    TransitionPatch {
                        error_text: Some("approval-timeout".into()),
                        stamp_finished: true,
                        ..Default::default()
                    },
                )
                .await
                .ok();
            continue;
        }

        if task.attempt_count + 1 >= max_attempts {
            store
                .transition(
                    task.task_id,
                    task.status,
                    TaskStatus::Failed,
                    TransitionPatch {
                        error_text: Some("worker-lost".into()),
                        stamp_finished: true,
                        ..Default::default()
                    },
                )
                .await
                .ok();
        } else {
            queue.enqueue(task.task_id, task.priority).await.ok();
            store
                .transition(
                    task.task_id,
                    task.status,
                    TaskStatus::Queued,
                    TransitionPatch {
                        bump_attempt: true,
                        ..Default::default()
                    },
                )
                .await
                .ok();
        }
    }
    Ok(())
}

impl Worker {
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        reconcile_expired_leases(self.store.as_ref(), self.queue.as_ref(), self.config.lease_seconds, self.config.max_attempts).await
    }

    pub async fn run_forever(self: Arc<Self>) {
        loop {
            let entry = match self.queue.dequeue(self.config.dequeue_block).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "queue dequeue failed");
                    continue;
                }
            };

            let this = Arc::clone(&self);
            let task = tokio::spawn(async move {
                if let Err(e) = this.process_one(entry.clone()).await {
                    tracing::error!(task_id = %entry.task_id, error = %e, "worker iteration failed");
                    let _ = this.queue.nack(&entry, &e.to_string()).await;
                }
            });
            if let Err(panic) = task.await {
                tracing::error!(panic = %panic, "worker iteration panicked");
            }
        }
    }

    async fn process_one(&self, entry: QueueEntry) -> anyhow::Result<()> {
        let task_id = entry.task_id;
        let flow_log = self.flow_log.get_or_create(task_id).await?;
        flow_log
            .append(LogStream::Queue, &json!({"event": "dequeued", "attempt": entry.attempt}))
            .await?;

        let transition = self
            .store
            .transition(
                task_id,
                TaskStatus::Queued,
                TaskStatus::Running,
                TransitionPatch {
                    stamp_dequeued: true,
                    stamp_started: true,
                    ..Default::default()
                },
            )
            .await;
        if let Err(StoreError::CasFailed { .. }) = transition {
            // Duplicate delivery or an operator cancellation beat us here.
            self.queue.ack(&entry).await?;
            return Ok(());
        }
        transition?;

        let Some(task) = self.store.get(task_id).await? else {
            self.queue.ack(&entry).await?;
            return Ok(());
        };

        let cancel = CancellationToken::new();
        let outcome = self.run_task(&task, &flow_log, cancel).await;

        match outcome {
            Ok(artifact) => {
                let post_status = self.post_completion(&task, artifact).await;
                self.store
                    .transition(
                        task_id,
                        TaskStatus::Running,
                        TaskStatus::Completed,
                        TransitionPatch {
                            post_status: Some(post_status.to_string()),
                            stamp_finished: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                flow_log
                    .write_json("06-final-result.json", &json!({"status": "completed"}))
                    .await?;
            }
            Err(reason) => {
                self.store
                    .transition(
                        task_id,
                        TaskStatus::Running,
                        TaskStatus::Failed,
                        TransitionPatch {
                            error_text: Some(reason.clone()),
                            stamp_finished: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                flow_log
                    .write_json("06-final-result.json", &json!({"status": "failed", "reason": reason}))
                    .await?;
                self.post_failure(&task, &reason).await;
            }
        }

        self.queue.ack(&entry).await?;
        self.flow_log.release(task_id).await;
        Ok(())
    }

    async fn run_task(
        &self,
        task: &Task,
        flow_log: &crate::flowlog::FlowLogHandle,
        cancel: CancellationToken,
    ) -> std::result::Result<Artifact, String> {
        // Only code-forge tasks carry a repository; the other providers have
        // nothing to clone, so the CLI Driver runs directly against a bare
        // scratch directory instead (§4.11 step 4).
        let workspace_path = if task.source.repo_full_name.is_some() {
            self.acquire_workspace(task).await?
        } else {
            self.workspace.acquire_bare(task.task_id).await.map_err(|e| e.to_string())?
        };

        let result = self
            .cli_driver
            .run(
                RunRequest {
                    prompt: &task.input_message,
                    workspace: &workspace_path,
                    model: &self.config.model,
                    allowed_tools: &self.config.allowed_tools,
                    deadline: self.config.task_deadline,
                },
                flow_log,
                cancel,
            )
            .await
            .map_err(|e: CliError| e.to_string())?;

        self.store
            .append_metrics(
                task.task_id,
                MetricsDelta {
                    input_tokens: result.input_tokens,
                    output_tokens: result.output_tokens,
                    cost_usd: result.cost_usd,
                },
            )
            .await
            .map_err(|e| e.to_string())?;

        self.workspace.release(&workspace_path).await.ok();

        match result.outcome {
            Some(Outcome::EndedOk) if result.success => Ok(Artifact {
                task_id: task.task_id,
                provider: task.provider,
                target: task.source.clone(),
                body: result.output_text,
                idempotency_key: router::idempotency_key(task.provider, &task.source, task.task_id),
            }),
            Some(Outcome::TimedOut) => Err("timeout".to_string()),
            Some(Outcome::Cancelled) => Err("cancelled".to_string()),
            _ => Err(result.error_text.unwrap_or_else(|| "cli-error".to_string())),
        }
    }

    async fn acquire_workspace(&self, task: &Task) -> std::result::Result<PathBuf, String> {
        // Callers only reach this path when `repo_full_name` is set; see `run_task`.
        let repo = task
            .source
            .repo_full_name
            .as_deref()
            .expect("acquire_workspace called for a task with no repository");
        let target_ref = "main";
        let clone_url = format!("https://git.example.invalid/{repo}.git");
        self.workspace
            .acquire(&task.installation_id, repo, target_ref, &clone_url, task.task_id)
            .await
            .map_err(|e| e.to_string())
    }

    async fn post_completion(&self, task: &Task, artifact: Artifact) -> &'static str {
        match self.dispatch_with_token(task, &artifact).await {
            Ok(PostOutcome::Posted) => "posted",
            Ok(PostOutcome::Deduplicated) => "deduplicated",
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, error = %e, "completion post failed");
                "failed"
            }
        }
    }

    async fn post_failure(&self, task: &Task, reason: &str) {
        let artifact = Artifact {
            task_id: task.task_id,
            provider: task.provider,
            target: task.source.clone(),
            body: format!("Task {} failed: {reason}", task.task_id),
            idempotency_key: format!("{}:post-failure", task.task_id),
        };
        let _ = self.dispatch_with_token(task, &artifact).await;
    }

    async fn dispatch_with_token(&self, task: &Task, artifact: &Artifact) -> std::result::Result<PostOutcome, RouterError> {
        let installation = self
            .store
            .get_installation(&task.installation_id)
            .await
            .map_err(|e| RouterError::InstallationLookup(e.to_string()))?
            .ok_or_else(|| RouterError::MissingInstallation(task.installation_id.clone()))?;
        self.router
            .dispatch(&task.installation_id, &installation.access_token, artifact)
            .await
    }
}
