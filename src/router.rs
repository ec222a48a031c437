//! Completion Router (§4.10): dispatches the terminal artifact back to the
//! originating service, by provider/surface, with Redis-backed idempotency
//! and loop-prevention bookkeeping.
//!
//! Dispatch is a lookup-then-forward over a small table, the same shape the
//! teacher's `ChannelManager` uses to look up a named channel and forward
//! `respond`/`broadcast` to it; here the lookup key is `(provider, surface)`
//! and the payload is an `Artifact` instead of an `OutgoingResponse`.

use reqwest::Method;
use serde_json::json;
use uuid::Uuid;

use crate::gateway::{GatewayError, Request, ServiceGateway};
use crate::model::{Artifact, Provider, SourceMetadata};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("artifact missing required addressing field: {0}")]
    MissingTarget(&'static str),
    #[error("installation lookup failed: {0}")]
    InstallationLookup(String),
    #[error("no installation record for {0}")]
    MissingInstallation(String),
}

pub type Result<T> = std::result::Result<T, RouterError>;

const DEDUP_TTL_SECONDS: u64 = 24 * 60 * 60;

pub struct CompletionRouter {
    gateway: ServiceGateway,
    redis: redis::aio::ConnectionManager,
}

impl CompletionRouter {
    pub fn new(gateway: ServiceGateway, redis: redis::aio::ConnectionManager) -> Self {
        Self { gateway, redis }
    }

    pub async fn dispatch(&self, installation_id: &str, access_token: &str, artifact: &Artifact) -> Result<PostOutcome> {
        if self.already_posted(&artifact.idempotency_key).await? {
            return Ok(PostOutcome::Deduplicated);
        }

        let (path, method) = route(artifact.provider, &artifact.target)?;
        let body = json!({ "body": artifact.body });

        let response = self
            .gateway
            .call(
                artifact.provider,
                installation_id,
                Request {
                    method,
                    path: &path,
                    body: Some(body),
                    access_token,
                },
            )
            .await?;

        self.mark_posted(&artifact.idempotency_key).await?;
        if let Some(message_id) = response.get("id").and_then(|v| v.as_str()) {
            self.record_conversation(installation_id, &artifact.target, &artifact.task_id.to_string(), message_id)
                .await?;
        }

        Ok(PostOutcome::Posted)
    }

    async fn already_posted(&self, idempotency_key: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(dedup_key(idempotency_key))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn mark_posted(&self, idempotency_key: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(dedup_key(idempotency_key))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(DEDUP_TTL_SECONDS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Upsert a loop-prevention marker the Event Normalizer reads before
    /// accepting a new webhook delivery (§4.2, §4.10).
    async fn record_conversation(
        &self,
        installation_id: &str,
        target: &SourceMetadata,
        task_id: &str,
        message_id: &str,
    ) -> Result<()> {
        let Some(thread) = target.thread_id.as_deref().or(target.comment_id.as_deref()) else {
            return Ok(());
        };
        let mut conn = self.redis.clone();
        let _: () = redis::cmd("HSET")
            .arg(conversation_key(installation_id, thread))
            .arg("last_task_id")
            .arg(task_id)
            .arg("last_message_id")
            .arg(message_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    Posted,
    Deduplicated,
}

/// Strategy-specific idempotency key for a completion post (§4.10): a
/// code-forge pull-request review comment keys on the task id alone, every
/// other posting strategy keys on the task id plus a `:post` suffix.
pub fn idempotency_key(provider: Provider, target: &SourceMetadata, task_id: Uuid) -> String {
    match (provider, target.is_pull_request) {
        (Provider::CodeForge, Some(true)) => task_id.to_string(),
        _ => format!("{task_id}:post"),
    }
}

fn dedup_key(idempotency_key: &str) -> String {
    format!("taskforge:post-dedup:{idempotency_key}")
}

fn conversation_key(installation_id: &str, thread: &str) -> String {
    format!("taskforge:conversation:{installation_id}:{thread}")
}

/// Per-(provider, source shape) posting strategy (§4.10).
fn route(provider: Provider, target: &SourceMetadata) -> Result<(String, Method)> {
    match provider {
        Provider::CodeForge => {
            let repo = target.repo_full_name.as_deref().ok_or(RouterError::MissingTarget("repo_full_name"))?;
            let number = target.issue_or_pr_number.ok_or(RouterError::MissingTarget("issue_or_pr_number"))?;
            if target.is_pull_request == Some(true) {
                Ok((format!("/code-forge/repos/{repo}/pulls/{number}/reviews"), Method::POST))
            } else {
                Ok((format!("/code-forge/repos/{repo}/issues/{number}/comments"), Method::POST))
            }
        }
        Provider::Tracker => {
            let key = target.issue_key.as_deref().ok_or(RouterError::MissingTarget("issue_key"))?;
            Ok((format!("/tracker/issues/{key}/comments"), Method::POST))
        }
        Provider::Chat => {
            let channel = target.channel_id.as_deref().ok_or(RouterError::MissingTarget("channel_id"))?;
            match &target.thread_id {
                Some(thread) => Ok((format!("/chat/channels/{channel}/messages?thread={thread}"), Method::POST)),
                None => Ok((format!("/chat/channels/{channel}/messages"), Method::POST)),
            }
        }
        Provider::ErrorMonitor => {
            let issue = target.monitor_issue_id.as_deref().ok_or(RouterError::MissingTarget("monitor_issue_id"))?;
            Ok((format!("/error-monitor/issues/{issue}/notes"), Method::POST))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_forge_routes_to_issue_comments() {
        let target = SourceMetadata {
            repo_full_name: Some("acme/widgets".into()),
            issue_or_pr_number: Some(42),
            is_pull_request: Some(false),
            ..Default::default()
        };
        let (path, method) = route(Provider::CodeForge, &target).unwrap();
        assert_eq!(path, "/code-forge/repos/acme/widgets/issues/42/comments");
        assert_eq!(method, Method::POST);
    }

    #[test]
    fn code_forge_pull_request_routes_to_review_comments() {
        let target = SourceMetadata {
            repo_full_name: Some("acme/widgets".into()),
            issue_or_pr_number: Some(42),
            is_pull_request: Some(true),
            ..Default::default()
        };
        let (path, method) = route(Provider::CodeForge, &target).unwrap();
        assert_eq!(path, "/code-forge/repos/acme/widgets/pulls/42/reviews");
        assert_eq!(method, Method::POST);
    }

    #[test]
    fn idempotency_key_for_pull_request_is_bare_task_id() {
        let task_id = Uuid::new_v4();
        let target = SourceMetadata {
            is_pull_request: Some(true),
            ..Default::default()
        };
        assert_eq!(idempotency_key(Provider::CodeForge, &target, task_id), task_id.to_string());
    }

    #[test]
    fn idempotency_key_for_issue_comment_has_post_suffix() {
        let task_id = Uuid::new_v4();
        let target = SourceMetadata {
            is_pull_request: Some(false),
            ..Default::default()
        };
        assert_eq!(idempotency_key(Provider::CodeForge, &target, task_id), format!("{task_id}:post"));
    }

    #[test]
    fn chat_without_thread_posts_to_channel() {
        let target = SourceMetadata {
            channel_id: Some("C1".into()),
            ..Default::default()
        };
        let (path, _) = route(Provider::Chat, &target).unwrap();
        assert_eq!(path, "/chat/channels/C1/messages");
    }

    #[test]
    fn missing_target_field_errors() {
        let target = SourceMetadata::default();
        assert!(route(Provider::Tracker, &target).is_err());
    }
}
