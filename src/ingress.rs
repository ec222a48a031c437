//! Ingress Controller (§4.6): terminates provider webhooks, verifies
//! signatures, normalizes payloads, and enqueues tasks. HTTP composition
//! mirrors the teacher's `WebhookServer`: one `Router` fragment per
//! provider, merged into a single listener with a shared graceful shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::flowlog::{FlowLog, Stream as LogStream};
use crate::model::{Provider, Task};
use crate::normalize::{self, Normalized};
use crate::queue::Queue;
use crate::signature;
use crate::store::TaskStore;

pub struct IngressState {
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<dyn Queue>,
    pub flow_log: Arc<FlowLog>,
    pub webhook_secrets: HashMap<Provider, String>,
}

pub struct IngressServer {
    addr: SocketAddr,
    state: Arc<IngressState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IngressServer {
    pub fn new(addr: SocketAddr, state: Arc<IngressState>) -> Self {
        Self {
            addr,
            state,
            shutdown_tx: None,
            handle: None,
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/webhooks/{provider}", post(handle_webhook))
            .route("/healthz", axum::routing::get(healthz))
            .with_state(Arc::clone(&self.state))
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "ingress controller listening");

        let (tx, rx) = oneshot::channel();
        self.shutdown_tx = Some(tx);
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                    tracing::info!("ingress controller shutting down");
                })
                .await
            {
                tracing::error!(error = %e, "ingress controller error");
            }
        });
        self.handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn healthz(State(state): State<Arc<IngressState>>) -> StatusCode {
    if state.store.get(Uuid::nil()).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

async fn handle_webhook(
    State(state): State<Arc<IngressState>>,
    Path(provider_segment): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, Json<Value>) {
    let Some(provider) = Provider::from_path_segment(&provider_segment) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "unknown provider"})));
    };

    let installation_id = header_str(&headers, "x-installation-id").unwrap_or_default();
    let Some(secret) = state.webhook_secrets.get(&provider) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "no webhook secret configured"})),
        );
    };

    let sig = header_str(&headers, "x-signature");
    let ts = header_str(&headers, "x-timestamp").and_then(|s| s.parse::<i64>().ok());
    if let Err(e) = signature::verify(provider, secret, &body, sig, ts) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": e.to_string()})));
    }

    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))),
    };

    let delivery_id = header_str(&headers, "x-delivery-id").unwrap_or_default().to_string();

    let normalized = match normalize::normalize(provider, installation_id, &parsed, &delivery_id) {
        Ok(n) => n,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))),
    };

    let req = match normalized {
        Normalized::Ignored { reason } => {
            return (StatusCode::OK, Json(json!({"status": "ignored", "reason": reason})));
        }
        Normalized::Task(req) => req,
    };

    let task_id = Uuid::new_v4();
    let task = Task::new(task_id, &req);

    if let Ok(handle) = state.flow_log.get_or_create(task_id).await {
        let _ = handle.write_json("metadata.json", &json!({"status": "initializing"})).await;
        let _ = handle
            .write_json("01-input.json", &json!({"provider": provider.as_str(), "message": req.message}))
            .await;
        let _ = handle
            .append(LogStream::Webhook, &json!({"event": "received"}))
            .await;
        let _ = handle
            .append(LogStream::Webhook, &json!({"event": "validation", "result": "passed"}))
            .await;
        let _ = handle
            .append(LogStream::Webhook, &json!({"event": "command_matching", "result": "matched"}))
            .await;
    }

    let created_id = match state.store.create(&task).await {
        Ok(id) => id,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": e.to_string()})),
            )
        }
    };

    if created_id != task_id {
        return (
            StatusCode::OK,
            Json(json!({"task_id": created_id, "status": "deduplicated"})),
        );
    }

    if let Err(e) = state.queue.enqueue(created_id, req.priority).await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": e.to_string()})),
        );
    }

    (StatusCode::OK, Json(json!({"task_id": created_id, "status": "accepted"})))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hmac::Mac;
    use std::sync::Mutex as StdMutex;
    use tower::ServiceExt;

    use crate::model::{Installation, MetricsDelta, Task, TaskStatus};
    use crate::queue::QueueEntry;
    use crate::store::{ListFilter, Page, TransitionPatch};

    #[derive(Default)]
    struct FakeStore {
        created: StdMutex<Vec<Task>>,
    }

    #[async_trait]
    impl TaskStore for FakeStore {
        async fn create(&self, task: &Task) -> crate::store::Result<Uuid> {
            self.created.lock().unwrap().push(task.clone());
            Ok(task.task_id)
        }

        async fn get(&self, _id: Uuid) -> crate::store::Result<Option<Task>> {
            Ok(None)
        }

        async fn transition(&self, _id: Uuid, _from: TaskStatus, _to: TaskStatus, _patch: TransitionPatch) -> crate::store::Result<()> {
            Ok(())
        }

        async fn append_metrics(&self, _id: Uuid, _delta: MetricsDelta) -> crate::store::Result<()> {
            Ok(())
        }

        async fn list(&self, _filter: ListFilter, _limit: usize, _before: Option<Uuid>) -> crate::store::Result<Page<Task>> {
            Ok(Page { items: vec![], has_more: false })
        }

        async fn find_expired_leases(&self, _lease_seconds: u64) -> crate::store::Result<Vec<Task>> {
            Ok(vec![])
        }

        async fn get_installation(&self, _installation_id: &str) -> crate::store::Result<Option<Installation>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct FakeQueue {
        enqueued: StdMutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl Queue for FakeQueue {
        async fn enqueue(&self, task_id: Uuid, _priority: i32) -> crate::queue::Result<()> {
            self.enqueued.lock().unwrap().push(task_id);
            Ok(())
        }

        async fn dequeue(&self, _block_timeout: std::time::Duration) -> crate::queue::Result<Option<QueueEntry>> {
            Ok(None)
        }

        async fn ack(&self, _entry: &QueueEntry) -> crate::queue::Result<()> {
            Ok(())
        }

        async fn nack(&self, _entry: &QueueEntry, _reason: &str) -> crate::queue::Result<bool> {
            Ok(false)
        }

        async fn size(&self) -> usize {
            0
        }

        async fn dead_letter_size(&self) -> usize {
            0
        }
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn test_app() -> (Router, Arc<FakeQueue>) {
        let mut secrets = HashMap::new();
        secrets.insert(Provider::CodeForge, "shh".to_string());
        let queue = Arc::new(FakeQueue::default());
        let state = Arc::new(IngressState {
            store: Arc::new(FakeStore::default()),
            queue: Arc::clone(&queue) as Arc<dyn Queue>,
            flow_log: FlowLog::new(std::env::temp_dir()),
            webhook_secrets: secrets,
        });
        let app = Router::new()
            .route("/webhooks/{provider}", post(handle_webhook))
            .with_state(state);
        (app, queue)
    }

    #[tokio::test]
    async fn accepts_a_well_signed_triggering_event_and_enqueues_it() {
        let (app, queue) = test_app();
        let body = serde_json::to_vec(&json!({
            "action": "opened",
            "repository": {"full_name": "acme/widgets"},
            "number": 1,
        }))
        .unwrap();
        let sig = sign("shh", &body);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/webhooks/code-forge")
            .header("x-installation-id", "inst-1")
            .header("x-signature", sig)
            .header("x-delivery-id", "d1")
            .body(axum::body::Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.enqueued.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_a_badly_signed_event() {
        let (app, queue) = test_app();
        let body = serde_json::to_vec(&json!({"action": "opened"})).unwrap();

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/webhooks/code-forge")
            .header("x-installation-id", "inst-1")
            .header("x-signature", "deadbeef")
            .body(axum::body::Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(queue.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ignores_a_non_triggering_event_without_enqueueing() {
        let (app, queue) = test_app();
        let body = serde_json::to_vec(&json!({
            "action": "created",
            "repository": {"full_name": "acme/widgets"},
            "comment": {"id": "c1", "body": "looks good to me"},
        }))
        .unwrap();
        let sig = sign("shh", &body);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/webhooks/code-forge")
            .header("x-installation-id", "inst-1")
            .header("x-signature", sig)
            .header("x-delivery-id", "d2")
            .body(axum::body::Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(queue.enqueued.lock().unwrap().is_empty());
    }
}
