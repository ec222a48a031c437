//! Durable Task Store: create/get/transition/list over a relational backend
//! (§4.3). The trait is the seam the worker and ingress controller code
//! against; `postgres` is the only production implementation today.

mod postgres;

pub use postgres::PostgresStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{Installation, MetricsDelta, Task, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("build error: {0}")]
    Build(#[from] deadpool_postgres::BuildError),

    #[error("pool creation error: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("transition from {from:?} to {to:?} rejected: task {id} is not in {from:?}")]
    CasFailed {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("migration error: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Keyset page: items plus whether more remain beyond the last item.
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub installation_id: Option<String>,
    pub status: Option<TaskStatus>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task, or return the existing task id if `fingerprint`
    /// already maps to a non-terminal task for this installation within the
    /// dedup window (§4.3, §4.6 step 5).
    async fn create(&self, task: &Task) -> Result<Uuid>;

    async fn get(&self, id: Uuid) -> Result<Option<Task>>;

    /// Compare-and-swap status transition; fails with `CasFailed` if the
    /// task's current status isn't `from`. `patch` applies field updates
    /// atomically with the transition.
    async fn transition(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        patch: TransitionPatch,
    ) -> Result<()>;

    async fn append_metrics(&self, id: Uuid, delta: MetricsDelta) -> Result<()>;

    async fn list(&self, filter: ListFilter, limit: usize, before: Option<Uuid>) -> Result<Page<Task>>;

    /// Tasks in `running` (or `awaiting-approval`) whose lease has expired,
    /// for worker-startup reconciliation (§5).
    async fn find_expired_leases(&self, lease_seconds: u64) -> Result<Vec<Task>>;

    /// Looks up an installation's credentials by id, for the Worker's
    /// pre-dispatch token lookup (§4.9).
    async fn get_installation(&self, installation_id: &str) -> Result<Option<Installation>>;
}

#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub output_text: Option<String>,
    pub error_text: Option<String>,
    pub post_status: Option<String>,
    pub execution_metadata: Option<serde_json::Value>,
    pub bump_attempt: bool,
    pub stamp_dequeued: bool,
    pub stamp_started: bool,
    pub stamp_finished: bool,
}
