//! Crate-wide error aggregation.
//!
//! Each component owns a `thiserror`-derived enum for its own failure modes;
//! this module only composes them at the points where a caller needs to
//! handle errors from more than one component (the ingress HTTP layer, the
//! worker loop, and `main`).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::cli_driver::CliError;
use crate::gateway::GatewayError;
use crate::queue::QueueError;
use crate::repo::WorkspaceError;
use crate::router::RouterError;
use crate::signature::SignatureError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("signature verification failed: {0}")]
    Signature(#[from] SignatureError),

    #[error("task store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("cli driver error: {0}")]
    Cli(#[from] CliError),

    #[error("service gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("completion router error: {0}")]
    Router(#[from] RouterError),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("configuration error: {reason}")]
    Config { reason: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Maps failures surfaced directly to the webhook HTTP response (§4.6/§7).
impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::Signature(_) => StatusCode::UNAUTHORIZED,
            CoreError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            CoreError::Store(_) | CoreError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
