//! Stable error taxonomy for the relay (§7).
//!
//! Every fallible operation in the core (crypto, registry, dispatch) returns
//! a [`RelayError`]. HTTP handlers never hand-roll status codes — they
//! propagate `RelayError` and let `IntoResponse` do the kind→status mapping
//! in one place, per the "centralize conversion to HTTP at the edge" design
//! note.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid input")]
    InvalidInput,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unauthorized")]
    Unauthorized,

    #[error("no workers available")]
    NoWorkersAvailable,

    #[error("worker handling this request is gone")]
    WorkerGone,

    #[error("queue full")]
    QueueFull,

    #[error("request is not bound to this worker")]
    UnboundRequest,

    #[error("upstream worker published a malformed envelope")]
    BadUpstream,

    #[error("stream chunk failed integrity check")]
    ChunkIntegrity,

    #[error("ticket expired")]
    TicketExpired,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("internal error")]
    Internal,
}

impl RelayError {
    /// Stable machine-readable kind name, independent of the `Display` text.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidInput => "invalid-input",
            RelayError::MissingField(_) => "missing-field",
            RelayError::Unauthorized => "unauthorized",
            RelayError::NoWorkersAvailable => "no-workers-available",
            RelayError::WorkerGone => "worker-gone",
            RelayError::QueueFull => "queue-full",
            RelayError::UnboundRequest => "unbound-request",
            RelayError::BadUpstream => "bad-upstream",
            RelayError::ChunkIntegrity => "chunk-integrity",
            RelayError::TicketExpired => "ticket-expired",
            RelayError::RateLimited { .. } => "rate-limited",
            RelayError::Internal => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidInput | RelayError::MissingField(_) => StatusCode::BAD_REQUEST,
            RelayError::Unauthorized => StatusCode::FORBIDDEN,
            RelayError::NoWorkersAvailable | RelayError::QueueFull | RelayError::WorkerGone => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::UnboundRequest => StatusCode::CONFLICT,
            RelayError::BadUpstream => StatusCode::BAD_GATEWAY,
            RelayError::ChunkIntegrity => StatusCode::UNPROCESSABLE_ENTITY,
            RelayError::TicketExpired => StatusCode::GONE,
            RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Never place payload/secret data in the error body — only the
        // stable kind and a static, non-parameterized message.
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        if let RelayError::RateLimited { retry_after_secs } = &self {
            body["retry_after"] = json!(retry_after_secs);
        }
        if let RelayError::QueueFull = &self {
            body["retry_after"] = json!(1);
        }
        (status, Json(body)).into_response()
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
