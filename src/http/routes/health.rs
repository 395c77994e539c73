//! `/healthz`, `/livez`, `/metrics` (§4.5, C8).

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::RelayContext;

pub async fn healthz(State(ctx): State<Arc<RelayContext>>) -> Json<Value> {
    let status = if ctx.is_draining() { "draining" } else { "ok" };
    Json(json!({
        "status": status,
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "public_url": ctx.config.public_url,
        "workers": ctx.workers.len().await,
    }))
}

/// Only reports a fatal process error — since this relay holds no durable
/// state to corrupt, liveness is equivalent to "the process can still
/// answer HTTP requests" (§4.5).
pub async fn livez() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn metrics(State(ctx): State<Arc<RelayContext>>) -> Json<Value> {
    let requests = ctx.request_counters.snapshot().await;
    Json(json!({
        "requests": requests,
        "queue_depth": ctx.dispatch.ticket_count().await,
        "worker_count": ctx.workers.len().await,
        "eligible_worker_count": ctx.workers.eligible_count().await,
    }))
}
