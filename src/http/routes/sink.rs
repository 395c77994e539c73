//! `/sink` — worker long-poll intake (§4.5). Doubles as the worker's
//! heartbeat: every poll re-announces the worker's public key, refreshing
//! `last_seen` the way the source system's workers re-register on each
//! long-poll cycle.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::policy::errors::RelayResult;
use crate::RelayContext;

#[derive(Debug, Deserialize)]
pub struct SinkParams {
    pub worker_id: String,
    pub public_key: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct SinkReply {
    request_id: String,
    envelope: crate::crypto::EnvelopeRecord,
    client_public_key: String,
    model: Option<String>,
}

pub async fn sink_post(State(ctx): State<Arc<RelayContext>>, Json(params): Json<SinkParams>) -> RelayResult<Json<Value>> {
    handle_sink(ctx, params).await
}

pub async fn sink_get(State(ctx): State<Arc<RelayContext>>, Query(params): Query<SinkParams>) -> RelayResult<Json<Value>> {
    handle_sink(ctx, params).await
}

async fn handle_sink(ctx: Arc<RelayContext>, params: SinkParams) -> RelayResult<Json<Value>> {
    ctx.workers
        .announce(&params.worker_id, &params.public_key, params.auth_token.as_deref())
        .await?;

    let timeout = Duration::from_secs(ctx.config.poll_timeout_secs);
    match ctx.dispatch.worker_poll(&params.worker_id, timeout).await {
        Some(req) => Ok(Json(json!(SinkReply {
            request_id: req.request_id,
            envelope: req.envelope,
            client_public_key: req.client_public_key,
            model: req.model,
        }))),
        None => Ok(Json(json!({}))),
    }
}
