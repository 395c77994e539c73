//! `/source` and `/stream/source` — worker reply/chunk publish (§4.5).

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::dispatch::StreamChunkMeta;
use crate::policy::errors::{RelayError, RelayResult};
use crate::RelayContext;

#[derive(Debug, Deserialize)]
pub struct StreamChunkParams {
    pub chunk_index: u64,
    #[serde(default)]
    pub r#final: bool,
}

#[derive(Debug, Deserialize)]
pub struct SourceRequest {
    pub worker_id: String,
    pub request_id: String,
    pub envelope: crate::crypto::EnvelopeRecord,
    pub stream: Option<StreamChunkParams>,
}

pub async fn source(State(ctx): State<Arc<RelayContext>>, Json(body): Json<SourceRequest>) -> RelayResult<Json<Value>> {
    publish(ctx, body, false).await
}

/// Identical semantics to `source`, but the `stream` object is mandatory —
/// this alias exists purely so a worker implementation can route stream
/// publishes through a dedicated path (§4.5).
pub async fn stream_source(State(ctx): State<Arc<RelayContext>>, Json(body): Json<SourceRequest>) -> RelayResult<Json<Value>> {
    publish(ctx, body, true).await
}

async fn publish(ctx: Arc<RelayContext>, body: SourceRequest, require_stream: bool) -> RelayResult<Json<Value>> {
    if require_stream && body.stream.is_none() {
        return Err(RelayError::MissingField("stream"));
    }

    let stream_meta = body.stream.map(|s| StreamChunkMeta {
        chunk_index: s.chunk_index,
        final_chunk: s.r#final,
    });

    ctx.dispatch
        .worker_publish(&body.worker_id, &body.request_id, body.envelope, stream_meta)
        .await?;

    Ok(Json(json!({ "status": "ok" })))
}
