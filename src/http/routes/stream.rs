//! `/stream/retrieve` — client stream chunk pickup (§4.5).

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::crypto;
use crate::policy::errors::RelayResult;
use crate::policy::rate_limit::RateLimitedOp;
use crate::RelayContext;

#[derive(Debug, Deserialize)]
pub struct StreamRetrieveRequest {
    pub request_id: String,
    pub client_public_key: String,
    #[serde(default)]
    pub from_index: u64,
}

pub async fn stream_retrieve(
    State(ctx): State<Arc<RelayContext>>,
    Json(body): Json<StreamRetrieveRequest>,
) -> RelayResult<Json<Value>> {
    let client_key = crypto::decode_public_key(&body.client_public_key)?;
    let fingerprint = crypto::fingerprint(&client_key)?;

    ctx.rate_limiter
        .check(&fingerprint, RateLimitedOp::StreamRetrieve)
        .await
        .map_err(|retry_after_secs| crate::policy::errors::RelayError::RateLimited { retry_after_secs })?;

    let (chunks, final_seen, last_activity) = ctx
        .dispatch
        .client_stream_retrieve(&body.request_id, &fingerprint, body.from_index)
        .await?;

    let next_index = body.from_index + chunks.len() as u64;
    Ok(Json(json!({
        "chunks": chunks,
        "final_seen": final_seen,
        "next_index": next_index,
        "last_activity": last_activity,
    })))
}
