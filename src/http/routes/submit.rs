//! `/submit` (aka `/faucet`) — client request intake (§4.5).

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::crypto::{self, EnvelopeRecord};
use crate::policy::errors::{RelayError, RelayResult};
use crate::policy::rate_limit::RateLimitedOp;
use crate::RelayContext;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub envelope: EnvelopeRecord,
    pub client_public_key: String,
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub request_id: String,
}

pub async fn submit(State(ctx): State<Arc<RelayContext>>, Json(body): Json<SubmitRequest>) -> RelayResult<Json<Value>> {
    if ctx.is_draining() {
        return Err(RelayError::NoWorkersAvailable);
    }

    let client_key = crypto::decode_public_key(&body.client_public_key)?;
    let fingerprint = crypto::fingerprint(&client_key)?;

    ctx.rate_limiter
        .check(&fingerprint, RateLimitedOp::Submit)
        .await
        .map_err(|retry_after_secs| RelayError::RateLimited { retry_after_secs })?;

    let stream_session_id = if body.stream {
        Some(
            body.envelope
                .stream_session_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        )
    } else {
        None
    };

    let request_id = ctx
        .dispatch
        .submit(
            body.client_public_key,
            fingerprint,
            body.envelope,
            body.model,
            stream_session_id,
        )
        .await?;

    Ok(Json(json!(SubmitResponse { request_id })))
}
