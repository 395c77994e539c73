//! `/public-key`, `/next-server` (§4.5).

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::policy::errors::RelayResult;
use crate::RelayContext;

/// Relay's own keypair (§9: for identity purposes only, never on the hot
/// path — clients use `/next-server` to get a worker's key for actual
/// envelope encryption).
pub async fn public_key(State(ctx): State<Arc<RelayContext>>) -> RelayResult<Json<Value>> {
    let key_b64 = ctx.keys.own_public_key_b64().await?;
    Ok(Json(json!({ "public_key": key_b64 })))
}

/// Returns the public key of the worker `pick_next` would pick, without
/// binding a request to it (§4.3, §4.5).
pub async fn next_server(State(ctx): State<Arc<RelayContext>>) -> RelayResult<Json<Value>> {
    match ctx.workers.peek_next_public_key().await {
        Some(key_b64) => Ok(Json(json!({ "public_key": key_b64 }))),
        None => Err(crate::policy::errors::RelayError::NoWorkersAvailable),
    }
}
