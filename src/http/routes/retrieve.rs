//! `/retrieve` — client reply pickup (§4.5).

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::crypto;
use crate::policy::errors::RelayResult;
use crate::RelayContext;

#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub request_id: String,
    pub client_public_key: String,
}

pub async fn retrieve(State(ctx): State<Arc<RelayContext>>, Json(body): Json<RetrieveRequest>) -> RelayResult<Json<Value>> {
    let client_key = crypto::decode_public_key(&body.client_public_key)?;
    let fingerprint = crypto::fingerprint(&client_key)?;

    match ctx.dispatch.client_retrieve(&body.request_id, &fingerprint).await? {
        Some(envelope) => Ok(Json(json!({ "envelope": envelope }))),
        None => Ok(Json(json!({ "status": "pending" }))),
    }
}
