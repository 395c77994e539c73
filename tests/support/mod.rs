//! Shared helpers for the cross-module HTTP integration tests.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use rand::rngs::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use tower::ServiceExt;

use token_place_relay::config::RelayConfig;
use token_place_relay::crypto::encode_public_key;
use token_place_relay::RelayContext;

/// A loopback-bound config with short TTLs so expiry/timeout scenarios
/// don't need the test suite to sleep for the production defaults.
pub fn test_config() -> RelayConfig {
    let mut cfg = RelayConfig::parse_from(["relayd", "--relay-host", "127.0.0.1"]);
    cfg.server_token = String::new();
    cfg.allow_insecure = false;
    cfg.request_ttl_secs = 2;
    cfg.stream_gap_timeout_secs = 2;
    cfg.worker_ttl_secs = 300;
    cfg.poll_timeout_secs = 5;
    cfg.api_stream_rate_limit = 1000;
    cfg.api_stream_retrieve_rate_limit = 1000;
    cfg
}

pub fn build_ctx() -> Arc<RelayContext> {
    Arc::new(RelayContext::new(test_config()).expect("context"))
}

pub fn fresh_keypair() -> (RsaPrivateKey, RsaPublicKey, String) {
    let priv_key = RsaPrivateKey::new(&mut OsRng, 2048).expect("generate key");
    let pub_key = RsaPublicKey::from(&priv_key);
    let b64 = encode_public_key(&pub_key).expect("encode key");
    (priv_key, pub_key, b64)
}

pub async fn announce_worker(ctx: &Arc<RelayContext>, worker_id: &str) -> String {
    let (_priv, _pub, key_b64) = fresh_keypair();
    ctx.workers.announce(worker_id, &key_b64, None).await.expect("announce");
    key_b64
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

pub async fn send(router: axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(req).await.expect("router call");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("collect body").to_bytes();
    let body: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}
