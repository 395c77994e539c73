//! Relay HTTP surface (C5): router assembly, graceful shutdown, and the
//! request-counting middleware backing `/metrics`.

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::RelayContext;

pub fn build_router(ctx: Arc<RelayContext>) -> Router {
    let max_body = ctx.config.max_envelope_bytes;

    Router::new()
        .route("/public-key", get(routes::keys::public_key))
        .route("/next-server", get(routes::keys::next_server))
        .route("/submit", post(routes::submit::submit))
        .route("/faucet", post(routes::submit::submit))
        .route("/retrieve", post(routes::retrieve::retrieve))
        .route("/sink", get(routes::sink::sink_get).post(routes::sink::sink_post))
        .route("/source", post(routes::source::source))
        .route("/stream/source", post(routes::source::stream_source))
        .route("/stream/retrieve", post(routes::stream::stream_retrieve))
        .route("/v1/chat/completions", post(crate::openai::chat_completions))
        .route("/healthz", get(routes::health::healthz))
        .route("/livez", get(routes::health::livez))
        .route("/metrics", get(routes::health::metrics))
        .layer(middleware::from_fn_with_state(Arc::clone(&ctx), record_request_metrics))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

async fn record_request_metrics(
    State(ctx): State<Arc<RelayContext>>,
    matched_path: Option<MatchedPath>,
    request: Request,
    next: Next,
) -> Response {
    let path = matched_path.map(|p| p.as_str().to_string()).unwrap_or_else(|| "unknown".to_string());
    let response = next.run(request).await;
    ctx.request_counters.record(&path, response.status().as_u16()).await;
    response
}

/// Binds `config.bind_addr()` and serves `router`, honoring graceful
/// shutdown on SIGTERM (Unix) / Ctrl-C: flips `draining`, then waits up to
/// `shutdown_grace_secs` for in-flight tickets before returning (§5).
pub async fn serve(ctx: Arc<RelayContext>) -> anyhow::Result<()> {
    let addr: SocketAddr = ctx.config.bind_addr().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "relay listening");
    serve_on(ctx, listener, make_shutdown_future()).await
}

/// Same as [`serve`] but takes an already-bound listener and an arbitrary
/// shutdown trigger future, so the ephemeral-port / graceful-shutdown path
/// can be driven directly from a test rather than only from an OS signal.
pub async fn serve_on(
    ctx: Arc<RelayContext>,
    listener: tokio::net::TcpListener,
    trigger: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let router = build_router(Arc::clone(&ctx));
    axum::serve(listener, router)
        .with_graceful_shutdown(drain_then_return(ctx, trigger))
        .await?;
    info!("relay stopped");
    Ok(())
}

async fn drain_then_return(ctx: Arc<RelayContext>, trigger: impl std::future::Future<Output = ()>) {
    trigger.await;
    info!("shutdown signal received — draining in-flight tickets");
    ctx.begin_draining();

    let grace = std::time::Duration::from_secs(ctx.config.shutdown_grace_secs);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline && ctx.dispatch.ticket_count().await > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

/// Resolves on SIGTERM (Unix) or Ctrl-C; Ctrl-C only on other platforms.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
