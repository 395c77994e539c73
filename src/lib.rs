pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod http;
pub mod openai;
pub mod policy;
pub mod registry;
pub mod telemetry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use config::RelayConfig;
use crypto::KeyManager;
use dispatch::{DispatchQueues, SharedDispatchQueues};
use policy::RateLimiter;
use registry::{SharedWorkerRegistry, WorkerRegistry};
use telemetry::perf::{PerfMonitor, RequestCounters};

/// Explicit relay context injected into every HTTP handler (§9 design note:
/// no process-wide mutable singletons — one struct, constructed once,
/// cloned cheaply via `Arc` fields).
#[derive(Clone)]
pub struct RelayContext {
    pub config: Arc<RelayConfig>,
    pub keys: Arc<KeyManager>,
    pub workers: SharedWorkerRegistry,
    pub dispatch: SharedDispatchQueues,
    pub rate_limiter: Arc<RateLimiter>,
    pub perf: Arc<PerfMonitor>,
    pub request_counters: Arc<RequestCounters>,
    pub started_at: std::time::Instant,
    /// Flips to `true` once graceful shutdown begins; `/healthz` and
    /// `/submit` both consult it (§5).
    pub draining: Arc<AtomicBool>,
}

impl RelayContext {
    pub fn new(config: RelayConfig) -> Result<Self, String> {
        let keys = KeyManager::generate(Duration::from_secs(config.key_rotation_grace_secs.max(0) as u64))
            .map_err(|e| format!("failed to initialize RSA key manager: {e}"))?;
        let workers = Arc::new(WorkerRegistry::new(
            config.worker_ttl_secs,
            config.max_inflight_per_worker,
            config.server_token(),
        ));
        let dispatch = Arc::new(DispatchQueues::new(
            Arc::clone(&workers),
            config.inbound_capacity,
            config.request_ttl_secs,
            config.stream_gap_timeout_secs,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.api_stream_rate_limit,
            config.api_stream_retrieve_rate_limit,
        ));
        let perf = Arc::new(PerfMonitor::new(config.perf_monitor));

        Ok(Self {
            config: Arc::new(config),
            keys: Arc::new(keys),
            workers,
            dispatch,
            rate_limiter,
            perf,
            request_counters: Arc::new(RequestCounters::new()),
            started_at: std::time::Instant::now(),
            draining: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    pub fn begin_draining(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    /// Spawns the background sweeper that reaps expired worker records and
    /// tickets on a fixed tick (§3, §4.3, §4.4).
    pub fn spawn_reaper(self: &Arc<Self>) {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let gone = ctx.workers.reap().await;
                for worker_id in &gone {
                    ctx.dispatch.mark_worker_gone(worker_id).await;
                }
                ctx.dispatch.reap_tickets().await;
            }
        });
    }
}
