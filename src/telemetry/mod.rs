//! Telemetry & perf monitor (C8): tracing subscriber bootstrap plus the
//! optional encrypt/decrypt timing ring buffer and request counters backing
//! `/metrics`.

pub mod perf;

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global `tracing` subscriber from `RELAY_LOG` /
/// `RELAY_LOG_FORMAT` (§6). Call once at process start.
pub fn init(log_filter: &str, json_format: bool) {
    let filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter);
    if json_format {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
