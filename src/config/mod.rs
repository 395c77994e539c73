//! Configuration layer (C9): CLI flags doubling as environment variables via
//! `clap`'s `derive` + `env` features, precedence CLI > env > built-in
//! default. No TOML file, no hot-reload — the relay is configured the way a
//! stateless proxy is configured in container deployments (§4.9).

use clap::Parser;
use tracing::warn;

#[derive(Debug, Clone, Parser)]
#[command(name = "relayd", about = "Encrypted-envelope relay for token.place")]
pub struct RelayConfig {
    /// Listen host.
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub relay_host: String,

    /// Listen port.
    #[arg(long, env = "RELAY_PORT", default_value_t = 5010)]
    pub relay_port: u16,

    /// Sizing hint for the underlying worker pool (ambient; the tokio
    /// runtime sizes itself, this is surfaced to `/healthz` only).
    #[arg(long, env = "RELAY_WORKERS", default_value_t = 4)]
    pub relay_workers: usize,

    /// Sizing hint for OS threads backing the runtime.
    #[arg(long, env = "RELAY_THREADS", default_value_t = 4)]
    pub relay_threads: usize,

    /// Per-request processing timeout hint (seconds).
    #[arg(long, env = "RELAY_TIMEOUT", default_value_t = 60)]
    pub relay_timeout: u64,

    /// Legacy alias for `SHUTDOWN_GRACE`, kept for parity with the
    /// enumerated configuration surface.
    #[arg(long, env = "RELAY_GRACEFUL_TIMEOUT", default_value_t = 30)]
    pub relay_graceful_timeout: u64,

    /// Advertised URL in `/healthz`.
    #[arg(long, env = "TOKEN_PLACE_RELAY_PUBLIC_URL", default_value = "")]
    pub public_url: String,

    /// Shared secret required for worker `announce`; empty means any worker
    /// may register.
    #[arg(long, env = "TOKEN_PLACE_RELAY_SERVER_TOKEN", default_value = "")]
    pub server_token: String,

    /// Per-fingerprint submissions per minute.
    #[arg(long, env = "API_STREAM_RATE_LIMIT", default_value_t = 60)]
    pub api_stream_rate_limit: u32,

    /// Per-fingerprint stream-retrievals per minute.
    #[arg(long, env = "API_STREAM_RETRIEVE_RATE_LIMIT", default_value_t = 120)]
    pub api_stream_retrieve_rate_limit: u32,

    /// Accumulate encrypt/decrypt timing samples in a bounded ring.
    #[arg(long, env = "TOKEN_PLACE_PERF_MONITOR", default_value_t = false)]
    pub perf_monitor: bool,

    /// Maximum accepted request body size, bytes.
    #[arg(long, env = "MAX_ENVELOPE_BYTES", default_value_t = 8 * 1024 * 1024)]
    pub max_envelope_bytes: usize,

    /// Ticket time-to-live, seconds.
    #[arg(long, env = "REQUEST_TTL", default_value_t = 60)]
    pub request_ttl_secs: i64,

    /// Worker record time-to-live, seconds.
    #[arg(long, env = "WORKER_TTL", default_value_t = 90)]
    pub worker_ttl_secs: i64,

    /// Worker long-poll timeout, seconds.
    #[arg(long, env = "POLL_TIMEOUT", default_value_t = 30)]
    pub poll_timeout_secs: u64,

    /// Stream chunk gap timeout, seconds.
    #[arg(long, env = "STREAM_GAP_TIMEOUT", default_value_t = 10)]
    pub stream_gap_timeout_secs: i64,

    /// Client stream-retrieve long-poll timeout, seconds.
    #[arg(long, env = "STREAM_POLL_TIMEOUT", default_value_t = 15)]
    pub stream_poll_timeout_secs: u64,

    /// Graceful shutdown drain budget, seconds.
    #[arg(long, env = "SHUTDOWN_GRACE", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Max in-flight requests per worker before it is skipped by `pick_next`.
    #[arg(long, env = "MAX_INFLIGHT_PER_WORKER", default_value_t = 8)]
    pub max_inflight_per_worker: u32,

    /// Bounded inbound channel capacity per worker.
    #[arg(long, env = "RELAY_INBOUND_CAPACITY", default_value_t = 64)]
    pub inbound_capacity: usize,

    /// Tracing filter string, e.g. `info` or `debug,token_place_relay=trace`.
    #[arg(long, env = "RELAY_LOG", default_value = "info")]
    pub log_filter: String,

    /// `text` or `json`.
    #[arg(long, env = "RELAY_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Allows binding a non-loopback host with no worker registration
    /// token. Refused by default (§4.9, exit code 3).
    #[arg(long, env = "RELAY_ALLOW_INSECURE", default_value_t = false)]
    pub allow_insecure: bool,

    /// Grace window (seconds) during which a retired private key may still
    /// decrypt in-flight requests.
    #[arg(long, env = "RELAY_KEY_ROTATION_GRACE_SECS", default_value_t = 300)]
    pub key_rotation_grace_secs: i64,
}

impl RelayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_port)
    }

    pub fn is_loopback_host(&self) -> bool {
        matches!(self.relay_host.as_str(), "127.0.0.1" | "localhost" | "::1")
    }

    /// Refuses insecure production configurations (§4.9): binding to a
    /// non-loopback address with no worker registration token, unless the
    /// operator explicitly opted in.
    pub fn production_checks(&self) -> Result<(), String> {
        if !self.is_loopback_host() && self.server_token.is_empty() && !self.allow_insecure {
            return Err(format!(
                "refusing to bind {} with an empty TOKEN_PLACE_RELAY_SERVER_TOKEN; set RELAY_ALLOW_INSECURE=1 to override",
                self.bind_addr()
            ));
        }
        if !self.is_loopback_host() && self.server_token.is_empty() {
            warn!("RELAY_ALLOW_INSECURE set: running with no worker registration token on a non-loopback host");
        }
        Ok(())
    }

    pub fn server_token(&self) -> Option<String> {
        if self.server_token.is_empty() {
            None
        } else {
            Some(self.server_token.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_with_no_args() {
        let cfg = RelayConfig::parse_from(["relayd"]);
        assert_eq!(cfg.relay_port, 5010);
        assert_eq!(cfg.relay_host, "0.0.0.0");
    }

    #[test]
    fn production_checks_refuse_insecure_public_bind() {
        let mut cfg = RelayConfig::parse_from(["relayd", "--relay-host", "0.0.0.0"]);
        cfg.server_token = String::new();
        cfg.allow_insecure = false;
        assert!(cfg.production_checks().is_err());
    }

    #[test]
    fn production_checks_allow_loopback_without_token() {
        let cfg = RelayConfig::parse_from(["relayd", "--relay-host", "127.0.0.1"]);
        assert!(cfg.production_checks().is_ok());
    }

    #[test]
    fn production_checks_allow_insecure_override() {
        let mut cfg = RelayConfig::parse_from(["relayd", "--relay-host", "0.0.0.0"]);
        cfg.server_token = String::new();
        cfg.allow_insecure = true;
        assert!(cfg.production_checks().is_ok());
    }

    #[test]
    fn empty_server_token_is_none() {
        let mut cfg = RelayConfig::parse_from(["relayd"]);
        cfg.server_token = String::new();
        assert_eq!(cfg.server_token(), None);
    }
}
