//! Bounded perf-sample ring buffer and request counters (§4.8).
//!
//! Perf samples never leave the process — they back an in-process snapshot
//! used by tests and an optional debug log line, never `/metrics`. Request
//! counters are the only telemetry surfaced externally.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::RwLock;

const RING_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct PerfSample {
    pub operation: &'static str,
    pub elapsed: Duration,
}

/// Gated by `TOKEN_PLACE_PERF_MONITOR`; a no-op `record` when disabled costs
/// one branch.
pub struct PerfMonitor {
    enabled: bool,
    samples: RwLock<VecDeque<PerfSample>>,
}

impl PerfMonitor {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            samples: RwLock::new(VecDeque::with_capacity(RING_CAPACITY)),
        }
    }

    pub async fn record(&self, operation: &'static str, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        let mut samples = self.samples.write().await;
        if samples.len() >= RING_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(PerfSample { operation, elapsed });
    }

    pub async fn snapshot(&self) -> Vec<PerfSample> {
        self.samples.read().await.iter().copied().collect()
    }
}

/// Monotonic request counters keyed `"{endpoint}:{status_class}"`, e.g.
/// `"submit:2xx"`. Backs `/metrics`; carries no payload-adjacent data.
pub struct RequestCounters {
    counts: RwLock<HashMap<String, u64>>,
}

impl RequestCounters {
    pub fn new() -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record(&self, endpoint: &str, status: u16) {
        let class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            500..=599 => "5xx",
            _ => "other",
        };
        let key = format!("{endpoint}:{class}");
        let mut counts = self.counts.write().await;
        *counts.entry(key).or_insert(0) += 1;
    }

    pub async fn snapshot(&self) -> HashMap<String, u64> {
        self.counts.read().await.clone()
    }
}

impl Default for RequestCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_monitor_records_nothing() {
        let monitor = PerfMonitor::new(false);
        monitor.record("encrypt", Duration::from_millis(1)).await;
        assert!(monitor.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn enabled_monitor_records_samples() {
        let monitor = PerfMonitor::new(true);
        monitor.record("encrypt", Duration::from_millis(1)).await;
        monitor.record("decrypt", Duration::from_millis(2)).await;
        let snap = monitor.snapshot().await;
        assert_eq!(snap.len(), 2);
    }

    #[tokio::test]
    async fn ring_buffer_is_bounded() {
        let monitor = PerfMonitor::new(true);
        for _ in 0..(RING_CAPACITY + 10) {
            monitor.record("encrypt", Duration::from_micros(1)).await;
        }
        assert_eq!(monitor.snapshot().await.len(), RING_CAPACITY);
    }

    #[tokio::test]
    async fn request_counters_group_by_status_class() {
        let counters = RequestCounters::new();
        counters.record("submit", 200).await;
        counters.record("submit", 201).await;
        counters.record("submit", 503).await;
        let snap = counters.snapshot().await;
        assert_eq!(snap.get("submit:2xx"), Some(&2));
        assert_eq!(snap.get("submit:5xx"), Some(&1));
    }
}
