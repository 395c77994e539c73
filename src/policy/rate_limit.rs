//! Per-client-fingerprint sliding-window rate limiting (§4.7, §7).
//!
//! Counts submissions and stream-retrievals separately, as spec'd, using an
//! in-memory sliding window per fingerprint. A clustered deployment would
//! need an external store; that is explicitly out of scope (§9 Open
//! Questions).

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// A sliding-window event counter.
pub struct SlidingWindow {
    window_secs: i64,
    max_count: u32,
    events: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new(window_secs: i64, max_count: u32) -> Self {
        Self {
            window_secs,
            max_count,
            events: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(self.window_secs);
        while self.events.front().is_some_and(|t| *t <= cutoff) {
            self.events.pop_front();
        }
    }

    /// Record an event and return `true` if the window is still under its
    /// cap (i.e. the event is allowed), `false` if this event breaches it.
    pub fn record_and_check(&mut self, now: DateTime<Utc>) -> bool {
        self.evict(now);
        if self.events.len() as u32 >= self.max_count {
            return false;
        }
        self.events.push_back(now);
        true
    }

    pub fn count_in_window(&mut self, now: DateTime<Utc>) -> u32 {
        self.evict(now);
        self.events.len() as u32
    }

    /// Seconds until the oldest event falls out of the window, or `None` if
    /// the window is not currently at capacity.
    pub fn retry_after_secs(&mut self, now: DateTime<Utc>) -> Option<u64> {
        if (self.events.len() as u32) < self.max_count {
            return None;
        }
        self.events.front().map(|oldest| {
            let expiry = *oldest + Duration::seconds(self.window_secs);
            (expiry - now).num_seconds().max(1) as u64
        })
    }
}

/// Which operation is being rate-limited — submit and stream-retrieve are
/// counted in independent windows per fingerprint (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitedOp {
    Submit,
    StreamRetrieve,
}

pub struct RateLimiter {
    submit_per_min: u32,
    stream_retrieve_per_min: u32,
    windows: Mutex<HashMap<(String, RateLimitedOp), SlidingWindow>>,
}

impl RateLimiter {
    pub fn new(submit_per_min: u32, stream_retrieve_per_min: u32) -> Self {
        Self {
            submit_per_min,
            stream_retrieve_per_min,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Ok(())` if `fingerprint` is still within its budget for
    /// `op`, or `Err(retry_after_secs)` if the breach should be surfaced as
    /// `rate-limited`.
    pub async fn check(&self, fingerprint: &str, op: RateLimitedOp) -> Result<(), u64> {
        let max = match op {
            RateLimitedOp::Submit => self.submit_per_min,
            RateLimitedOp::StreamRetrieve => self.stream_retrieve_per_min,
        };
        let now = Utc::now();
        let mut map = self.windows.lock().await;
        let window = map
            .entry((fingerprint.to_string(), op))
            .or_insert_with(|| SlidingWindow::new(60, max));

        if window.record_and_check(now) {
            Ok(())
        } else {
            Err(window.retry_after_secs(now).unwrap_or(60))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_window_allows_up_to_cap() {
        let mut w = SlidingWindow::new(60, 3);
        let now = Utc::now();
        assert!(w.record_and_check(now));
        assert!(w.record_and_check(now));
        assert!(w.record_and_check(now));
        assert!(!w.record_and_check(now));
    }

    #[test]
    fn sliding_window_expires_old_events() {
        let mut w = SlidingWindow::new(60, 1);
        let now = Utc::now();
        assert!(w.record_and_check(now));
        assert!(!w.record_and_check(now));
        let later = now + Duration::seconds(61);
        assert!(w.record_and_check(later));
    }

    #[tokio::test]
    async fn per_fingerprint_and_per_op_isolation() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.check("fp-a", RateLimitedOp::Submit).await.is_ok());
        assert!(limiter.check("fp-a", RateLimitedOp::Submit).await.is_err());
        // Different fingerprint is independent.
        assert!(limiter.check("fp-b", RateLimitedOp::Submit).await.is_ok());
        // Different op on the same fingerprint is independent.
        assert!(limiter
            .check("fp-a", RateLimitedOp::StreamRetrieve)
            .await
            .is_ok());
    }
}
