//! Worker registry (C3).
//!
//! Tracks compute workers that have announced a public key, refreshes them
//! on every poll, and picks the next eligible worker round-robin. Modeled on
//! an in-memory account pool: an `RwLock<HashMap>` for the records plus a
//! read-then-filter-then-sort selection, but with "least loaded" swapped for
//! "oldest last_seen" per the relay's fairness rule (§4.3).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::crypto::keys;
use crate::policy::errors::RelayError;

#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub public_key_b64: String,
    pub last_seen: DateTime<Utc>,
    pub in_flight_count: u32,
}

pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerRecord>>,
    worker_ttl: chrono::Duration,
    max_inflight_per_worker: u32,
    registration_token: Option<String>,
}

impl WorkerRegistry {
    pub fn new(worker_ttl_secs: i64, max_inflight_per_worker: u32, registration_token: Option<String>) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            worker_ttl: chrono::Duration::seconds(worker_ttl_secs),
            max_inflight_per_worker,
            registration_token,
        }
    }

    /// Upserts the worker record and refreshes `last_seen` (§4.3). Validates
    /// the public key structurally before storing it; rejects a missing or
    /// mismatched registration token when one is configured.
    pub async fn announce(
        &self,
        worker_id: &str,
        public_key_raw: &str,
        auth_token: Option<&str>,
    ) -> Result<(), RelayError> {
        if let Some(expected) = &self.registration_token {
            if auth_token != Some(expected.as_str()) {
                return Err(RelayError::Unauthorized);
            }
        }
        // Validate structurally; we only persist the already-validated b64
        // form (not the parsed key) since workers are re-announced
        // frequently and re-parsing on every poll would be wasted work.
        let _validated: RsaPublicKey = keys::decode_public_key(public_key_raw)?;

        let mut workers = self.workers.write().await;
        let now = Utc::now();
        workers
            .entry(worker_id.to_string())
            .and_modify(|w| {
                w.public_key_b64 = public_key_raw.to_string();
                w.last_seen = now;
            })
            .or_insert_with(|| WorkerRecord {
                worker_id: worker_id.to_string(),
                public_key_b64: public_key_raw.to_string(),
                last_seen: now,
                in_flight_count: 0,
            });
        debug!(worker_id, "worker announced");
        Ok(())
    }

    fn is_eligible(&self, record: &WorkerRecord, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(record.last_seen) < self.worker_ttl
            && record.in_flight_count < self.max_inflight_per_worker
    }

    /// Round-robin across eligible workers, tie-broken by `last_seen`
    /// ascending so the most idle worker goes first (§4.3).
    pub async fn pick_next(&self) -> Option<String> {
        let workers = self.workers.read().await;
        let now = Utc::now();
        workers
            .values()
            .filter(|w| self.is_eligible(w, now))
            .min_by_key(|w| w.last_seen)
            .map(|w| w.worker_id.clone())
    }

    /// Returns the base64 public key of the worker [`pick_next`] would pick,
    /// without binding any request to it — backs `/next-server`.
    pub async fn peek_next_public_key(&self) -> Option<String> {
        let workers = self.workers.read().await;
        let now = Utc::now();
        workers
            .values()
            .filter(|w| self.is_eligible(w, now))
            .min_by_key(|w| w.last_seen)
            .map(|w| w.public_key_b64.clone())
    }

    pub async fn public_key_of(&self, worker_id: &str) -> Option<String> {
        self.workers.read().await.get(worker_id).map(|w| w.public_key_b64.clone())
    }

    pub async fn bind(&self, worker_id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(w) = workers.get_mut(worker_id) {
            w.in_flight_count = w.in_flight_count.saturating_add(1);
            w.last_seen = Utc::now();
        }
    }

    pub async fn release(&self, worker_id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(w) = workers.get_mut(worker_id) {
            w.in_flight_count = w.in_flight_count.saturating_sub(1);
        }
    }

    /// Drops workers whose `last_seen` is older than `WORKER_TTL` (§3) and
    /// returns their ids, so the dispatch layer can fail any tickets still
    /// bound to them ("worker-gone", §4.4).
    pub async fn reap(&self) -> Vec<String> {
        let mut workers = self.workers.write().await;
        let now = Utc::now();
        let ttl = self.worker_ttl;
        let expired: Vec<String> = workers
            .iter()
            .filter(|(_, w)| now.signed_duration_since(w.last_seen) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            workers.remove(id);
        }
        if !expired.is_empty() {
            warn!(dropped = expired.len(), "reaped expired workers");
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn eligible_count(&self) -> usize {
        let workers = self.workers.read().await;
        let now = Utc::now();
        workers.values().filter(|w| self.is_eligible(w, now)).count()
    }
}

pub type SharedWorkerRegistry = Arc<WorkerRegistry>;
