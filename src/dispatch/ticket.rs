//! Ticket and stream-state types backing the dispatch queues (§3, C4).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::crypto::EnvelopeRecord;

/// One request's lifecycle state, from submit through retrieve or expiry.
#[derive(Debug, Clone)]
pub enum TicketState {
    Pending,
    Ready(EnvelopeRecord),
    Streaming(StreamState),
    WorkerGone,
    BadUpstream,
}

#[derive(Debug, Clone)]
pub struct Ticket {
    pub request_id: String,
    pub client_fingerprint: String,
    pub worker_id: String,
    pub created_at: DateTime<Utc>,
    pub state: TicketState,
}

impl Ticket {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.created_at) >= ttl
    }
}

/// Buffer of stream chunks published by a worker, keyed by `chunk_index`
/// (§3). The relay never decrypts chunks; it only orders and forwards them,
/// so decryption-level tamper detection happens client-side — this layer's
/// job is purely delivery ordering and gap timeout enforcement.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub stream_session_id: String,
    pub chunks: BTreeMap<u64, EnvelopeRecord>,
    pub next_deliverable_index: u64,
    pub final_seen: bool,
    pub last_activity: DateTime<Utc>,
    pub failed: bool,
}

impl StreamState {
    pub fn new(stream_session_id: String, now: DateTime<Utc>) -> Self {
        Self {
            stream_session_id,
            chunks: BTreeMap::new(),
            next_deliverable_index: 0,
            final_seen: false,
            last_activity: now,
            failed: false,
        }
    }

    /// Records one published chunk. Order of arrival may differ from
    /// `chunk_index` order; storage does not require contiguity.
    pub fn publish_chunk(&mut self, record: EnvelopeRecord, now: DateTime<Utc>) {
        if let Some(idx) = record.chunk_index {
            if record.final_chunk == Some(true) {
                self.final_seen = true;
            }
            self.chunks.insert(idx, record);
            self.last_activity = now;
        }
    }

    /// Returns the contiguous run of chunks starting at `from_index`, up to
    /// the first gap, and advances `next_deliverable_index` past what was
    /// returned. Chunks before `from_index` are never re-delivered (strict
    /// in-order delivery, §5).
    pub fn drain_contiguous_from(&mut self, from_index: u64) -> Vec<EnvelopeRecord> {
        let mut out = Vec::new();
        let mut idx = from_index.max(self.next_deliverable_index);
        while let Some(chunk) = self.chunks.get(&idx) {
            out.push(chunk.clone());
            idx += 1;
        }
        self.next_deliverable_index = idx;
        out
    }

    pub fn has_gap_before_next(&self) -> bool {
        !self.chunks.contains_key(&self.next_deliverable_index) && !self.final_seen
    }

    pub fn gap_is_stale(&self, now: DateTime<Utc>, gap_timeout: chrono::Duration) -> bool {
        self.has_gap_before_next() && now.signed_duration_since(self.last_activity) >= gap_timeout
    }
}
