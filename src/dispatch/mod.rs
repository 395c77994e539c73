//! Dispatch queues (C4): pairs inbound client requests with outbound worker
//! polls and returns replies, with per-worker FIFO ordering, round-robin
//! fairness across workers (via the registry's `pick_next`), and strict
//! in-order stream chunk delivery.

pub mod ticket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto::EnvelopeRecord;
use crate::policy::errors::RelayError;
use crate::registry::WorkerRegistry;
use ticket::{StreamState, Ticket, TicketState};

/// One unit of work handed to a worker via its inbound channel.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request_id: String,
    pub client_public_key: String,
    pub envelope: EnvelopeRecord,
    pub model: Option<String>,
}

/// A published stream chunk descriptor, as carried by `/source`'s optional
/// `stream` object (§4.5).
#[derive(Debug, Clone, Copy)]
pub struct StreamChunkMeta {
    pub chunk_index: u64,
    pub final_chunk: bool,
}

struct WorkerChannel {
    sender: mpsc::Sender<QueuedRequest>,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedRequest>>>,
}

pub struct DispatchQueues {
    registry: Arc<WorkerRegistry>,
    channels: RwLock<HashMap<String, WorkerChannel>>,
    tickets: RwLock<HashMap<String, Ticket>>,
    inbound_capacity: usize,
    request_ttl: chrono::Duration,
    stream_gap_timeout: chrono::Duration,
}

impl DispatchQueues {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        inbound_capacity: usize,
        request_ttl_secs: i64,
        stream_gap_timeout_secs: i64,
    ) -> Self {
        Self {
            registry,
            channels: RwLock::new(HashMap::new()),
            tickets: RwLock::new(HashMap::new()),
            inbound_capacity,
            request_ttl: chrono::Duration::seconds(request_ttl_secs),
            stream_gap_timeout: chrono::Duration::seconds(stream_gap_timeout_secs),
        }
    }

    async fn channel_for(&self, worker_id: &str) -> (mpsc::Sender<QueuedRequest>, Arc<Mutex<mpsc::Receiver<QueuedRequest>>>) {
        {
            let channels = self.channels.read().await;
            if let Some(ch) = channels.get(worker_id) {
                return (ch.sender.clone(), ch.receiver.clone());
            }
        }
        let mut channels = self.channels.write().await;
        if let Some(ch) = channels.get(worker_id) {
            return (ch.sender.clone(), ch.receiver.clone());
        }
        let (tx, rx) = mpsc::channel(self.inbound_capacity);
        let rx = Arc::new(Mutex::new(rx));
        channels.insert(
            worker_id.to_string(),
            WorkerChannel {
                sender: tx.clone(),
                receiver: rx.clone(),
            },
        );
        (tx, rx)
    }

    /// §4.4 `submit`: picks a worker, allocates a ticket, and pushes the
    /// request onto that worker's inbound channel.
    pub async fn submit(
        &self,
        client_public_key: String,
        client_fingerprint: String,
        envelope: EnvelopeRecord,
        model: Option<String>,
        stream_session_id: Option<String>,
    ) -> Result<String, RelayError> {
        let worker_id = self
            .registry
            .pick_next()
            .await
            .ok_or(RelayError::NoWorkersAvailable)?;

        let request_id = Uuid::new_v4().to_string();
        let (sender, _) = self.channel_for(&worker_id).await;

        let queued = QueuedRequest {
            request_id: request_id.clone(),
            client_public_key,
            envelope,
            model,
        };

        sender.try_send(queued).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RelayError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RelayError::Internal,
        })?;

        let now = Utc::now();
        let state = match stream_session_id {
            Some(session_id) => TicketState::Streaming(StreamState::new(session_id, now)),
            None => TicketState::Pending,
        };
        let ticket = Ticket {
            request_id: request_id.clone(),
            client_fingerprint,
            worker_id: worker_id.clone(),
            created_at: now,
            state,
        };
        self.tickets.write().await.insert(request_id.clone(), ticket);
        debug!(request_id = %request_id, worker_id = %worker_id, "request dispatched");
        Ok(request_id)
    }

    /// §4.4 `worker_poll`: long-polls up to `blocking_timeout`, binding the
    /// request to the worker on delivery.
    pub async fn worker_poll(
        &self,
        worker_id: &str,
        blocking_timeout: StdDuration,
    ) -> Option<QueuedRequest> {
        let (_, receiver) = self.channel_for(worker_id).await;
        let mut receiver = receiver.lock().await;
        let recv = tokio::time::timeout(blocking_timeout, receiver.recv()).await;
        match recv {
            Ok(Some(req)) => {
                self.registry.bind(worker_id).await;
                Some(req)
            }
            _ => None,
        }
    }

    /// §4.4 `worker_publish`: stores a non-streaming reply, or appends a
    /// streaming chunk, releasing the worker's in-flight slot when the
    /// request is fully answered.
    pub async fn worker_publish(
        &self,
        worker_id: &str,
        request_id: &str,
        reply_envelope: EnvelopeRecord,
        stream_chunk: Option<StreamChunkMeta>,
    ) -> Result<(), RelayError> {
        let mut tickets = self.tickets.write().await;
        let ticket = tickets.get_mut(request_id).ok_or(RelayError::UnboundRequest)?;
        if ticket.worker_id != worker_id {
            return Err(RelayError::UnboundRequest);
        }

        let well_formed = reply_envelope.is_plaintext_stub()
            || (!reply_envelope.ciphertext.is_empty() && !reply_envelope.cipherkey.is_empty() && !reply_envelope.iv.is_empty());
        if !well_formed {
            ticket.state = TicketState::BadUpstream;
            self.registry.release(worker_id).await;
            return Err(RelayError::BadUpstream);
        }

        match stream_chunk {
            Some(meta) => {
                let now = Utc::now();
                let stream_state = match &mut ticket.state {
                    TicketState::Streaming(s) => s,
                    TicketState::Pending => {
                        let session_id = reply_envelope
                            .stream_session_id
                            .clone()
                            .unwrap_or_else(|| request_id.to_string());
                        ticket.state = TicketState::Streaming(StreamState::new(session_id, now));
                        match &mut ticket.state {
                            TicketState::Streaming(s) => s,
                            _ => unreachable!(),
                        }
                    }
                    _ => return Err(RelayError::UnboundRequest),
                };
                stream_state.publish_chunk(reply_envelope, now);
                if meta.final_chunk {
                    self.registry.release(worker_id).await;
                }
            }
            None => {
                ticket.state = TicketState::Ready(reply_envelope);
                self.registry.release(worker_id).await;
            }
        }
        Ok(())
    }

    /// §4.4 `client_retrieve`. `Ok(None)` means still pending.
    pub async fn client_retrieve(
        &self,
        request_id: &str,
        client_fingerprint: &str,
    ) -> Result<Option<EnvelopeRecord>, RelayError> {
        let mut tickets = self.tickets.write().await;
        let ticket = tickets.get(request_id).ok_or(RelayError::TicketExpired)?;

        if ticket.client_fingerprint != client_fingerprint {
            return Err(RelayError::Unauthorized);
        }

        let now = Utc::now();
        if ticket.is_expired(now, self.request_ttl) {
            tickets.remove(request_id);
            return Err(RelayError::TicketExpired);
        }

        match &ticket.state {
            TicketState::Pending | TicketState::Streaming(_) => Ok(None),
            TicketState::Ready(envelope) => {
                let envelope = envelope.clone();
                tickets.remove(request_id);
                Ok(Some(envelope))
            }
            TicketState::WorkerGone => {
                tickets.remove(request_id);
                Err(RelayError::WorkerGone)
            }
            TicketState::BadUpstream => {
                tickets.remove(request_id);
                Err(RelayError::BadUpstream)
            }
        }
    }

    /// §4.4 `client_stream_retrieve`: returns the contiguous run of chunks
    /// available from `from_index`, plus `final_seen`/`last_activity`.
    /// Fails the ticket if the gap has outlived `STREAM_GAP_TIMEOUT`.
    pub async fn client_stream_retrieve(
        &self,
        request_id: &str,
        client_fingerprint: &str,
        from_index: u64,
    ) -> Result<(Vec<EnvelopeRecord>, bool, DateTime<Utc>), RelayError> {
        let mut tickets = self.tickets.write().await;
        let ticket = tickets.get_mut(request_id).ok_or(RelayError::TicketExpired)?;

        if ticket.client_fingerprint != client_fingerprint {
            return Err(RelayError::Unauthorized);
        }

        let now = Utc::now();
        if ticket.is_expired(now, self.request_ttl) {
            tickets.remove(request_id);
            return Err(RelayError::TicketExpired);
        }

        let stream_state = match &mut ticket.state {
            TicketState::Streaming(s) => s,
            TicketState::WorkerGone => return Err(RelayError::WorkerGone),
            TicketState::BadUpstream => return Err(RelayError::BadUpstream),
            _ => return Err(RelayError::InvalidInput),
        };

        if stream_state.gap_is_stale(now, self.stream_gap_timeout) {
            stream_state.failed = true;
        }
        if stream_state.failed {
            let worker_id = ticket.worker_id.clone();
            tickets.remove(request_id);
            self.registry.release(&worker_id).await;
            return Err(RelayError::ChunkIntegrity);
        }

        let chunks = stream_state.drain_contiguous_from(from_index);
        let final_seen = stream_state.final_seen && stream_state.chunks.len() as u64 == stream_state.next_deliverable_index;
        let last_activity = stream_state.last_activity;

        if final_seen {
            tickets.remove(request_id);
        }

        Ok((chunks, final_seen, last_activity))
    }

    /// Sweeps expired tickets (§3 lifecycle). Call periodically.
    pub async fn reap_tickets(&self) {
        let mut tickets = self.tickets.write().await;
        let now = Utc::now();
        let ttl = self.request_ttl;
        let expired: Vec<(String, String)> = tickets
            .iter()
            .filter(|(_, t)| t.is_expired(now, ttl))
            .map(|(id, t)| (id.clone(), t.worker_id.clone()))
            .collect();
        for (id, _worker_id) in &expired {
            tickets.remove(id);
        }
        drop(tickets);
        for (_, worker_id) in &expired {
            self.registry.release(worker_id).await;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired tickets");
        }
    }

    /// Marks any ticket still bound to `worker_id` as worker-gone. Call
    /// after `WorkerRegistry::reap` returns ids it dropped (§4.4).
    pub async fn mark_worker_gone(&self, worker_id: &str) {
        let mut tickets = self.tickets.write().await;
        let mut count = 0;
        for ticket in tickets.values_mut() {
            if ticket.worker_id == worker_id && matches!(ticket.state, TicketState::Pending | TicketState::Streaming(_)) {
                ticket.state = TicketState::WorkerGone;
                count += 1;
            }
        }
        if count > 0 {
            warn!(worker_id, count, "marked tickets worker-gone");
        }
    }

    pub async fn ticket_count(&self) -> usize {
        self.tickets.read().await.len()
    }
}

pub type SharedDispatchQueues = Arc<DispatchQueues>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encode_public_key, EnvelopeRecord};
    use rand::rngs::OsRng;
    use rsa::{RsaPrivateKey, RsaPublicKey};

    async fn registry_with_one_worker() -> (Arc<WorkerRegistry>, String) {
        let registry = Arc::new(WorkerRegistry::new(300, 4, None));
        let priv_key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let pub_key = RsaPublicKey::from(&priv_key);
        let key_b64 = encode_public_key(&pub_key).unwrap();
        registry.announce("worker-a", &key_b64, None).await.unwrap();
        (registry, key_b64)
    }

    fn sample_envelope() -> EnvelopeRecord {
        EnvelopeRecord {
            ciphertext: "Y2lwaGVy".into(),
            cipherkey: "a2V5".into(),
            iv: "aXY=".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn submit_then_poll_then_publish_then_retrieve_round_trips() {
        let (registry, _) = registry_with_one_worker().await;
        let queues = DispatchQueues::new(registry, 8, 60, 10);

        let request_id = queues
            .submit("client-pub".into(), "fp-1".into(), sample_envelope(), None, None)
            .await
            .unwrap();

        let delivered = queues
            .worker_poll("worker-a", StdDuration::from_millis(200))
            .await
            .expect("request delivered");
        assert_eq!(delivered.request_id, request_id);

        assert!(queues
            .client_retrieve(&request_id, "fp-1")
            .await
            .unwrap()
            .is_none());

        queues
            .worker_publish("worker-a", &request_id, sample_envelope(), None)
            .await
            .unwrap();

        let reply = queues.client_retrieve(&request_id, "fp-1").await.unwrap();
        assert!(reply.is_some());

        // Ticket is gone after retrieval.
        assert!(matches!(
            queues.client_retrieve(&request_id, "fp-1").await,
            Err(RelayError::TicketExpired)
        ));
    }

    #[tokio::test]
    async fn submit_fails_with_no_workers_available() {
        let registry = Arc::new(WorkerRegistry::new(300, 4, None));
        let queues = DispatchQueues::new(registry, 8, 60, 10);
        let err = queues
            .submit("client-pub".into(), "fp-1".into(), sample_envelope(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoWorkersAvailable));
    }

    #[tokio::test]
    async fn queue_full_is_reported() {
        let (registry, _) = registry_with_one_worker().await;
        let queues = DispatchQueues::new(registry, 1, 60, 10);
        queues
            .submit("c".into(), "fp-1".into(), sample_envelope(), None, None)
            .await
            .unwrap();
        let err = queues
            .submit("c".into(), "fp-2".into(), sample_envelope(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::QueueFull));
    }

    #[tokio::test]
    async fn retrieve_by_wrong_fingerprint_is_unauthorized() {
        let (registry, _) = registry_with_one_worker().await;
        let queues = DispatchQueues::new(registry, 8, 60, 10);
        let request_id = queues
            .submit("c".into(), "fp-a".into(), sample_envelope(), None, None)
            .await
            .unwrap();
        let err = queues.client_retrieve(&request_id, "fp-b").await.unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized));
        // The legitimate owner can still retrieve.
        assert!(queues.client_retrieve(&request_id, "fp-a").await.is_ok());
    }

    #[tokio::test]
    async fn publish_from_non_owning_worker_is_unbound() {
        let registry = Arc::new(WorkerRegistry::new(300, 4, None));
        let priv_key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let pub_key = RsaPublicKey::from(&priv_key);
        let key_b64 = encode_public_key(&pub_key).unwrap();
        registry.announce("worker-a", &key_b64, None).await.unwrap();
        registry.announce("worker-b", &key_b64, None).await.unwrap();

        let queues = DispatchQueues::new(registry, 8, 60, 10);
        let request_id = queues
            .submit("c".into(), "fp-1".into(), sample_envelope(), None, None)
            .await
            .unwrap();

        let err = queues
            .worker_publish("worker-b", &request_id, sample_envelope(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnboundRequest));
    }

    #[tokio::test]
    async fn stream_chunks_deliver_only_contiguous_prefix() {
        let (registry, _) = registry_with_one_worker().await;
        let queues = DispatchQueues::new(registry, 8, 60, 10);
        let request_id = queues
            .submit(
                "c".into(),
                "fp-1".into(),
                sample_envelope(),
                None,
                Some("sess-1".into()),
            )
            .await
            .unwrap();

        let mut chunk0 = sample_envelope();
        chunk0.chunk_index = Some(0);
        let mut chunk2 = sample_envelope();
        chunk2.chunk_index = Some(2);

        queues
            .worker_publish(
                "worker-a",
                &request_id,
                chunk0,
                Some(StreamChunkMeta { chunk_index: 0, final_chunk: false }),
            )
            .await
            .unwrap();
        queues
            .worker_publish(
                "worker-a",
                &request_id,
                chunk2,
                Some(StreamChunkMeta { chunk_index: 2, final_chunk: false }),
            )
            .await
            .unwrap();

        let (chunks, final_seen, _) = queues
            .client_stream_retrieve(&request_id, "fp-1", 0)
            .await
            .unwrap();
        // Index 1 hasn't arrived yet, so only index 0 is deliverable.
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, Some(0));
        assert!(!final_seen);
    }

    #[tokio::test]
    async fn worker_gone_surfaces_to_client_retrieve() {
        let (registry, _) = registry_with_one_worker().await;
        let queues = DispatchQueues::new(Arc::clone(&registry), 8, 60, 10);
        let request_id = queues
            .submit("c".into(), "fp-1".into(), sample_envelope(), None, None)
            .await
            .unwrap();

        queues.mark_worker_gone("worker-a").await;

        let err = queues.client_retrieve(&request_id, "fp-1").await.unwrap_err();
        assert!(matches!(err, RelayError::WorkerGone));
    }

    #[tokio::test]
    async fn bad_upstream_envelope_is_rejected() {
        let (registry, _) = registry_with_one_worker().await;
        let queues = DispatchQueues::new(registry, 8, 60, 10);
        let request_id = queues
            .submit("c".into(), "fp-1".into(), sample_envelope(), None, None)
            .await
            .unwrap();

        let malformed = EnvelopeRecord::default();
        let err = queues
            .worker_publish("worker-a", &request_id, malformed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::BadUpstream));

        let err = queues.client_retrieve(&request_id, "fp-1").await.unwrap_err();
        assert!(matches!(err, RelayError::BadUpstream));
    }
}
