//! OpenAI-compatible request surface (C6): maps `/v1/chat/completions` onto
//! the envelope submit/retrieve cycle and produces SSE deltas for streaming
//! requests, mirroring OpenAI's own `ChatCompletion` response shape.

pub mod types;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::stream::{self, Stream};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::crypto::{self, EnvelopeRecord};
use crate::policy::errors::{RelayError, RelayResult};
use crate::policy::rate_limit::RateLimitedOp;
use crate::RelayContext;
use types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, Delta, StreamChoice, Usage};

const POLL_INTERVAL: Duration = Duration::from_millis(40);

pub async fn chat_completions(State(ctx): State<Arc<RelayContext>>, Json(body): Json<ChatCompletionRequest>) -> Response {
    if body.stream {
        match begin_submission(&ctx, &body).await {
            Ok((request_id, fingerprint, model)) => {
                streaming_response(ctx, request_id, fingerprint, model, body.metadata).into_response()
            }
            Err(err) => err.into_response(),
        }
    } else {
        match complete(&ctx, body).await {
            Ok(resp) => Json(resp).into_response(),
            Err(err) => err.into_response(),
        }
    }
}

/// Builds the submit envelope for either mode and hands it to dispatch,
/// returning the ticket identity needed to retrieve the reply.
async fn begin_submission(ctx: &Arc<RelayContext>, body: &ChatCompletionRequest) -> RelayResult<(String, String, String)> {
    if ctx.is_draining() {
        return Err(RelayError::NoWorkersAvailable);
    }

    let model = body.model.clone().unwrap_or_else(|| "default".to_string());

    let (client_public_key, fingerprint, envelope) = if body.encrypted {
        let client_public_key = body
            .client_public_key
            .clone()
            .ok_or(RelayError::MissingField("client_public_key"))?;
        let client_key = crypto::decode_public_key(&client_public_key)?;
        let fingerprint = crypto::fingerprint(&client_key)?;
        let mut envelope: EnvelopeRecord =
            serde_json::from_value(body.messages.clone()).map_err(|_| RelayError::InvalidInput)?;
        envelope.model = Some(model.clone());
        envelope.stream = Some(body.stream);
        (client_public_key, fingerprint, envelope)
    } else {
        // Plaintext mode has no real client keypair; the relay's own public
        // key stands in as the submitting identity so the existing
        // ticket/rate-limit machinery needs no parallel path (§4.6, §9
        // Non-goals: plaintext is test/non-sensitive traffic only).
        let client_public_key = ctx.keys.own_public_key_b64().await?;
        let fingerprint = crypto::fingerprint(&ctx.keys.own_public_key().await)?;
        let mut envelope = EnvelopeRecord::stub_plaintext(json!({ "messages": body.messages }));
        envelope.model = Some(model.clone());
        envelope.stream = Some(body.stream);
        (client_public_key, fingerprint, envelope)
    };

    ctx.rate_limiter
        .check(&fingerprint, RateLimitedOp::Submit)
        .await
        .map_err(|retry_after_secs| RelayError::RateLimited { retry_after_secs })?;

    let stream_session_id = body.stream.then(|| Uuid::new_v4().to_string());
    let mut envelope = envelope;
    if body.stream {
        envelope.stream_session_id = stream_session_id.clone();
    }

    let request_id = ctx
        .dispatch
        .submit(client_public_key, fingerprint.clone(), envelope, Some(model.clone()), stream_session_id)
        .await?;

    Ok((request_id, fingerprint, model))
}

async fn complete(ctx: &Arc<RelayContext>, body: ChatCompletionRequest) -> RelayResult<ChatCompletionResponse> {
    let metadata = body.metadata.clone();
    let (request_id, fingerprint, model) = begin_submission(ctx, &body).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(ctx.config.relay_timeout);
    let envelope = loop {
        if let Some(envelope) = ctx.dispatch.client_retrieve(&request_id, &fingerprint).await? {
            break envelope;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RelayError::TicketExpired);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    let (message, usage) = reply_to_message(&envelope);

    Ok(ChatCompletionResponse {
        id: format!("chatcmpl-{request_id}"),
        object: "chat.completion",
        created: chrono::Utc::now().timestamp(),
        model,
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: "stop".to_string(),
        }],
        usage,
        metadata,
    })
}

/// Plaintext replies carry `{role, content, usage?}` in `envelope.plaintext`.
/// Encrypted replies are opaque to the relay; it serializes the envelope
/// itself as the message content for the client to decrypt (§4.6).
fn reply_to_message(envelope: &EnvelopeRecord) -> (ChatMessage, Usage) {
    if let Some(plaintext) = &envelope.plaintext {
        let role = plaintext.get("role").and_then(Value::as_str).unwrap_or("assistant").to_string();
        let content = plaintext.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
        let usage = plaintext
            .get("usage")
            .and_then(|v| serde_json::from_value::<Usage>(v.clone()).ok())
            .unwrap_or_default();
        (ChatMessage { role, content }, usage)
    } else {
        let content = serde_json::to_string(envelope).unwrap_or_default();
        (
            ChatMessage {
                role: "assistant".to_string(),
                content,
            },
            Usage::default(),
        )
    }
}

fn streaming_response(
    ctx: Arc<RelayContext>,
    request_id: String,
    fingerprint: String,
    model: String,
    metadata: Option<Value>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(drive_stream(ctx, request_id, fingerprint, model, metadata)).keep_alive(
        KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"),
    )
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Role,
    Chunks,
    FinishReason,
    Done,
    Closed,
}

struct DriveState {
    ctx: Arc<RelayContext>,
    request_id: String,
    fingerprint: String,
    model: String,
    id: String,
    created: i64,
    metadata: Option<Value>,
    next_index: u64,
    phase: Phase,
    pending: std::collections::VecDeque<EnvelopeRecord>,
}

fn drive_stream(
    ctx: Arc<RelayContext>,
    request_id: String,
    fingerprint: String,
    model: String,
    metadata: Option<Value>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let id = format!("chatcmpl-{request_id}");
    let created = chrono::Utc::now().timestamp();
    let state = DriveState {
        ctx,
        request_id,
        fingerprint,
        model,
        id,
        created,
        metadata,
        next_index: 0,
        phase: Phase::Role,
        pending: std::collections::VecDeque::new(),
    };

    stream::unfold(state, |mut state| async move {
        loop {
            match state.phase {
                Phase::Role => {
                    state.phase = Phase::Chunks;
                    let chunk = ChatCompletionChunk {
                        id: state.id.clone(),
                        object: "chat.completion.chunk",
                        created: state.created,
                        model: state.model.clone(),
                        choices: vec![StreamChoice {
                            index: 0,
                            delta: Delta {
                                role: Some("assistant".to_string()),
                                content: None,
                            },
                            finish_reason: None,
                        }],
                        metadata: state.metadata.clone(),
                    };
                    let event = Event::default().data(serde_json::to_string(&chunk).unwrap_or_default());
                    return Some((Ok(event), state));
                }
                Phase::Chunks => {
                    if let Some(envelope) = state.pending.pop_front() {
                        let content = chunk_content(&envelope);
                        state.next_index += 1;
                        let chunk = ChatCompletionChunk {
                            id: state.id.clone(),
                            object: "chat.completion.chunk",
                            created: state.created,
                            model: state.model.clone(),
                            choices: vec![StreamChoice {
                                index: 0,
                                delta: Delta {
                                    role: None,
                                    content: Some(content),
                                },
                                finish_reason: None,
                            }],
                            metadata: state.metadata.clone(),
                        };
                        let event = Event::default().data(serde_json::to_string(&chunk).unwrap_or_default());
                        return Some((Ok(event), state));
                    }

                    match state
                        .ctx
                        .dispatch
                        .client_stream_retrieve(&state.request_id, &state.fingerprint, state.next_index)
                        .await
                    {
                        Ok((chunks, final_seen, _last_activity)) => {
                            if chunks.is_empty() {
                                if final_seen {
                                    state.phase = Phase::FinishReason;
                                    continue;
                                }
                                tokio::time::sleep(POLL_INTERVAL).await;
                                continue;
                            }
                            state.pending.extend(chunks);
                            if final_seen && state.pending.is_empty() {
                                state.phase = Phase::FinishReason;
                            }
                            continue;
                        }
                        Err(_) => {
                            state.phase = Phase::FinishReason;
                            continue;
                        }
                    }
                }
                Phase::FinishReason => {
                    state.phase = Phase::Done;
                    let chunk = ChatCompletionChunk {
                        id: state.id.clone(),
                        object: "chat.completion.chunk",
                        created: state.created,
                        model: state.model.clone(),
                        choices: vec![StreamChoice {
                            index: 0,
                            delta: Delta::default(),
                            finish_reason: Some("stop".to_string()),
                        }],
                        metadata: state.metadata.clone(),
                    };
                    let event = Event::default().data(serde_json::to_string(&chunk).unwrap_or_default());
                    return Some((Ok(event), state));
                }
                Phase::Done => {
                    state.phase = Phase::Closed;
                    return Some((Ok(Event::default().data("[DONE]")), state));
                }
                Phase::Closed => return None,
            }
        }
    })
}

/// Plaintext chunks carry `{content}` in `envelope.plaintext`; encrypted
/// chunks are returned as the envelope record itself, which the client
/// decrypts with the stream session key handed back in the first frame
/// (§4.6).
fn chunk_content(envelope: &EnvelopeRecord) -> Value {
    if let Some(plaintext) = &envelope.plaintext {
        plaintext
            .get("content")
            .cloned()
            .unwrap_or(Value::String(String::new()))
    } else {
        serde_json::to_value(envelope).unwrap_or(Value::Null)
    }
}
