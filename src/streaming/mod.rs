// src/streaming/mod.rs

pub mod sse;

pub use sse::{SseBuffer, SseError, SseEvent};

use crate::classifier::{self, ErrorKind};
use crate::client::{ByteStream, TokenCounter};
use crate::key_manager::{KeyLease, KeyManager, ManagedKey};
use crate::metrics::METRICS;
use crate::types::TokenUsage;
use bytes::Bytes;
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// How a stream ended, for accounting.
enum StreamResult {
    Success,
    Failure(ErrorKind),
}

/// Wraps a committed provider stream.
///
/// Yields SSE-framed events (`data: {...}\n\n`, terminated by
/// `data: [DONE]\n\n`) reassembled from the provider's fragmented chunks.
/// Releases the key lease and records usage exactly once, on the terminal
/// event, an upstream error, an oversize buffer, or the consumer dropping
/// the stream early.
pub struct RotatorStream {
    upstream: Option<ByteStream>,
    buffer: SseBuffer,
    events: VecDeque<SseEvent>,
    out: VecDeque<Bytes>,
    lease: Option<KeyLease>,
    manager: Arc<KeyManager>,
    token_counter: Arc<dyn TokenCounter>,
    model: String,
    prompt_tokens: u64,
    content: String,
    provider_usage: Option<TokenUsage>,
    ended: bool,
    finalized: bool,
}

impl RotatorStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        upstream: ByteStream,
        buffer: SseBuffer,
        probed: Vec<SseEvent>,
        lease: KeyLease,
        manager: Arc<KeyManager>,
        token_counter: Arc<dyn TokenCounter>,
        model: String,
        prompt_tokens: u64,
    ) -> Self {
        Self {
            upstream: Some(upstream),
            buffer,
            events: probed.into(),
            out: VecDeque::new(),
            lease: Some(lease),
            manager,
            token_counter,
            model,
            prompt_tokens,
            content: String::new(),
            provider_usage: None,
            ended: false,
            finalized: false,
        }
    }

    fn frame(payload: &str) -> Bytes {
        Bytes::from(format!("data: {payload}\n\n"))
    }

    /// Folds one reassembled event into output frames and accounting state.
    fn ingest(&mut self, event: SseEvent) {
        match event {
            SseEvent::Done => {
                self.out.push_back(Self::frame("[DONE]"));
                self.ended = true;
                self.finalize(StreamResult::Success);
            }
            SseEvent::Json { payload, value } => {
                if value.get("error").is_some() {
                    // Output has already been committed to the consumer;
                    // surface a terminal error event and stop.
                    let provider_error = classifier::error_from_stream_payload(&value);
                    let kind = classifier::classify(&provider_error);
                    warn!(
                        model = %self.model,
                        kind = %kind,
                        "Mid-stream provider error after output; terminating stream"
                    );
                    METRICS.stream_errors_emitted_total.increment(1);
                    self.out.push_back(Self::frame(&payload));
                    self.out.push_back(Self::frame("[DONE]"));
                    self.ended = true;
                    self.finalize(StreamResult::Failure(kind));
                    return;
                }

                if let Some(usage) = value.get("usage") {
                    if let Ok(usage) = serde_json::from_value::<TokenUsage>(usage.clone()) {
                        self.provider_usage = Some(usage);
                    }
                }
                if let Some(delta) = extract_content_delta(&value) {
                    self.content.push_str(delta);
                }
                self.out.push_back(Self::frame(&payload));
            }
        }
    }

    /// Synthesizes a terminal error event for a failure the provider did
    /// not frame itself (transport error, oversize buffer).
    fn ingest_failure(&mut self, message: &str, kind: ErrorKind) {
        let payload = serde_json::json!({
            "error": {
                "message": message,
                "type": "stream_interrupted",
            }
        });
        warn!(model = %self.model, kind = %kind, error = %message, "Stream interrupted");
        METRICS.stream_errors_emitted_total.increment(1);
        self.out.push_back(Self::frame(&payload.to_string()));
        self.out.push_back(Self::frame("[DONE]"));
        self.ended = true;
        self.finalize(StreamResult::Failure(kind));
    }

    /// One-time teardown: close the upstream, release the lease, record the
    /// outcome. Idempotent.
    fn finalize(&mut self, result: StreamResult) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.upstream = None;

        let Some(mut lease) = self.lease.take() else {
            return;
        };
        let key: Arc<ManagedKey> = Arc::clone(lease.managed());
        let qualified = format!("{}/{}", lease.provider(), self.model);
        lease.release();

        match result {
            StreamResult::Success => {
                let usage = self.provider_usage.unwrap_or_else(|| TokenUsage {
                    prompt_tokens: self.prompt_tokens,
                    completion_tokens: self.token_counter.count(&qualified, &self.content),
                });
                self.manager.record_success(&key, &self.model, usage);
            }
            StreamResult::Failure(kind) => {
                self.manager.record_failure(&key, &self.model, kind);
            }
        }
        debug!(model = %self.model, "Stream finalized");
    }
}

impl Stream for RotatorStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(frame) = this.out.pop_front() {
                return Poll::Ready(Some(frame));
            }
            if this.ended {
                return Poll::Ready(None);
            }
            if let Some(event) = this.events.pop_front() {
                this.ingest(event);
                continue;
            }

            let Some(upstream) = this.upstream.as_mut() else {
                // Upstream already torn down without a terminal event.
                this.ended = true;
                this.finalize(StreamResult::Success);
                continue;
            };
            match upstream.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => match this.buffer.push(&chunk) {
                    Ok(events) => this.events.extend(events),
                    Err(SseError::Oversize { limit }) => {
                        this.ingest_failure(
                            &format!("event exceeded the {limit}-byte buffer limit"),
                            ErrorKind::Unknown,
                        );
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    let kind = classifier::classify(&e);
                    this.ingest_failure(&e.to_string(), kind);
                }
                Poll::Ready(None) => {
                    // Provider closed without [DONE]; treat as a clean end.
                    this.out.push_back(Self::frame("[DONE]"));
                    this.ended = true;
                    this.finalize(StreamResult::Success);
                }
            }
        }
    }
}

impl Drop for RotatorStream {
    fn drop(&mut self) {
        // Consumer abandoned the stream: locks and accounting must not
        // leak with it.
        if !self.finalized {
            debug!(model = %self.model, "Stream dropped before terminal event");
        }
        self.finalize(StreamResult::Success);
    }
}

/// Pulls the incremental text out of an OpenAI-style delta event, falling
/// back to a bare `content` field.
fn extract_content_delta(value: &serde_json::Value) -> Option<&str> {
    if let Some(content) = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(|content| content.as_str())
    {
        return Some(content);
    }
    value.get("content").and_then(|c| c.as_str())
}
