// tests/common/mod.rs
//
// Shared test doubles: a scripted transport and a hand-cranked clock.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use futures::StreamExt;
use llm_rotator::{
    ByteStream, Clock, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, LLMClient, ProviderError, RotatorStream, TokenUsage,
};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Mutex;
use std::time::Duration;

pub type CompleteFn =
    dyn Fn(&str, &str) -> Result<CompletionResponse, ProviderError> + Send + Sync;
pub type StreamFn =
    dyn Fn(&str, &str) -> Result<Vec<Result<Bytes, ProviderError>>, ProviderError> + Send + Sync;

/// Transport whose behavior is a function of (model, key). Records every
/// key it was called with, in order.
pub struct MockLLM {
    calls: Mutex<Vec<String>>,
    complete_fn: Box<CompleteFn>,
    stream_fn: Option<Box<StreamFn>>,
    delay: Option<Duration>,
}

impl MockLLM {
    pub fn completing(
        f: impl Fn(&str, &str) -> Result<CompletionResponse, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            complete_fn: Box::new(f),
            stream_fn: None,
            delay: None,
        }
    }

    pub fn streaming(
        f: impl Fn(&str, &str) -> Result<Vec<Result<Bytes, ProviderError>>, ProviderError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            complete_fn: Box::new(|_, _| {
                Err(ProviderError::api(500, "not a completion transport"))
            }),
            stream_fn: Some(Box::new(f)),
            delay: None,
        }
    }

    /// Adds per-call latency, for concurrency timing tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn keys_called(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn note_call(&self, key: &SecretString) {
        self.calls
            .lock()
            .unwrap()
            .push(key.expose_secret().to_string());
    }
}

#[async_trait]
impl LLMClient for MockLLM {
    async fn complete(
        &self,
        model: &str,
        key: &SecretString,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.note_call(key);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.complete_fn)(model, key.expose_secret())
    }

    async fn stream_complete(
        &self,
        model: &str,
        key: &SecretString,
        _request: &CompletionRequest,
    ) -> Result<ByteStream, ProviderError> {
        self.note_call(key);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let stream_fn = self
            .stream_fn
            .as_ref()
            .expect("stream_fn configured for streaming tests");
        let chunks = stream_fn(model, key.expose_secret())?;
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn embed(
        &self,
        _model: &str,
        key: &SecretString,
        _request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ProviderError> {
        self.note_call(key);
        Ok(EmbeddingResponse {
            data: serde_json::json!([{"index": 0, "embedding": [0.0, 0.1]}]),
            usage: Some(TokenUsage {
                prompt_tokens: 1,
                completion_tokens: 0,
            }),
            extra: serde_json::Map::new(),
        })
    }
}

/// Clock advanced only by its own `sleep`. Deadline and cooldown waits
/// resolve instantly and deterministically.
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()),
        }
    }

    pub fn current(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, duration: Duration) {
        *self.now.lock().unwrap() +=
            chrono::Duration::from_std(duration).expect("advance fits in chrono range");
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.current()
    }

    fn local_date(&self) -> NaiveDate {
        self.current().date_naive()
    }

    fn next_local_midnight(&self) -> DateTime<Utc> {
        let tomorrow = self
            .local_date()
            .succ_opt()
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        Utc.from_utc_datetime(&tomorrow)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

pub fn ok_response(content: &str, prompt_tokens: u64, completion_tokens: u64) -> CompletionResponse {
    CompletionResponse {
        content: content.to_string(),
        usage: Some(TokenUsage {
            prompt_tokens,
            completion_tokens,
        }),
        extra: serde_json::Map::new(),
    }
}

pub fn sse_chunk(value: serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

pub fn delta_chunk(text: &str) -> Bytes {
    sse_chunk(serde_json::json!({
        "choices": [{"delta": {"content": text}}]
    }))
}

pub fn done_chunk() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Drains a wrapped stream into its SSE payload strings (without framing).
pub async fn collect_payloads(stream: RotatorStream) -> Vec<String> {
    let frames: Vec<Bytes> = stream.collect().await;
    frames
        .iter()
        .map(|frame| {
            let text = std::str::from_utf8(frame).expect("frames are utf-8");
            text.trim_end_matches("\n\n")
                .strip_prefix("data: ")
                .expect("frames are SSE data lines")
                .to_string()
        })
        .collect()
}
