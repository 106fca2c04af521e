// src/client.rs

use crate::types::{CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use futures::Stream;
use secrecy::SecretString;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// A raw provider event stream: arbitrary byte chunks, SSE-framed by the
/// provider but fragmented at transport boundaries.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// A failure raised by the provider transport or API. The engine never
/// interprets these directly; they go through the classifier.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed provider payload: {0}")]
    Payload(String),
}

impl ProviderError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Timeout(m) | Self::Connection(m) | Self::Payload(m) => m,
            Self::Api { message, .. } => message,
        }
    }
}

/// The cross-provider transport. One implementation is shared by every task
/// in a dispatcher; its connection pool must cover the dispatcher's
/// concurrency.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        key: &SecretString,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    async fn stream_complete(
        &self,
        model: &str,
        key: &SecretString,
        request: &CompletionRequest,
    ) -> Result<ByteStream, ProviderError>;

    async fn embed(
        &self,
        model: &str,
        key: &SecretString,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ProviderError>;
}

/// Counts tokens for usage estimation when the provider omits them.
pub trait TokenCounter: Send + Sync {
    fn count(&self, model: &str, text: &str) -> u64;
}

/// Fallback estimator: roughly four characters per token. Good enough for
/// approximate accounting; hosts with a real tokenizer inject their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, _model: &str, text: &str) -> u64 {
        (text.chars().count() as u64).div_ceil(4)
    }
}

/// Time source. Injected so deadline and daily-reset behavior are testable.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar date in the reset timezone. Daily rollover happens when this
    /// advances.
    fn local_date(&self) -> NaiveDate;

    /// The instant the current local day ends. Quota-exhausted cooldowns
    /// run until this.
    fn next_local_midnight(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio time. An explicit timezone pins the daily
/// reset boundary; otherwise the host's local zone is used.
#[derive(Debug, Default, Clone)]
pub struct SystemClock {
    reset_zone: Option<Tz>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reset_zone(zone: Tz) -> Self {
        Self {
            reset_zone: Some(zone),
        }
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_date(&self) -> NaiveDate {
        match self.reset_zone {
            Some(tz) => Utc::now().with_timezone(&tz).date_naive(),
            None => chrono::Local::now().date_naive(),
        }
    }

    fn next_local_midnight(&self) -> DateTime<Utc> {
        let tomorrow = self
            .local_date()
            .succ_opt()
            .expect("calendar does not end tomorrow")
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time");
        match self.reset_zone {
            Some(tz) => tomorrow
                .and_local_timezone(tz)
                .earliest()
                .map(|t| t.with_timezone(&Utc))
                // A DST gap exactly at midnight: fall back to treating the
                // naive instant as UTC rather than failing the cooldown.
                .unwrap_or_else(|| chrono::TimeZone::from_utc_datetime(&Utc, &tomorrow)),
            None => tomorrow
                .and_local_timezone(chrono::Local)
                .earliest()
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|| chrono::TimeZone::from_utc_datetime(&Utc, &tomorrow)),
        }
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Enumerates the models a credential can reach. Wired at construction;
/// replaces runtime plugin scanning with an explicit registry.
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    async fn get_models(
        &self,
        provider: &str,
        key: &SecretString,
    ) -> Result<Vec<String>, ProviderError>;
}

/// Registry that knows no models. Used when the host does not need
/// discovery.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyRegistry;

#[async_trait]
impl ProviderRegistry for EmptyRegistry {
    async fn get_models(
        &self,
        _provider: &str,
        _key: &SecretString,
    ) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }
}
