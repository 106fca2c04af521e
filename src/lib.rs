// src/lib.rs
//
// Resilient API-key rotation and request dispatch engine for LLM providers.
//
// The engine accepts logical completion and embedding requests, selects an
// eligible credential from a per-provider pool, dispatches through an
// injected transport, and recovers from transient and credential failures
// by retrying and rotating keys under a strict end-to-end deadline.
// Streaming responses are reassembled from fragmented chunks and release
// their locks exactly once at stream end.

pub mod classifier;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod key_manager;
pub mod metrics;
pub mod pricing;
pub mod storage;
pub mod streaming;
pub mod types;

pub use classifier::{classify, ErrorKind};
pub use client::{
    ByteStream, Clock, EmptyRegistry, HeuristicTokenCounter, LLMClient, ProviderError,
    ProviderRegistry, SystemClock, TokenCounter,
};
pub use config::RotatorConfig;
pub use dispatcher::{CompletionOutcome, RotatingClient, RotatingClientBuilder};
pub use error::{Result, RotatorError};
pub use key_manager::{KeyLease, KeyManager, SelectError, UsageWindow};
pub use storage::{JsonFileStore, NullStore, PersistentStore, UsageSnapshot};
pub use streaming::RotatorStream;
pub use types::{
    CompletionRequest, CompletionResponse, EmbeddingInput, EmbeddingRequest, EmbeddingResponse,
    Message, ModelId, TokenUsage,
};
