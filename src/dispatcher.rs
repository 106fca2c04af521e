// src/dispatcher.rs

use crate::classifier::{self, ErrorKind};
use crate::client::{
    ByteStream, Clock, EmptyRegistry, HeuristicTokenCounter, LLMClient, ProviderError,
    ProviderRegistry, SystemClock, TokenCounter,
};
use crate::config::RotatorConfig;
use crate::error::{Result, RotatorError};
use crate::key_manager::{KeyLease, KeyManager, SelectError};
use crate::metrics::METRICS;
use crate::storage::{JsonFileStore, NullStore, PersistentStore, SnapshotWriter};
use crate::streaming::{RotatorStream, SseBuffer, SseEvent};
use crate::types::{
    CompletionRequest, CompletionResponse, EmbeddingInput, EmbeddingRequest, EmbeddingResponse,
    ModelId, TokenUsage,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Result of a successful completion dispatch.
pub enum CompletionOutcome {
    /// The provider's full response.
    Response(CompletionResponse),
    /// A live event stream; locks and accounting ride inside it.
    Stream(RotatorStream),
}

impl std::fmt::Debug for CompletionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Response(_) => f.write_str("CompletionOutcome::Response"),
            Self::Stream(_) => f.write_str("CompletionOutcome::Stream"),
        }
    }
}

enum DispatchOp<'a> {
    Complete(&'a CompletionRequest),
    Stream(&'a CompletionRequest),
    Embed(&'a EmbeddingRequest),
}

enum CallOutcome {
    Response(CompletionResponse, KeyLease),
    Embedding(EmbeddingResponse, KeyLease),
    Stream(RotatorStream),
    Failed(KeyLease, ProviderError),
}

enum Dispatched {
    Response(CompletionResponse),
    Embedding(EmbeddingResponse),
    Stream(RotatorStream),
}

/// Fronts a pool of provider credentials: selects a key per request,
/// dispatches through the injected transport, and recovers from transient
/// and credential failures by retrying and rotating under a strict
/// end-to-end deadline.
pub struct RotatingClient {
    manager: Arc<KeyManager>,
    llm: Arc<dyn LLMClient>,
    token_counter: Arc<dyn TokenCounter>,
    clock: Arc<dyn Clock>,
    registry: Arc<dyn ProviderRegistry>,
    config: RotatorConfig,
    writer: AsyncMutex<Option<SnapshotWriter>>,
    reset_task: AsyncMutex<Option<JoinHandle<()>>>,
    model_cache: RwLock<Option<Vec<String>>>,
    closed: AtomicBool,
}

impl RotatingClient {
    pub fn builder() -> RotatingClientBuilder {
        RotatingClientBuilder::new()
    }

    /// Dispatches a completion. Returns `None` when the deadline passed or
    /// every eligible key was consumed by transient or credential
    /// failures; such failures are never surfaced directly.
    pub async fn acompletion(
        &self,
        request: &CompletionRequest,
    ) -> Result<Option<CompletionOutcome>> {
        self.ensure_open()?;
        let model = ModelId::parse(&request.model)?;
        METRICS.requests_total.increment(1);

        let op = if request.stream {
            METRICS.requests_streaming_total.increment(1);
            DispatchOp::Stream(request)
        } else {
            DispatchOp::Complete(request)
        };

        let span = info_span!(
            "acompletion",
            request_id = %Uuid::new_v4(),
            model = %model,
            stream = request.stream,
        );
        let dispatched = self.dispatch_loop(&model, op).instrument(span).await?;
        Ok(dispatched.map(|d| match d {
            Dispatched::Response(r) => CompletionOutcome::Response(r),
            Dispatched::Stream(s) => CompletionOutcome::Stream(s),
            Dispatched::Embedding(_) => unreachable!("completion op never yields an embedding"),
        }))
    }

    /// Dispatches an embedding request under the same rotation policy.
    pub async fn aembedding(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<Option<EmbeddingResponse>> {
        self.ensure_open()?;
        let model = ModelId::parse(&request.model)?;
        METRICS.requests_total.increment(1);

        let span = info_span!(
            "aembedding",
            request_id = %Uuid::new_v4(),
            model = %model,
        );
        let dispatched = self
            .dispatch_loop(&model, DispatchOp::Embed(request))
            .instrument(span)
            .await?;
        Ok(dispatched.map(|d| match d {
            Dispatched::Embedding(r) => r,
            _ => unreachable!("embed op only yields embeddings"),
        }))
    }

    /// Models reachable through the configured pool, as
    /// `provider/model_name`. Fetched once through the registry, then
    /// cached.
    pub async fn available_models(&self) -> Vec<String> {
        if let Some(cached) = self.model_cache.read().await.as_ref() {
            return cached.clone();
        }

        let mut models = Vec::new();
        let providers: Vec<String> = self.manager.providers().map(String::from).collect();
        for provider in providers {
            let Some(key) = self.manager.any_key_for(&provider) else {
                continue;
            };
            match self.registry.get_models(&provider, key.secret()).await {
                Ok(discovered) => {
                    models.extend(discovered.into_iter().map(|m| format!("{provider}/{m}")));
                }
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Model discovery failed");
                }
            }
        }
        models.sort();

        let mut cache = self.model_cache.write().await;
        *cache = Some(models.clone());
        models
    }

    /// Live usage counters, in the same shape as the persisted document.
    pub fn usage_snapshot(&self) -> crate::storage::UsageSnapshot {
        self.manager.snapshot()
    }

    /// Stops background tasks and flushes the usage snapshot. Idempotent;
    /// requests issued after close fail with [`RotatorError::Closed`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.reset_task.lock().await.take() {
            task.abort();
        }
        if let Some(writer) = self.writer.lock().await.take() {
            writer.shutdown().await;
        }
        info!("Rotating client closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RotatorError::Closed);
        }
        Ok(())
    }

    /// The shared rotation loop: select a key, attempt with bounded
    /// retries, rotate on credential failures, all under one deadline.
    async fn dispatch_loop(
        &self,
        model: &ModelId,
        op: DispatchOp<'_>,
    ) -> Result<Option<Dispatched>> {
        let deadline = self.clock.now() + ChronoDuration::from_std(self.config.global_timeout())
            .unwrap_or_else(|_| ChronoDuration::seconds(30));
        let mut tried: HashSet<String> = HashSet::new();

        loop {
            if self.clock.now() >= deadline {
                info!(model = %model, "Deadline reached before another key could be tried");
                return Ok(None);
            }

            let lease = match self
                .manager
                .select_key(&model.provider, &model.name, deadline, &tried)
                .await
            {
                Ok(lease) => lease,
                Err(SelectError::Exhausted) => {
                    info!(model = %model, tried = tried.len(), "Key pool exhausted for request");
                    return Ok(None);
                }
                Err(SelectError::DeadlineExceeded) => {
                    info!(model = %model, "Deadline reached while selecting a key");
                    return Ok(None);
                }
            };
            tried.insert(lease.fingerprint().to_string());
            debug!(key.preview = %lease.preview(), "Attempting request with key");

            match self.attempt_with_key(model, &op, lease, deadline).await? {
                AttemptResult::Done(dispatched) => return Ok(Some(dispatched)),
                AttemptResult::Rotate => {
                    METRICS.key_rotations_total.increment(1);
                    continue;
                }
            }
        }
    }

    /// Runs the per-key retry loop. Consumes the lease: it is either handed
    /// to a committed stream, or released here before returning.
    async fn attempt_with_key(
        &self,
        model: &ModelId,
        op: &DispatchOp<'_>,
        mut lease: KeyLease,
        deadline: DateTime<Utc>,
    ) -> Result<AttemptResult> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = self.call_provider(model, op, lease, deadline).await;
            lease = match outcome {
                CallOutcome::Response(response, mut lease) => {
                    let usage = self.completion_usage(model, op, &response);
                    self.manager.record_success(lease.managed(), &model.name, usage);
                    lease.release();
                    return Ok(AttemptResult::Done(Dispatched::Response(response)));
                }
                CallOutcome::Embedding(response, mut lease) => {
                    let usage = self.embedding_usage(model, op, &response);
                    self.manager.record_success(lease.managed(), &model.name, usage);
                    lease.release();
                    return Ok(AttemptResult::Done(Dispatched::Embedding(response)));
                }
                CallOutcome::Stream(stream) => {
                    return Ok(AttemptResult::Done(Dispatched::Stream(stream)));
                }
                CallOutcome::Failed(mut lease, provider_error) => {
                    let kind = classifier::classify(&provider_error);
                    debug!(
                        key.preview = %lease.preview(),
                        kind = %kind,
                        error = %provider_error,
                        "Provider call failed"
                    );
                    match kind {
                        ErrorKind::TransientServer | ErrorKind::Unknown => {
                            // Unknown gets a single probe retry; transients
                            // get the configured budget.
                            let retry_cap = match kind {
                                ErrorKind::Unknown => self.config.max_retries.min(1),
                                _ => self.config.max_retries,
                            };
                            if attempt >= retry_cap {
                                lease.release();
                                return Ok(AttemptResult::Rotate);
                            }
                            let wait = self.backoff(attempt);
                            if self.clock.now()
                                + ChronoDuration::from_std(wait)
                                    .unwrap_or_else(|_| ChronoDuration::zero())
                                > deadline
                            {
                                debug!("Back-off would cross the deadline; rotating instead");
                                lease.release();
                                return Ok(AttemptResult::Rotate);
                            }
                            self.clock.sleep(wait).await;
                            attempt += 1;
                            lease
                        }
                        ErrorKind::RateLimit
                        | ErrorKind::Authentication
                        | ErrorKind::QuotaExhausted => {
                            self.manager
                                .record_failure(lease.managed(), &model.name, kind);
                            lease.release();
                            return Ok(AttemptResult::Rotate);
                        }
                        ErrorKind::BadRequest => {
                            lease.release();
                            return Err(RotatorError::BadRequest {
                                message: provider_error.message().to_string(),
                            });
                        }
                        ErrorKind::ContextLength => {
                            lease.release();
                            return Err(RotatorError::ContextLength {
                                message: provider_error.message().to_string(),
                            });
                        }
                    }
                }
            };
        }
    }

    /// One provider invocation, bounded by the request deadline.
    async fn call_provider(
        &self,
        model: &ModelId,
        op: &DispatchOp<'_>,
        lease: KeyLease,
        deadline: DateTime<Utc>,
    ) -> CallOutcome {
        match op {
            DispatchOp::Complete(request) => {
                let call = self.llm.complete(&model.name, lease.secret(), request);
                match self.bounded(deadline, call).await {
                    Ok(response) => CallOutcome::Response(response, lease),
                    Err(e) => CallOutcome::Failed(lease, e),
                }
            }
            DispatchOp::Embed(request) => {
                let call = self.llm.embed(&model.name, lease.secret(), request);
                match self.bounded(deadline, call).await {
                    Ok(response) => CallOutcome::Embedding(response, lease),
                    Err(e) => CallOutcome::Failed(lease, e),
                }
            }
            DispatchOp::Stream(request) => {
                let call = self.llm.stream_complete(&model.name, lease.secret(), request);
                match self.bounded(deadline, call).await {
                    Ok(upstream) => self.probe_stream(model, request, upstream, lease, deadline).await,
                    Err(e) => CallOutcome::Failed(lease, e),
                }
            }
        }
    }

    /// Reads the head of a fresh provider stream before committing it to
    /// the consumer. A credential error in the very first event is
    /// swallowed here so dispatch can restart on another key; nothing has
    /// been delivered yet. Anything else commits the stream.
    async fn probe_stream(
        &self,
        model: &ModelId,
        request: &CompletionRequest,
        mut upstream: ByteStream,
        lease: KeyLease,
        deadline: DateTime<Utc>,
    ) -> CallOutcome {
        let mut buffer = SseBuffer::new(self.config.max_event_bytes);
        let probed: Vec<SseEvent> = loop {
            let chunk = match self.bounded_chunk(deadline, &mut upstream).await {
                Ok(chunk) => chunk,
                Err(e) => return CallOutcome::Failed(lease, e),
            };
            let Some(chunk) = chunk else {
                return CallOutcome::Failed(
                    lease,
                    ProviderError::Connection("stream ended before any event".to_string()),
                );
            };
            match chunk {
                Err(e) => return CallOutcome::Failed(lease, e),
                Ok(bytes) => match buffer.push(&bytes) {
                    Err(e) => {
                        return CallOutcome::Failed(lease, ProviderError::Payload(e.to_string()))
                    }
                    Ok(events) if events.is_empty() => continue,
                    Ok(events) => break events,
                },
            }
        };

        if let Some(SseEvent::Json { value, .. }) = probed.first() {
            if value.get("error").is_some() {
                let provider_error = classifier::error_from_stream_payload(value);
                let kind = classifier::classify(&provider_error);
                if kind.is_credential() {
                    info!(
                        key.preview = %lease.preview(),
                        kind = %kind,
                        "Stream opened with a credential error before any output; rotating"
                    );
                    METRICS.streams_recovered_total.increment(1);
                    return CallOutcome::Failed(lease, provider_error);
                }
                // Not the key's fault: commit the stream and let it emit
                // the terminal error event.
            }
        }

        let prompt_tokens = self.token_counter.count(&request.model, &request.prompt_text());
        let stream = RotatorStream::new(
            upstream,
            buffer,
            probed,
            lease,
            Arc::clone(&self.manager),
            Arc::clone(&self.token_counter),
            model.name.clone(),
            prompt_tokens,
        );
        CallOutcome::Stream(stream)
    }

    /// Bounds a provider future by the remaining deadline budget.
    async fn bounded<T>(
        &self,
        deadline: DateTime<Utc>,
        call: impl std::future::Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        let remaining = match (deadline - self.clock.now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => return Err(ProviderError::Timeout("request deadline reached".to_string())),
        };
        tokio::select! {
            biased;
            result = call => result,
            _ = self.clock.sleep(remaining) => {
                Err(ProviderError::Timeout("request deadline reached".to_string()))
            }
        }
    }

    async fn bounded_chunk(
        &self,
        deadline: DateTime<Utc>,
        upstream: &mut ByteStream,
    ) -> Result<Option<Result<bytes::Bytes, ProviderError>>, ProviderError> {
        let remaining = match (deadline - self.clock.now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => return Err(ProviderError::Timeout("request deadline reached".to_string())),
        };
        tokio::select! {
            biased;
            chunk = upstream.next() => Ok(chunk),
            _ = self.clock.sleep(remaining) => {
                Err(ProviderError::Timeout("deadline reached awaiting first stream event".to_string()))
            }
        }
    }

    /// Exponential back-off with a little jitter so synchronized failures
    /// do not retry in lockstep.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base().as_millis() as u64;
        let wait = base.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::thread_rng().gen_range(0..=wait / 8);
        Duration::from_millis(wait + jitter)
    }

    fn completion_usage(
        &self,
        model: &ModelId,
        op: &DispatchOp<'_>,
        response: &CompletionResponse,
    ) -> TokenUsage {
        if let Some(usage) = response.usage {
            return usage;
        }
        let prompt = match op {
            DispatchOp::Complete(request) | DispatchOp::Stream(request) => request.prompt_text(),
            DispatchOp::Embed(_) => String::new(),
        };
        let qualified = model.to_string();
        TokenUsage {
            prompt_tokens: self.token_counter.count(&qualified, &prompt),
            completion_tokens: self.token_counter.count(&qualified, &response.content),
        }
    }

    fn embedding_usage(
        &self,
        model: &ModelId,
        op: &DispatchOp<'_>,
        response: &EmbeddingResponse,
    ) -> TokenUsage {
        if let Some(usage) = response.usage {
            return usage;
        }
        let text = match op {
            DispatchOp::Embed(request) => match &request.input {
                EmbeddingInput::Single(s) => s.clone(),
                EmbeddingInput::Batch(batch) => batch.join("\n"),
            },
            _ => String::new(),
        };
        TokenUsage {
            prompt_tokens: self.token_counter.count(&model.to_string(), &text),
            completion_tokens: 0,
        }
    }
}

enum AttemptResult {
    Done(Dispatched),
    Rotate,
}

/// Assembles a [`RotatingClient`]. Pool, transport and config are
/// required; every other capability has a production default.
pub struct RotatingClientBuilder {
    pool: HashMap<String, Vec<String>>,
    config: RotatorConfig,
    llm: Option<Arc<dyn LLMClient>>,
    token_counter: Arc<dyn TokenCounter>,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn PersistentStore>>,
    registry: Arc<dyn ProviderRegistry>,
}

impl RotatingClientBuilder {
    fn new() -> Self {
        Self {
            pool: HashMap::new(),
            config: RotatorConfig::default(),
            llm: None,
            token_counter: Arc::new(HeuristicTokenCounter),
            clock: None,
            store: None,
            registry: Arc::new(EmptyRegistry),
        }
    }

    /// Replaces the whole pool: `provider -> ordered keys`.
    pub fn pool(mut self, pool: HashMap<String, Vec<String>>) -> Self {
        self.pool = pool;
        self
    }

    /// Adds one provider's keys.
    pub fn provider(
        mut self,
        name: impl Into<String>,
        keys: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.pool
            .entry(name.into())
            .or_default()
            .extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn config(mut self, config: RotatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn llm_client(mut self, llm: Arc<dyn LLMClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = counter;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ProviderRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Validates configuration, restores persisted usage, and spawns the
    /// snapshot writer and midnight-reset ticker.
    pub async fn build(self) -> Result<RotatingClient> {
        self.config.validate()?;
        let llm = self.llm.ok_or_else(|| {
            RotatorError::config_validation("an LLM client must be provided", Some("llm_client"))
        })?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => match self.config.reset_zone() {
                Some(zone) => Arc::new(SystemClock::with_reset_zone(zone)),
                None => Arc::new(SystemClock::new()),
            },
        };

        let manager = Arc::new(KeyManager::new(&self.pool, self.config.clone(), Arc::clone(&clock))?);

        let store: Arc<dyn PersistentStore> = match self.store {
            Some(store) => store,
            None => match &self.config.usage_file {
                Some(path) => Arc::new(JsonFileStore::new(path.clone())),
                None => Arc::new(NullStore),
            },
        };

        match store.load().await {
            Ok(Some(snapshot)) => manager.restore(&snapshot),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not load usage snapshot; starting fresh"),
        }

        let writer = SnapshotWriter::spawn(
            Arc::clone(&manager),
            Arc::clone(&store),
            self.config.persist_debounce(),
        );

        let reset_task = tokio::spawn(midnight_ticker(
            Arc::clone(&manager),
            Arc::clone(&clock),
        ));

        Ok(RotatingClient {
            manager,
            llm,
            token_counter: self.token_counter,
            clock,
            registry: self.registry,
            config: self.config,
            writer: AsyncMutex::new(Some(writer)),
            reset_task: AsyncMutex::new(Some(reset_task)),
            model_cache: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

/// Fires the daily reset shortly after each local midnight, complementing
/// the reactive check at the top of every selection. Waits on the runtime
/// timer; the injected clock only supplies the boundary.
async fn midnight_ticker(manager: Arc<KeyManager>, clock: Arc<dyn Clock>) {
    loop {
        let now = clock.now();
        let wake = clock.next_local_midnight();
        let wait = (wake - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .saturating_add(Duration::from_secs(1));
        tokio::time::sleep(wait).await;
        manager.daily_reset_if_needed();
    }
}
