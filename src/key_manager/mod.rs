// src/key_manager/mod.rs

pub mod key_state;
pub mod lease;

pub use key_state::{fingerprint, preview, ManagedKey, ModelCooldown, UsageWindow};
pub use lease::KeyLease;

use crate::classifier::ErrorKind;
use crate::client::Clock;
use crate::config::RotatorConfig;
use crate::error::{Result, RotatorError};
use crate::metrics::METRICS;
use crate::pricing;
use crate::storage::{KeyUsageSnapshot, UsageSnapshot};
use crate::types::TokenUsage;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use key_state::Eligibility;
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Why `select_key` came back empty-handed. Callers see the same empty
/// outcome either way; the distinction feeds logs and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    /// Every configured key for the provider was excluded or absent.
    Exhausted,
    /// Candidates existed but none became eligible and acquirable before
    /// the deadline.
    DeadlineExceeded,
}

/// Owns the credential pool: eligibility arithmetic, tiered lock vending,
/// failure cooldowns, usage counters, daily reset, and snapshots.
pub struct KeyManager {
    keys: Vec<Arc<ManagedKey>>,
    by_provider: HashMap<String, Vec<usize>>,
    config: RotatorConfig,
    clock: Arc<dyn Clock>,
    /// Global monitor: the daily-reset calendar.
    calendar: Mutex<NaiveDate>,
    persist_nudge: OnceCell<UnboundedSender<()>>,
}

impl KeyManager {
    /// Builds the pool from `provider -> ordered keys`. Blank keys are
    /// skipped with a warning; an entirely empty pool is a configuration
    /// error.
    pub fn new(
        pool: &HashMap<String, Vec<String>>,
        config: RotatorConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut keys: Vec<Arc<ManagedKey>> = Vec::new();
        let mut by_provider: HashMap<String, Vec<usize>> = HashMap::new();

        for (provider, provider_keys) in pool {
            if provider_keys.is_empty() {
                warn!(provider = %provider, "Skipping provider with no API keys");
                continue;
            }
            for raw in provider_keys {
                if raw.trim().is_empty() {
                    warn!(provider = %provider, "Skipping empty API key string");
                    continue;
                }
                let index = keys.len();
                let key = Arc::new(ManagedKey::new(
                    raw.clone(),
                    provider.clone(),
                    index,
                    config.max_concurrent_models_per_key,
                ));
                by_provider
                    .entry(provider.clone())
                    .or_default()
                    .push(index);
                keys.push(key);
            }
        }

        if keys.is_empty() {
            return Err(RotatorError::config_validation(
                "key pool contains no usable API keys",
                Some("pool"),
            ));
        }

        info!(
            key_count = keys.len(),
            provider_count = by_provider.len(),
            "Key pool initialized"
        );

        let today = clock.local_date();
        Ok(Self {
            keys,
            by_provider,
            config,
            clock,
            calendar: Mutex::new(today),
            persist_nudge: OnceCell::new(),
        })
    }

    /// Wires the debounced snapshot writer. Set once, at client build time.
    pub(crate) fn set_persist_channel(&self, tx: UnboundedSender<()>) {
        let _ = self.persist_nudge.set(tx);
    }

    fn nudge_persistence(&self) {
        if let Some(tx) = self.persist_nudge.get() {
            let _ = tx.send(());
        }
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.by_provider.keys().map(String::as_str)
    }

    /// The first configured key of a provider, for discovery calls that
    /// need any valid credential.
    pub fn any_key_for(&self, provider: &str) -> Option<Arc<ManagedKey>> {
        self.by_provider
            .get(provider)
            .and_then(|indices| indices.first())
            .map(|&i| Arc::clone(&self.keys[i]))
    }

    /// Selects an eligible key for `(provider, model)` under the tiered
    /// discipline:
    ///
    /// 1. a candidate whose model mutex and gate are both immediately
    ///    acquirable, preferring fewest in-flight, then least recent use,
    ///    then configured order;
    /// 2. otherwise a bounded wait on the least-loaded candidate's locks;
    /// 3. when every candidate is merely cooling down, sleep until the
    ///    earliest cooldown expiry and re-scan.
    ///
    /// Gives up at `deadline`. Keys whose fingerprint is in `exclude` are
    /// never considered.
    pub async fn select_key(
        &self,
        provider: &str,
        model: &str,
        deadline: DateTime<Utc>,
        exclude: &HashSet<String>,
    ) -> Result<KeyLease, SelectError> {
        loop {
            self.daily_reset_if_needed();
            let now = self.clock.now();

            let Some(indices) = self.by_provider.get(provider) else {
                warn!(provider = %provider, "No keys configured for provider");
                METRICS.pool_exhausted_total.increment(1);
                return Err(SelectError::Exhausted);
            };

            let mut ready: Vec<Arc<ManagedKey>> = Vec::new();
            let mut earliest_wake: Option<DateTime<Utc>> = None;
            let mut candidates = 0usize;

            for &i in indices {
                let key = &self.keys[i];
                if exclude.contains(&key.fingerprint) {
                    continue;
                }
                candidates += 1;
                match key.eligibility(model, now) {
                    Eligibility::Ready => ready.push(Arc::clone(key)),
                    Eligibility::Blocked(until) => {
                        earliest_wake =
                            Some(earliest_wake.map_or(until, |cur| cur.min(until)));
                    }
                }
            }

            if candidates == 0 {
                debug!(provider = %provider, model = %model, "All keys for provider already tried");
                METRICS.pool_exhausted_total.increment(1);
                return Err(SelectError::Exhausted);
            }

            if ready.is_empty() {
                // Everything is cooling down or locked out. Hold the
                // request open: a cooldown may expire before the deadline.
                let wake = earliest_wake.unwrap_or(deadline);
                if wake >= deadline {
                    self.sleep_until(deadline, now).await;
                    warn!(
                        provider = %provider,
                        model = %model,
                        "Deadline reached while every key was cooling down"
                    );
                    METRICS.pool_cooling_total.increment(1);
                    return Err(SelectError::DeadlineExceeded);
                }
                debug!(
                    provider = %provider,
                    model = %model,
                    wake = %wake,
                    "All candidates cooling down; waiting for earliest expiry"
                );
                self.sleep_until(wake, now).await;
                continue;
            }

            ready.sort_by_cached_key(|key| {
                (
                    key.in_flight(),
                    key.last_used()
                        .map_or(i64::MIN, |t| t.timestamp_millis()),
                    key.index,
                )
            });

            // Tier 1: immediate acquisition.
            for key in &ready {
                let Some(guard) = key.try_lock_model(model) else {
                    continue;
                };
                let Some(permit) = key.try_acquire_gate() else {
                    continue;
                };
                key.note_acquired(now);
                debug!(
                    key.preview = %key.preview,
                    model = %model,
                    in_flight = key.in_flight(),
                    "Selected key"
                );
                return Ok(KeyLease::new(Arc::clone(key), model.to_string(), permit, guard));
            }

            // Tier 2: bounded wait on the least-loaded candidate.
            let target = Arc::clone(&ready[0]);
            let remaining = deadline - now;
            if remaining <= ChronoDuration::zero() {
                METRICS.pool_cooling_total.increment(1);
                return Err(SelectError::DeadlineExceeded);
            }
            let wait = remaining
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            debug!(
                key.preview = %target.preview,
                model = %model,
                "Waiting for busy key"
            );
            let acquired = tokio::select! {
                biased;
                parts = target.acquire_parts(model) => Some(parts),
                _ = self.clock.sleep(wait) => None,
            };
            match acquired {
                Some((guard, permit)) => {
                    target.note_acquired(self.clock.now());
                    return Ok(KeyLease::new(target, model.to_string(), permit, guard));
                }
                None => {
                    warn!(
                        provider = %provider,
                        model = %model,
                        "Deadline reached while waiting for a busy key"
                    );
                    METRICS.pool_cooling_total.increment(1);
                    return Err(SelectError::DeadlineExceeded);
                }
            }
        }
    }

    async fn sleep_until(&self, instant: DateTime<Utc>, now: DateTime<Utc>) {
        let wait = (instant - now).to_std().unwrap_or(std::time::Duration::ZERO);
        self.clock.sleep(wait).await;
    }

    /// Folds a completed request into the key's counters. Called exactly
    /// once per completed request, after the non-streaming return or the
    /// streaming terminal event.
    pub fn record_success(&self, key: &ManagedKey, model: &str, usage: TokenUsage) {
        let cost = pricing::approximate_cost(&format!("{}/{model}", key.provider), &usage);
        {
            let mut state = key.state.lock().expect("key monitor poisoned");
            state.usage_today.calls += 1;
            state.usage_today.prompt_tokens += usage.prompt_tokens;
            state.usage_today.completion_tokens += usage.completion_tokens;
            state.usage_today.cost_usd += cost;
        }
        debug!(
            key.preview = %key.preview,
            model = %model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "Recorded success"
        );
        self.nudge_persistence();
    }

    /// Applies the failure policy for `kind` to `(key, model)`.
    ///
    /// Rate limits escalate an exponential cooldown; authentication
    /// failures escalate harder and count toward a key-wide lockout; an
    /// exhausted quota sidelines the pair until local midnight. Transient
    /// and caller-fault kinds leave the key untouched.
    pub fn record_failure(&self, key: &ManagedKey, model: &str, kind: ErrorKind) {
        METRICS.key_failures_total.increment(1);
        let now = self.clock.now();
        let mut state = key.state.lock().expect("key monitor poisoned");

        match kind {
            ErrorKind::RateLimit => {
                let cooldown = Self::escalate(
                    state.cooldowns.get(model).map(|c| c.strikes),
                    1,
                    now,
                    &self.config,
                );
                info!(
                    key.preview = %key.preview,
                    model = %model,
                    strikes = cooldown.strikes,
                    until = %cooldown.until,
                    "Rate limited; cooling down"
                );
                state.cooldowns.insert(model.to_string(), cooldown);
                METRICS.cooldowns_set_total.increment(1);
            }
            ErrorKind::Authentication => {
                let cooldown = Self::escalate(
                    state.cooldowns.get(model).map(|c| c.strikes),
                    2,
                    now,
                    &self.config,
                );
                warn!(
                    key.preview = %key.preview,
                    model = %model,
                    strikes = cooldown.strikes,
                    until = %cooldown.until,
                    "Authentication failure; cooling down"
                );
                state.cooldowns.insert(model.to_string(), cooldown);
                state.distinct_model_failures.insert(model.to_string());
                METRICS.cooldowns_set_total.increment(1);

                if state.distinct_model_failures.len() >= self.config.distinct_failure_threshold {
                    let until = now
                        + ChronoDuration::seconds(self.config.lockout_window_secs as i64);
                    state.lockout_until = Some(until);
                    state.distinct_model_failures.clear();
                    warn!(
                        key.preview = %key.preview,
                        until = %until,
                        "Key failed on too many distinct models; locking out"
                    );
                    METRICS.key_lockouts_total.increment(1);
                }
            }
            ErrorKind::QuotaExhausted => {
                let until = self.clock.next_local_midnight();
                let strikes = state.cooldowns.get(model).map_or(0, |c| c.strikes);
                warn!(
                    key.preview = %key.preview,
                    model = %model,
                    until = %until,
                    "Quota exhausted; sidelined until local midnight"
                );
                state
                    .cooldowns
                    .insert(model.to_string(), ModelCooldown { until, strikes });
                METRICS.cooldowns_set_total.increment(1);
            }
            ErrorKind::TransientServer | ErrorKind::Unknown => {
                debug!(
                    key.preview = %key.preview,
                    model = %model,
                    kind = %kind,
                    "Transient failure; key state unchanged"
                );
            }
            ErrorKind::BadRequest | ErrorKind::ContextLength => {
                debug!(
                    key.preview = %key.preview,
                    model = %model,
                    kind = %kind,
                    "Caller-fault failure; key state unchanged"
                );
            }
        }
    }

    fn escalate(
        prior_strikes: Option<u32>,
        increment: u32,
        now: DateTime<Utc>,
        config: &RotatorConfig,
    ) -> ModelCooldown {
        let strikes = prior_strikes.unwrap_or(0) + increment;
        let exponent = strikes.min(config.cooldown_strike_cap);
        let secs = config.cooldown_base_secs.saturating_mul(1u64 << exponent);
        ModelCooldown {
            until: now + ChronoDuration::seconds(secs as i64),
            strikes,
        }
    }

    /// Rolls the day over when the local date has advanced: archives
    /// `usage_today` into `usage_total`, clears cooldowns, distinct-model
    /// failures and lockouts, and advances the calendar. Idempotent; runs
    /// at the top of every selection and from the midnight ticker.
    pub fn daily_reset_if_needed(&self) {
        let today = self.clock.local_date();
        let mut calendar = self.calendar.lock().expect("calendar monitor poisoned");
        if *calendar >= today {
            return;
        }
        info!(from = %*calendar, to = %today, "Daily reset");
        *calendar = today;

        for key in &self.keys {
            {
                let mut state = key.state.lock().expect("key monitor poisoned");
                let today_window = std::mem::take(&mut state.usage_today);
                state.usage_total.absorb(&today_window);
                state.cooldowns.clear();
                state.distinct_model_failures.clear();
                state.lockout_until = None;
            }
            key.prune_model_locks();
        }
        drop(calendar);
        self.nudge_persistence();
    }

    /// Builds a persistable snapshot of the live usage state. Keys appear
    /// under their fingerprint; raw key material is never included.
    pub fn snapshot(&self) -> UsageSnapshot {
        let last_reset_date = *self.calendar.lock().expect("calendar monitor poisoned");
        let mut snapshot = UsageSnapshot {
            last_reset_date,
            keys: Default::default(),
        };
        for key in &self.keys {
            let state = key.state.lock().expect("key monitor poisoned");
            snapshot.keys.insert(
                key.fingerprint.clone(),
                KeyUsageSnapshot {
                    provider: key.provider.clone(),
                    usage_today: state.usage_today,
                    usage_total: state.usage_total,
                },
            );
        }
        snapshot
    }

    /// Restores usage counters from a persisted snapshot, matching entries
    /// by fingerprint. Entries for keys no longer in the pool are dropped
    /// with a note; a stale snapshot date is handled by the next daily
    /// reset.
    pub fn restore(&self, snapshot: &UsageSnapshot) {
        {
            let mut calendar = self.calendar.lock().expect("calendar monitor poisoned");
            *calendar = snapshot.last_reset_date;
        }
        let mut matched = 0usize;
        for key in &self.keys {
            if let Some(entry) = snapshot.keys.get(&key.fingerprint) {
                let mut state = key.state.lock().expect("key monitor poisoned");
                state.usage_today = entry.usage_today;
                state.usage_total = entry.usage_total;
                matched += 1;
            }
        }
        let orphaned = snapshot.keys.len().saturating_sub(matched);
        if orphaned > 0 {
            info!(orphaned, "Snapshot entries without a matching live key were dropped");
        }
        info!(matched, last_reset_date = %snapshot.last_reset_date, "Usage restored");
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("keys", &self.keys.len())
            .field("providers", &self.by_provider.len())
            .finish_non_exhaustive()
    }
}
