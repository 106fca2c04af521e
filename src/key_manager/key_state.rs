// src/key_manager/key_state.rs

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as ModelMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

/// Counters for one accounting window of one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl UsageWindow {
    pub fn absorb(&mut self, other: &UsageWindow) {
        self.calls += other.calls;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// Escalating per-(key, model) cooldown.
#[derive(Debug, Clone, Copy)]
pub struct ModelCooldown {
    pub until: DateTime<Utc>,
    pub strikes: u32,
}

/// Mutable state of one key, guarded by the key's monitor.
#[derive(Debug, Default)]
pub(crate) struct KeyUsageState {
    pub cooldowns: HashMap<String, ModelCooldown>,
    pub lockout_until: Option<DateTime<Utc>>,
    pub distinct_model_failures: HashSet<String>,
    pub usage_today: UsageWindow,
    pub usage_total: UsageWindow,
    pub last_used: Option<DateTime<Utc>>,
}

/// Why a key cannot serve a model right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Eligibility {
    Ready,
    /// Ineligible until the contained instant (key lockout or model
    /// cooldown, whichever applies).
    Blocked(DateTime<Utc>),
}

/// One credential in the pool, with its locks and accounting state.
///
/// Locking discipline: `state` is a plain mutex (the per-key monitor) held
/// only for short, non-awaiting sections; tasks wait only on the shared-use
/// `gate` and the per-model mutexes.
pub struct ManagedKey {
    secret: SecretString,
    pub fingerprint: String,
    pub preview: String,
    pub provider: String,
    pub index: usize,
    gate: Arc<Semaphore>,
    model_locks: Mutex<HashMap<String, Arc<ModelMutex<()>>>>,
    pub(crate) state: Mutex<KeyUsageState>,
    in_flight: AtomicUsize,
}

impl std::fmt::Debug for ManagedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedKey")
            .field("fingerprint", &self.fingerprint)
            .field("provider", &self.provider)
            .field("index", &self.index)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ManagedKey {
    pub(crate) fn new(
        key: String,
        provider: String,
        index: usize,
        max_concurrent_models: usize,
    ) -> Self {
        let fingerprint = fingerprint(&key);
        let preview = preview(&key);
        Self {
            secret: SecretString::new(key),
            fingerprint,
            preview,
            provider,
            index,
            gate: Arc::new(Semaphore::new(max_concurrent_models)),
            model_locks: Mutex::new(HashMap::new()),
            state: Mutex::new(KeyUsageState::default()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn eligibility(&self, model: &str, now: DateTime<Utc>) -> Eligibility {
        let state = self.state.lock().expect("key monitor poisoned");
        if let Some(until) = state.lockout_until {
            if now < until {
                return Eligibility::Blocked(until);
            }
        }
        match state.cooldowns.get(model) {
            Some(cooldown) if now < cooldown.until => Eligibility::Blocked(cooldown.until),
            _ => Eligibility::Ready,
        }
    }

    pub(crate) fn last_used(&self) -> Option<DateTime<Utc>> {
        self.state.lock().expect("key monitor poisoned").last_used
    }

    fn model_lock(&self, model: &str) -> Arc<ModelMutex<()>> {
        let mut locks = self.model_locks.lock().expect("model lock table poisoned");
        Arc::clone(
            locks
                .entry(model.to_string())
                .or_insert_with(|| Arc::new(ModelMutex::new(()))),
        )
    }

    pub(crate) fn try_acquire_gate(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.gate).try_acquire_owned().ok()
    }

    pub(crate) fn try_lock_model(&self, model: &str) -> Option<OwnedMutexGuard<()>> {
        self.model_lock(model).try_lock_owned().ok()
    }

    /// Blocking acquisition. Waiters on the model mutex are served in FIFO
    /// arrival order; the gate permit is taken after the mutex so a waiting
    /// task does not hold back other models.
    pub(crate) async fn acquire_parts(
        &self,
        model: &str,
    ) -> (OwnedMutexGuard<()>, OwnedSemaphorePermit) {
        let guard = self.model_lock(model).lock_owned().await;
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .expect("shared-use gate is never closed");
        (guard, permit)
    }

    pub(crate) fn note_acquired(&self, now: DateTime<Utc>) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.state.lock().expect("key monitor poisoned").last_used = Some(now);
    }

    pub(crate) fn note_released(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Drops per-model lock entries for models with no active cooldown and
    /// no waiters. Called from the daily reset to keep the table bounded.
    pub(crate) fn prune_model_locks(&self) {
        let mut locks = self.model_locks.lock().expect("model lock table poisoned");
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
    }
}

/// Stable one-way fingerprint for persistence and logs. Raw key material
/// never leaves the process.
pub fn fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Short preview for logging: first and last four chars.
pub fn preview(key: &str) -> String {
    if key.chars().count() > 8 {
        let head: String = key.chars().take(4).collect();
        let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        format!("{head}...{tail}")
    } else {
        "****".to_string()
    }
}
