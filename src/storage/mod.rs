// src/storage/mod.rs

pub mod json_file;
pub mod writer;

pub use json_file::JsonFileStore;
pub use writer::SnapshotWriter;

use crate::error::Result;
use crate::key_manager::UsageWindow;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persisted usage for one key, addressed by fingerprint. Raw key material
/// is never written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyUsageSnapshot {
    pub provider: String,
    pub usage_today: UsageWindow,
    pub usage_total: UsageWindow,
}

/// The on-disk usage document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub last_reset_date: NaiveDate,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyUsageSnapshot>,
}

/// Durable home for usage snapshots. The engine guarantees single-writer
/// serialization; implementations guarantee atomic replacement so a crash
/// never leaves a torn document.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Loads the last snapshot, or `None` when nothing was persisted yet.
    async fn load(&self) -> Result<Option<UsageSnapshot>>;

    async fn save(&self, snapshot: &UsageSnapshot) -> Result<()>;
}

/// Store that persists nothing. Used when no usage file is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl PersistentStore for NullStore {
    async fn load(&self) -> Result<Option<UsageSnapshot>> {
        Ok(None)
    }

    async fn save(&self, _snapshot: &UsageSnapshot) -> Result<()> {
        Ok(())
    }
}
