// src/storage/json_file.rs

use super::{PersistentStore, UsageSnapshot};
use crate::error::{Result, RotatorError};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, warn};

/// JSON document on disk, replaced atomically: the snapshot is written to a
/// sibling temp file and renamed over the target, so readers never observe
/// a torn document even across a crash.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PersistentStore for JsonFileStore {
    async fn load(&self) -> Result<Option<UsageSnapshot>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No usage snapshot on disk yet");
                return Ok(None);
            }
            Err(e) => {
                return Err(RotatorError::Io {
                    operation: "read_snapshot".to_string(),
                    message: e.to_string(),
                })
            }
        };

        match serde_json::from_str(&content) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                // A corrupt file is not worth refusing to start over.
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Usage snapshot unreadable; starting fresh"
                );
                Ok(None)
            }
        }
    }

    async fn save(&self, snapshot: &UsageSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RotatorError::Io {
                        operation: "create_snapshot_dir".to_string(),
                        message: e.to_string(),
                    })?;
            }
        }

        let body = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, &body)
            .await
            .map_err(|e| RotatorError::Io {
                operation: "write_snapshot".to_string(),
                message: e.to_string(),
            })?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| RotatorError::Io {
                operation: "replace_snapshot".to_string(),
                message: e.to_string(),
            })?;
        debug!(path = %self.path.display(), bytes = body.len(), "Usage snapshot written");
        Ok(())
    }
}
