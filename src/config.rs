// src/config.rs

use crate::error::{Result, RotatorError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Engine configuration. Every knob has a production default; a YAML file
/// and environment variables can override them.
#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct RotatorConfig {
    /// End-to-end deadline for one logical request, including all retries
    /// and rotations.
    #[serde(default = "default_global_timeout_secs")]
    pub global_timeout_secs: u64,

    /// Retries on the same key for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base of the per-key retry back-off (doubled per attempt).
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Base of the (key, model) cooldown escalation.
    #[serde(default = "default_cooldown_base_secs")]
    pub cooldown_base_secs: u64,

    /// Exponent cap for cooldown escalation. With a 30s base, a cap of 6
    /// tops out near 32 minutes.
    #[serde(default = "default_cooldown_strike_cap")]
    pub cooldown_strike_cap: u32,

    /// Distinct models a key may fail on before the whole key is locked out.
    #[serde(default = "default_distinct_failure_threshold")]
    pub distinct_failure_threshold: usize,

    /// Length of a key-wide lockout.
    #[serde(default = "default_lockout_window_secs")]
    pub lockout_window_secs: u64,

    /// Distinct models one key may serve concurrently.
    #[serde(default = "default_max_concurrent_models_per_key")]
    pub max_concurrent_models_per_key: usize,

    /// Upper bound on buffered stream bytes while waiting for a complete
    /// event.
    #[serde(default = "default_max_event_bytes")]
    pub max_event_bytes: usize,

    /// Debounce window for coalescing usage snapshots.
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,

    /// Where to persist usage. `None` disables persistence.
    #[serde(default)]
    pub usage_file: Option<PathBuf>,

    /// IANA timezone for the daily reset boundary. Defaults to the host's
    /// local zone.
    #[serde(default)]
    pub reset_timezone: Option<String>,
}

const fn default_global_timeout_secs() -> u64 {
    30
}
const fn default_max_retries() -> u32 {
    2
}
const fn default_retry_base_ms() -> u64 {
    1_000
}
const fn default_cooldown_base_secs() -> u64 {
    30
}
const fn default_cooldown_strike_cap() -> u32 {
    6
}
const fn default_distinct_failure_threshold() -> usize {
    3
}
const fn default_lockout_window_secs() -> u64 {
    900
}
const fn default_max_concurrent_models_per_key() -> usize {
    8
}
const fn default_max_event_bytes() -> usize {
    1024 * 1024
}
const fn default_persist_debounce_ms() -> u64 {
    1_000
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            global_timeout_secs: default_global_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            cooldown_base_secs: default_cooldown_base_secs(),
            cooldown_strike_cap: default_cooldown_strike_cap(),
            distinct_failure_threshold: default_distinct_failure_threshold(),
            lockout_window_secs: default_lockout_window_secs(),
            max_concurrent_models_per_key: default_max_concurrent_models_per_key(),
            max_event_bytes: default_max_event_bytes(),
            persist_debounce_ms: default_persist_debounce_ms(),
            usage_file: None,
            reset_timezone: None,
        }
    }
}

impl RotatorConfig {
    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.global_timeout_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn lockout_window(&self) -> Duration {
        Duration::from_secs(self.lockout_window_secs)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    /// Load configuration from a YAML file, falling back to defaults when
    /// the file is absent, then apply environment overrides and validate.
    pub fn load(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            info!(config.path = %config_path.display(), "Loading rotator configuration from file");
            let content =
                std::fs::read_to_string(config_path).map_err(|e| RotatorError::Io {
                    operation: "read_config".to_string(),
                    message: e.to_string(),
                })?;
            serde_yaml::from_str(&content).map_err(|e| RotatorError::ConfigParse {
                message: e.to_string(),
            })?
        } else {
            info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.override_with_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides. For hosts that configure the
    /// engine programmatically.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.override_with_env();
        config.validate()?;
        Ok(config)
    }

    fn override_with_env(&mut self) {
        override_u64("ROTATOR_GLOBAL_TIMEOUT_SECS", &mut self.global_timeout_secs);
        override_u64("ROTATOR_RETRY_BASE_MS", &mut self.retry_base_ms);
        override_u64("ROTATOR_COOLDOWN_BASE_SECS", &mut self.cooldown_base_secs);
        override_u64("ROTATOR_LOCKOUT_WINDOW_SECS", &mut self.lockout_window_secs);
        override_u64("ROTATOR_PERSIST_DEBOUNCE_MS", &mut self.persist_debounce_ms);

        if let Ok(raw) = std::env::var("ROTATOR_MAX_RETRIES") {
            match raw.parse() {
                Ok(v) => self.max_retries = v,
                Err(_) => warn!(value = %raw, "Invalid ROTATOR_MAX_RETRIES, keeping current"),
            }
        }
        if let Ok(path) = std::env::var("ROTATOR_USAGE_FILE") {
            self.usage_file = Some(PathBuf::from(path));
        }
        if let Ok(zone) = std::env::var("ROTATOR_RESET_TIMEZONE") {
            self.reset_timezone = Some(zone);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.global_timeout_secs == 0 {
            return Err(RotatorError::config_validation(
                "global timeout must be positive",
                Some("global_timeout_secs"),
            ));
        }
        if self.max_concurrent_models_per_key == 0 {
            return Err(RotatorError::config_validation(
                "a key must be able to serve at least one model",
                Some("max_concurrent_models_per_key"),
            ));
        }
        if self.distinct_failure_threshold == 0 {
            return Err(RotatorError::config_validation(
                "lockout threshold must be positive",
                Some("distinct_failure_threshold"),
            ));
        }
        if self.max_event_bytes < 1024 {
            return Err(RotatorError::config_validation(
                "event buffer must admit at least one kilobyte",
                Some("max_event_bytes"),
            ));
        }
        if let Some(zone) = &self.reset_timezone {
            if zone.parse::<chrono_tz::Tz>().is_err() {
                return Err(RotatorError::config_validation(
                    format!("unknown timezone '{zone}'"),
                    Some("reset_timezone"),
                ));
            }
        }
        Ok(())
    }

    /// The parsed reset timezone, when one is configured.
    pub fn reset_zone(&self) -> Option<chrono_tz::Tz> {
        self.reset_timezone.as_deref().and_then(|z| z.parse().ok())
    }
}

fn override_u64(var: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => {
                info!(var, value = v, "Overriding from environment");
                *slot = v;
            }
            Err(_) => warn!(var, value = %raw, "Invalid environment override, keeping current"),
        }
    }
}
