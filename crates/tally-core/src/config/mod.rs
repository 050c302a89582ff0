//! Engine configuration.
//!
//! `EngineConfig` is plain JSON with camelCase keys. Every key except
//! `collections` has a default, so `{"collections": ["products"]}` is a
//! complete config.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Collections managed by the bookkeeping screens when no config is given
pub const DEFAULT_COLLECTIONS: &[&str] = &[
    "products",
    "sales",
    "purchases",
    "customers",
    "suppliers",
    "credits",
];

const DEFAULT_DRAIN_INTERVAL_MS: u64 = 1_000;
const DEFAULT_DEBOUNCE_MS: u64 = 500;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 8;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;
const DEFAULT_RESUBSCRIBE_DELAY_MS: u64 = 5_000;

/// Collection names double as remote path segments
fn collection_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("Invalid regex"))
}

/// Which timestamp a remote delta advances the checkpoint to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckpointMode {
    /// The applied record's `updatedAt`, or the wall clock when absent
    #[default]
    RecordTimestamp,
    /// The local wall clock at application time
    WallClock,
}

/// Runtime options of a sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    pub collections: Vec<String>,
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_resubscribe_delay_ms")]
    pub resubscribe_delay_ms: u64,
    #[serde(default)]
    pub checkpoint_mode: CheckpointMode,
    #[serde(default)]
    pub prune_on_attach: bool,
}

const fn default_drain_interval_ms() -> u64 {
    DEFAULT_DRAIN_INTERVAL_MS
}

const fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

const fn default_drain_timeout_ms() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_MS
}

const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

const fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

const fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

const fn default_resubscribe_delay_ms() -> u64 {
    DEFAULT_RESUBSCRIBE_DELAY_MS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_COLLECTIONS.iter().map(ToString::to_string).collect())
    }
}

impl EngineConfig {
    /// Config with default timings for the given collections
    pub const fn new(collections: Vec<String>) -> Self {
        Self {
            collections,
            drain_interval_ms: DEFAULT_DRAIN_INTERVAL_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            resubscribe_delay_ms: DEFAULT_RESUBSCRIBE_DELAY_MS,
            checkpoint_mode: CheckpointMode::RecordTimestamp,
            prune_on_attach: false,
        }
    }

    /// Parse and validate a JSON config
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|error| Error::Config(format!("invalid engine config JSON: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        tracing::debug!(
            "Loaded engine config from {} ({} collections)",
            path.display(),
            config.collections.len()
        );
        Ok(config)
    }

    /// Check names and timings
    pub fn validate(&self) -> Result<()> {
        if self.collections.is_empty() {
            return Err(Error::Config("at least one collection is required".into()));
        }

        let pattern = collection_name_pattern();
        let mut seen = std::collections::HashSet::new();
        for name in &self.collections {
            if !pattern.is_match(name) {
                return Err(Error::Config(format!(
                    "collection name {name:?} must match {}",
                    pattern.as_str()
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::Config(format!("collection {name} is listed twice")));
            }
        }

        if self.drain_interval_ms == 0 {
            return Err(Error::Config("drainIntervalMs must be positive".into()));
        }
        if self.drain_timeout_ms == 0 {
            return Err(Error::Config("drainTimeoutMs must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("maxAttempts must be at least 1".into()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::Config(
                "backoffBaseMs must not exceed backoffMaxMs".into(),
            ));
        }

        Ok(())
    }

    /// Whether `collection` is managed by this config
    pub fn manages(&self, collection: &str) -> bool {
        self.collections.iter().any(|name| name == collection)
    }

    pub const fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub const fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    /// Delay before retrying an entry that has failed `attempts` times:
    /// `base * 2^(attempts - 1)`, capped at `backoffMaxMs`.
    pub fn backoff_after(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn minimal_json_uses_defaults() {
        let config = EngineConfig::from_json_str(r#"{"collections": ["products", "sales"]}"#)
            .unwrap();

        assert_eq!(config.collections, vec!["products", "sales"]);
        assert_eq!(config.drain_interval(), Duration::from_millis(1_000));
        assert_eq!(config.debounce(), Duration::from_millis(500));
        assert_eq!(config.drain_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.checkpoint_mode, CheckpointMode::RecordTimestamp);
        assert!(!config.prune_on_attach);
    }

    #[test]
    fn camel_case_keys_are_honored() {
        let config = EngineConfig::from_json_str(
            r#"{
                "collections": ["products"],
                "drainIntervalMs": 250,
                "debounceMs": 100,
                "checkpointMode": "wallClock",
                "pruneOnAttach": true
            }"#,
        )
        .unwrap();

        assert_eq!(config.drain_interval_ms, 250);
        assert_eq!(config.debounce_ms, 100);
        assert_eq!(config.checkpoint_mode, CheckpointMode::WallClock);
        assert!(config.prune_on_attach);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_names() {
        assert!(EngineConfig::from_json_str(r#"{"collections": ["a"], "drain": 1}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"collections": []}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"collections": ["sales/2024"]}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"collections": ["1sales"]}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"collections": ["a", "a"]}"#).is_err());
        assert!(
            EngineConfig::from_json_str(r#"{"collections": ["a"], "maxAttempts": 0}"#).is_err()
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = EngineConfig::default();
        assert_eq!(config.backoff_after(1), Duration::from_secs(1));
        assert_eq!(config.backoff_after(2), Duration::from_secs(2));
        assert_eq!(config.backoff_after(4), Duration::from_secs(8));
        assert_eq!(config.backoff_after(20), Duration::from_secs(300));
        assert_eq!(config.backoff_after(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert!(config.manages("products"));
        assert!(!config.manages("reports"));
    }

    #[test]
    fn load_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.json");
        std::fs::write(&path, r#"{"collections": ["inventory"]}"#).unwrap();

        let config = EngineConfig::load_from_path(&path).unwrap();
        assert_eq!(config.collections, vec!["inventory"]);
        assert!(EngineConfig::load_from_path(dir.path().join("missing.json")).is_err());
    }
}
