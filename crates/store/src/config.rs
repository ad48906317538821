//! Configuration table (`config.json`) and its typed view.
//!
//! The table is a flat JSON object. Known keys are validated on write;
//! unknown keys are stored verbatim.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use jobq_core::{DEFAULT_MAX_RETRIES, JobError};

use crate::atomic::{read_table, write_table};
use crate::error::{StoreError, StoreResult};
use crate::file_lock::{FileLock, LockOptions};

pub const CONFIG_FILE: &str = "config.json";

const LOG_LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

/// Typed configuration with defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub backoff_base: f64,
    /// Default command bound in seconds
    pub worker_timeout: u64,
    /// Lease TTL in seconds
    pub job_lock_timeout: u64,
    pub cleanup_completed_after_hours: u64,
    pub log_level: String,
    pub max_workers: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: 2.0,
            worker_timeout: 300,
            job_lock_timeout: 300,
            cleanup_completed_after_hours: 24,
            log_level: "INFO".to_string(),
            max_workers: 10,
        }
    }
}

impl QueueConfig {
    /// Build from a raw table, falling back to defaults for missing or
    /// invalid known keys.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let defaults = Self::default();
        let mut merged = match serde_json::to_value(&defaults) {
            Ok(Value::Object(m)) => m,
            _ => Map::new(),
        };
        for (key, value) in map {
            if !merged.contains_key(key) {
                continue;
            }
            match validate_value(key, value) {
                Ok(()) => {
                    merged.insert(key.clone(), value.clone());
                }
                Err(e) => warn!(key = %key, error = %e, "ignoring invalid config value"),
            }
        }
        serde_json::from_value(Value::Object(merged)).unwrap_or(defaults)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.job_lock_timeout)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.cleanup_completed_after_hours.saturating_mul(3600))
    }

    /// Default table contents written on first open.
    pub fn default_map() -> Map<String, Value> {
        match serde_json::to_value(Self::default()) {
            Ok(Value::Object(m)) => m,
            _ => Map::new(),
        }
    }
}

/// Human-readable rule for each known key.
pub fn validation_rules() -> Vec<(&'static str, &'static str)> {
    vec![
        ("max_retries", "Integer between 0 and 100"),
        ("backoff_base", "Number between 1.0 and 10.0"),
        ("worker_timeout", "Integer between 1 and 3600 seconds"),
        ("job_lock_timeout", "Integer between 1 and 3600 seconds"),
        ("cleanup_completed_after_hours", "Non-negative integer"),
        ("log_level", "One of: DEBUG, INFO, WARNING, ERROR, CRITICAL"),
        ("max_workers", "Integer between 1 and 100"),
    ]
}

fn int_in(value: &Value, lo: u64, hi: u64) -> bool {
    value.as_u64().is_some_and(|v| (lo..=hi).contains(&v))
}

/// Check one key/value against the rules. Unknown keys always pass.
pub fn validate_value(key: &str, value: &Value) -> Result<(), JobError> {
    let ok = match key {
        "max_retries" => int_in(value, 0, 100),
        "backoff_base" => value.as_f64().is_some_and(|v| (1.0..=10.0).contains(&v)),
        "worker_timeout" | "job_lock_timeout" => int_in(value, 1, 3600),
        "cleanup_completed_after_hours" => value.as_u64().is_some(),
        "log_level" => value.as_str().is_some_and(|v| LOG_LEVELS.contains(&v)),
        "max_workers" => int_in(value, 1, 100),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        let rule = validation_rules()
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, rule)| rule)
            .unwrap_or("valid value");
        Err(JobError::validation(format!(
            "invalid value {value} for {key}: expected {rule}"
        )))
    }
}

/// Parse a command-line value: JSON when it parses, else a plain string.
pub fn parse_cli_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| json!(raw))
}

/// Flat key/value configuration table with its own file lock.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    lock: LockOptions,
    local: Mutex<()>,
}

impl ConfigStore {
    /// Open the table in `dir`, seeding defaults if it does not exist.
    pub fn open(dir: impl AsRef<Path>, lock: LockOptions) -> StoreResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        let store = Self {
            path: dir.join(CONFIG_FILE),
            lock,
            local: Mutex::new(()),
        };
        if !store.path.exists() {
            store.exclusive(|| {
                if !store.path.exists() {
                    write_table(&store.path, &QueueConfig::default_map())?;
                }
                Ok(())
            })?;
        }
        Ok(store)
    }

    fn exclusive<R>(&self, f: impl FnOnce() -> StoreResult<R>) -> StoreResult<R> {
        let _local = self.local.lock().map_err(|_| StoreError::Poisoned)?;
        let _guard = FileLock::acquire(&self.path, &self.lock)?;
        f()
    }

    pub fn get_all(&self) -> Map<String, Value> {
        read_table(&self.path)
    }

    /// Value for `key`, or `default` when unset.
    pub fn get(&self, key: &str, default: Value) -> Value {
        self.get_all().remove(key).unwrap_or(default)
    }

    /// Validate every entry, then merge them all in one atomic write.
    pub fn update(&self, entries: Map<String, Value>) -> StoreResult<()> {
        for (key, value) in &entries {
            validate_value(key, value)?;
        }
        self.exclusive(|| {
            let mut current: Map<String, Value> = read_table(&self.path);
            for (key, value) in entries {
                debug!(key = %key, value = %value, "config updated");
                current.insert(key, value);
            }
            write_table(&self.path, &current)
        })
    }

    pub fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        let mut entries = Map::new();
        entries.insert(key.to_string(), value);
        self.update(entries)
    }

    /// Replace the table with the defaults.
    pub fn reset(&self) -> StoreResult<()> {
        self.exclusive(|| write_table(&self.path, &QueueConfig::default_map()))
    }

    /// Typed view of the current table.
    pub fn load(&self) -> QueueConfig {
        QueueConfig::from_map(&self.get_all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), LockOptions::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn seeded_with_defaults() {
        let (_dir, store) = open();
        assert_eq!(store.load(), QueueConfig::default());
        assert_eq!(store.get("max_retries", json!(0)), json!(3));
        assert_eq!(store.get("missing", json!("dflt")), json!("dflt"));
    }

    #[test]
    fn set_validates_known_keys() {
        let (_dir, store) = open();
        store.set("max_retries", json!(5)).unwrap();
        assert_eq!(store.load().max_retries, 5);

        assert!(matches!(
            store.set("max_retries", json!(-1)),
            Err(StoreError::Job(JobError::Validation(_)))
        ));
        assert!(store.set("backoff_base", json!(0.5)).is_err());
        assert!(store.set("log_level", json!("VERBOSE")).is_err());
        assert!(store.set("worker_timeout", json!(0)).is_err());
        assert_eq!(store.load().max_retries, 5);
    }

    #[test]
    fn unknown_keys_are_kept() {
        let (_dir, store) = open();
        store.set("team", json!("ops")).unwrap();
        assert_eq!(store.get("team", Value::Null), json!("ops"));
    }

    #[test]
    fn update_is_all_or_nothing() {
        let (_dir, store) = open();
        let mut entries = Map::new();
        entries.insert("max_workers".into(), json!(4));
        entries.insert("backoff_base".into(), json!(99));
        assert!(store.update(entries).is_err());
        assert_eq!(store.load().max_workers, 10);
    }

    #[test]
    fn reset_restores_defaults() {
        let (_dir, store) = open();
        store.set("backoff_base", json!(3.5)).unwrap();
        store.reset().unwrap();
        assert_eq!(store.load().backoff_base, 2.0);
    }

    #[test]
    fn invalid_hand_edited_values_fall_back() {
        let mut map = QueueConfig::default_map();
        map.insert("backoff_base".into(), json!("fast"));
        assert_eq!(QueueConfig::from_map(&map).backoff_base, 2.0);
    }

    #[test]
    fn cli_values_parse_as_json_or_string() {
        assert_eq!(parse_cli_value("5"), json!(5));
        assert_eq!(parse_cli_value("2.5"), json!(2.5));
        assert_eq!(parse_cli_value("DEBUG"), json!("DEBUG"));
    }
}
