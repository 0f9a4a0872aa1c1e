use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

const ENV_WORKER_NAME: &str = "WORKER_NAME";
const ENV_WORKER_INTERVAL_SEC: &str = "WORKER_INTERVAL_SEC";
const ENV_WORKER_TIMEOUT_SEC: &str = "WORKER_TIMEOUT_SEC";
const ENV_WORKER_RUN_FROM_START: &str = "WORKER_RUN_FROM_START";
const ENV_WORKER_LOCK_TTL_SEC: &str = "WORKER_LOCK_TTL_SEC";
const ENV_WORKER_WATCH_INTERVAL_MS: &str = "WORKER_WATCH_INTERVAL_MS";

const DEFAULT_INTERVAL_SEC: u64 = 60;

/// Worker settings, deserialisable from JSON or read from the environment.
///
/// ```json
/// {
///   "name": "billing-sync",
///   "interval_sec": 30,
///   "timeout_sec": 20,
///   "run_from_start": true,
///   "lock_ttl_sec": 15
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub interval_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub run_from_start: bool,
    /// Guard the worker with a distributed lock of this TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_ttl_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_interval_ms: Option<u64>,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, interval_sec: u64) -> Self {
        Self {
            name: name.into(),
            interval_sec,
            timeout_sec: None,
            run_from_start: false,
            lock_ttl_sec: None,
            watch_interval_ms: None,
        }
    }

    /// Build config from environment variables through `var`.
    ///
    /// - `WORKER_NAME` (required)
    /// - `WORKER_INTERVAL_SEC` (default: 60)
    /// - `WORKER_TIMEOUT_SEC`, `WORKER_LOCK_TTL_SEC`, `WORKER_WATCH_INTERVAL_MS` (optional)
    /// - `WORKER_RUN_FROM_START`: `true`/`1`/`yes` (default: false)
    pub fn from_env<F>(var: F) -> Result<Self, WorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let name = var(ENV_WORKER_NAME)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| WorkerError::InvalidConfig(format!("{ENV_WORKER_NAME} is not set")))?;

        let config = Self {
            name,
            interval_sec: parse_u64(&var, ENV_WORKER_INTERVAL_SEC)?.unwrap_or(DEFAULT_INTERVAL_SEC),
            timeout_sec: parse_u64(&var, ENV_WORKER_TIMEOUT_SEC)?,
            run_from_start: var(ENV_WORKER_RUN_FROM_START).is_some_and(|v| parse_flag(&v)),
            lock_ttl_sec: parse_u64(&var, ENV_WORKER_LOCK_TTL_SEC)?,
            watch_interval_ms: parse_u64(&var, ENV_WORKER_WATCH_INTERVAL_MS)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Read from the process environment.
    pub fn from_process_env() -> Result<Self, WorkerError> {
        Self::from_env(|key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.name.is_empty() {
            return Err(WorkerError::InvalidConfig("name must not be empty".into()));
        }
        if self.interval_sec == 0 {
            return Err(WorkerError::InvalidConfig("interval_sec must be >= 1".into()));
        }
        if self.timeout_sec == Some(0) {
            return Err(WorkerError::InvalidConfig("timeout_sec must be >= 1".into()));
        }
        if self.lock_ttl_sec == Some(0) {
            return Err(WorkerError::InvalidConfig("lock_ttl_sec must be >= 1".into()));
        }
        if self.watch_interval_ms == Some(0) {
            return Err(WorkerError::InvalidConfig("watch_interval_ms must be >= 1".into()));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_sec.map(Duration::from_secs)
    }

    pub fn lock_ttl(&self) -> Option<Duration> {
        self.lock_ttl_sec.map(Duration::from_secs)
    }

    pub fn watch_interval(&self) -> Option<Duration> {
        self.watch_interval_ms.map(Duration::from_millis)
    }
}

fn parse_u64<F>(var: &F, key: &str) -> Result<Option<u64>, WorkerError>
where
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| WorkerError::InvalidConfig(format!("{key}={raw:?}: {e}"))),
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}
