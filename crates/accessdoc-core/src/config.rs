// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use crate::lifecycle::PipelineStep;
use crate::persistence::{BackendKind, ConnectOptions};
use crate::quota::{QuotaEnforcerConfig, Tier};
use crate::retention::RetentionWorkerConfig;
use crate::timeout::{StepTimeoutOverride, TimeoutEnforcerConfig, TimeoutPolicies};

const DAY: u64 = 24 * 3600;

/// accessdoc-core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend serving reads and primary writes
    pub backend: BackendKind,
    /// PostgreSQL connection URL
    pub postgres_url: Option<String>,
    /// SQLite connection URL
    pub sqlite_url: Option<String>,
    /// Mirror writes to the other backend
    pub dual_write: bool,
    /// Quota cache TTL
    pub cache_ttl: Duration,
    /// Max pool connections per backend
    pub pool_size: u32,
    /// Pool acquire and statement timeout
    pub query_timeout: Duration,
    /// Connection retries at startup
    pub connect_retries: u32,
    /// Initial connection backoff
    pub connect_backoff: Duration,
    /// Tier for organizations without stored limits
    pub default_tier: Tier,
    /// Service name recorded on quota violations
    pub service_name: String,
    /// Timeout sweep interval
    pub sweep_interval: Duration,
    /// Per-step timeout budgets, overrides applied
    pub timeout_policies: TimeoutPolicies,
    /// Retention worker enabled
    pub retention_enabled: bool,
    /// Retention pass interval
    pub retention_interval: Duration,
    /// Terminal document retention in days
    pub document_retention_days: u64,
    /// Terminal job retention in days
    pub job_retention_days: u64,
    /// Job log retention in days
    pub log_retention_days: u64,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),

    /// Individually valid values contradict each other.
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

struct Reader<F> {
    lookup: F,
}

impl<F> Reader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &'static str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn positive(&self, key: &'static str, default: u64) -> Result<u64, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        match raw.parse::<u64>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(ConfigError::Invalid(
                key,
                format!("'{}' must be a positive integer", raw),
            )),
        }
    }

    fn flag(&self, key: &'static str) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
            None | Some("false") | Some("0") | Some("no") => Ok(false),
            Some("true") | Some("1") | Some("yes") => Ok(true),
            Some(other) => Err(ConfigError::Invalid(
                key,
                format!("'{}' must be true or false", other),
            )),
        }
    }
}

fn parse_step_overrides(
    raw: &str,
) -> Result<HashMap<PipelineStep, StepTimeoutOverride>, ConfigError> {
    const KEY: &str = "ACCESSDOC_STEP_TIMEOUTS";

    let by_name: HashMap<String, StepTimeoutOverride> =
        serde_json::from_str(raw).map_err(|e| ConfigError::Invalid(KEY, e.to_string()))?;

    by_name
        .into_iter()
        .map(|(name, patch)| {
            PipelineStep::from_str(&name)
                .map(|step| (step, patch))
                .map_err(|e| ConfigError::Invalid(KEY, e.to_string()))
        })
        .collect()
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `ACCESSDOC_POSTGRES_URL` or `ACCESSDOC_SQLITE_URL`, matching
    ///   `ACCESSDOC_DB_BACKEND` (both when `ACCESSDOC_DUAL_WRITE` is set)
    ///
    /// Optional (with defaults):
    /// - `ACCESSDOC_DB_BACKEND`: `postgres` or `sqlite` (default: postgres)
    /// - `ACCESSDOC_DUAL_WRITE`: mirror writes to the other backend (default: false)
    /// - `ACCESSDOC_CACHE_TTL_SECS`: quota cache TTL (default: 300)
    /// - `ACCESSDOC_DB_POOL_SIZE`: pool size (default: 10)
    /// - `ACCESSDOC_DB_QUERY_TIMEOUT_SECS`: acquire/statement timeout (default: 30)
    /// - `ACCESSDOC_DB_CONNECT_RETRIES`: connect retries (default: 5)
    /// - `ACCESSDOC_DB_CONNECT_BACKOFF_MS`: initial backoff (default: 500)
    /// - `ACCESSDOC_DEFAULT_TIER`: tier for new organizations (default: free)
    /// - `ACCESSDOC_SERVICE_NAME`: recorded on violations (default: accessdoc-core)
    /// - `ACCESSDOC_SWEEP_INTERVAL_SECS`: timeout sweep interval (default: 30)
    /// - `ACCESSDOC_STEP_TIMEOUTS`: JSON object of per-step overrides
    /// - `ACCESSDOC_RETENTION_ENABLED`: run the retention worker (default: false)
    /// - `ACCESSDOC_RETENTION_INTERVAL_SECS`: retention interval (default: 3600)
    /// - `ACCESSDOC_DOCUMENT_RETENTION_DAYS` (default: 365),
    ///   `ACCESSDOC_JOB_RETENTION_DAYS` (default: 90),
    ///   `ACCESSDOC_LOG_RETENTION_DAYS` (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Reader { lookup };

        let backend = match env
            .get("ACCESSDOC_DB_BACKEND")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("postgres") | Some("postgresql") => BackendKind::Postgres,
            Some("sqlite") => BackendKind::Sqlite,
            Some(other) => {
                return Err(ConfigError::Invalid(
                    "ACCESSDOC_DB_BACKEND",
                    format!("'{}' must be postgres or sqlite", other),
                ));
            }
        };

        let postgres_url = env.get("ACCESSDOC_POSTGRES_URL");
        let sqlite_url = env.get("ACCESSDOC_SQLITE_URL");
        let dual_write = env.flag("ACCESSDOC_DUAL_WRITE")?;

        let url_key = |kind: BackendKind| match kind {
            BackendKind::Postgres => "ACCESSDOC_POSTGRES_URL",
            BackendKind::Sqlite => "ACCESSDOC_SQLITE_URL",
        };
        let has_url = |kind: BackendKind| match kind {
            BackendKind::Postgres => postgres_url.is_some(),
            BackendKind::Sqlite => sqlite_url.is_some(),
        };
        if !has_url(backend) {
            return Err(ConfigError::Missing(url_key(backend)));
        }
        if dual_write && !has_url(backend.other()) {
            return Err(ConfigError::Missing(url_key(backend.other())));
        }

        let default_tier = match env.get("ACCESSDOC_DEFAULT_TIER") {
            Some(raw) => raw.to_ascii_lowercase().parse::<Tier>().map_err(|_| {
                ConfigError::Invalid("ACCESSDOC_DEFAULT_TIER", format!("unknown tier '{}'", raw))
            })?,
            None => Tier::Free,
        };

        let timeout_policies = match env.get("ACCESSDOC_STEP_TIMEOUTS") {
            Some(raw) => TimeoutPolicies::with_overrides(&parse_step_overrides(&raw)?)
                .map_err(ConfigError::Inconsistent)?,
            None => TimeoutPolicies::default(),
        };

        let pool_size = env.positive("ACCESSDOC_DB_POOL_SIZE", 10)?;
        let connect_retries = env.positive("ACCESSDOC_DB_CONNECT_RETRIES", 5)?;

        let config = Self {
            backend,
            postgres_url,
            sqlite_url,
            dual_write,
            cache_ttl: Duration::from_secs(env.positive("ACCESSDOC_CACHE_TTL_SECS", 300)?),
            pool_size: u32::try_from(pool_size).map_err(|_| {
                ConfigError::Invalid("ACCESSDOC_DB_POOL_SIZE", "too large".to_string())
            })?,
            query_timeout: Duration::from_secs(
                env.positive("ACCESSDOC_DB_QUERY_TIMEOUT_SECS", 30)?,
            ),
            connect_retries: u32::try_from(connect_retries).map_err(|_| {
                ConfigError::Invalid("ACCESSDOC_DB_CONNECT_RETRIES", "too large".to_string())
            })?,
            connect_backoff: Duration::from_millis(
                env.positive("ACCESSDOC_DB_CONNECT_BACKOFF_MS", 500)?,
            ),
            default_tier,
            service_name: env
                .get("ACCESSDOC_SERVICE_NAME")
                .unwrap_or_else(|| "accessdoc-core".to_string()),
            sweep_interval: Duration::from_secs(
                env.positive("ACCESSDOC_SWEEP_INTERVAL_SECS", 30)?,
            ),
            timeout_policies,
            retention_enabled: env.flag("ACCESSDOC_RETENTION_ENABLED")?,
            retention_interval: Duration::from_secs(
                env.positive("ACCESSDOC_RETENTION_INTERVAL_SECS", 3600)?,
            ),
            document_retention_days: env.positive("ACCESSDOC_DOCUMENT_RETENTION_DAYS", 365)?,
            job_retention_days: env.positive("ACCESSDOC_JOB_RETENTION_DAYS", 90)?,
            log_retention_days: env.positive("ACCESSDOC_LOG_RETENTION_DAYS", 30)?,
        };

        if config.log_retention_days > config.job_retention_days
            || config.job_retention_days > config.document_retention_days
        {
            return Err(ConfigError::Inconsistent(format!(
                "retention must satisfy log ({}) <= job ({}) <= document ({}) days",
                config.log_retention_days,
                config.job_retention_days,
                config.document_retention_days
            )));
        }

        Ok(config)
    }

    fn url_for(&self, backend: BackendKind) -> Option<&str> {
        match backend {
            BackendKind::Postgres => self.postgres_url.as_deref(),
            BackendKind::Sqlite => self.sqlite_url.as_deref(),
        }
    }

    /// Connection URL of the primary backend.
    pub fn primary_url(&self) -> Option<&str> {
        self.url_for(self.backend)
    }

    /// Backend and URL receiving mirrored writes, when dual-write is on.
    pub fn mirror(&self) -> Option<(BackendKind, &str)> {
        if !self.dual_write {
            return None;
        }
        let other = self.backend.other();
        self.url_for(other).map(|url| (other, url))
    }

    /// Pool and retry settings.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            max_connections: self.pool_size,
            acquire_timeout: self.query_timeout,
            query_timeout: self.query_timeout,
            retries: self.connect_retries,
            initial_backoff: self.connect_backoff,
        }
    }

    /// Quota enforcer settings.
    pub fn quota_config(&self) -> QuotaEnforcerConfig {
        QuotaEnforcerConfig {
            cache_ttl: self.cache_ttl,
            default_tier: self.default_tier,
            service_name: self.service_name.clone(),
        }
    }

    /// Timeout enforcer settings.
    pub fn timeout_config(&self) -> TimeoutEnforcerConfig {
        TimeoutEnforcerConfig {
            sweep_interval: self.sweep_interval,
            policies: self.timeout_policies.clone(),
            ..TimeoutEnforcerConfig::default()
        }
    }

    /// Retention worker settings.
    pub fn retention_config(&self) -> RetentionWorkerConfig {
        RetentionWorkerConfig {
            enabled: self.retention_enabled,
            poll_interval: self.retention_interval,
            document_retention: Duration::from_secs(self.document_retention_days.saturating_mul(DAY)),
            job_retention: Duration::from_secs(self.job_retention_days.saturating_mul(DAY)),
            log_retention: Duration::from_secs(self.log_retention_days.saturating_mul(DAY)),
            ..RetentionWorkerConfig::default()
        }
    }
}

/// Holds the current configuration snapshot.
///
/// Readers take an `Arc<Config>` and keep using it for the duration of an
/// operation; a reload only affects later snapshots.
pub struct ConfigProvider {
    current: RwLock<Arc<Config>>,
}

impl ConfigProvider {
    /// Provider seeded with `config`.
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Provider seeded from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::from_env().map(Self::new)
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<Config> {
        self.current.read().clone()
    }

    /// Re-read the environment. On error the previous snapshot stays active.
    pub fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        self.reload_with(|key| std::env::var(key).ok())
    }

    /// Re-read through `lookup`. On error the previous snapshot stays active.
    pub fn reload_with<F>(&self, lookup: F) -> Result<Arc<Config>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fresh = Arc::new(Config::from_lookup(lookup)?);
        *self.current.write() = fresh.clone();
        info!(backend = %fresh.backend, dual_write = fresh.dual_write, "Configuration reloaded");
        Ok(fresh)
    }
}
