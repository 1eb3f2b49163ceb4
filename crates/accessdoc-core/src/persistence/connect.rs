// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool construction with bounded retry and automatic migration.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

use crate::error::CoreError;
use crate::migrations;

use super::{BackendKind, PostgresStore, SqliteStore};

/// Longest pause between two connection attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Pool and retry settings shared by both backends.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Pool size.
    pub max_connections: u32,
    /// How long to wait for a free connection.
    pub acquire_timeout: Duration,
    /// Per-statement timeout (`statement_timeout` on PostgreSQL, busy
    /// timeout on SQLite).
    pub query_timeout: Duration,
    /// Extra attempts after the first failed connect.
    pub retries: u32,
    /// Delay before the first retry; doubled on each further attempt.
    pub initial_backoff: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(30),
            retries: 5,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl ConnectOptions {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

async fn with_retry<T, F, Fut>(
    backend: BackendKind,
    options: &ConnectOptions,
    mut connect: F,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        match connect().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(backend = %backend, retries = attempt, "Connected after retrying");
                }
                return Ok(value);
            }
            Err(e) if attempt < options.retries => {
                attempt += 1;
                let delay = options.backoff_for(attempt);
                warn!(
                    backend = %backend,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(CoreError::DatabaseError {
                    operation: "connect".to_string(),
                    details: format!(
                        "{} unreachable after {} attempts: {}",
                        backend,
                        attempt + 1,
                        e
                    ),
                });
            }
        }
    }
}

/// Connect to PostgreSQL and apply pending migrations.
pub async fn connect_postgres(
    url: &str,
    options: &ConnectOptions,
) -> Result<PostgresStore, CoreError> {
    let connect_options = PgConnectOptions::from_str(url)
        .map_err(|e| CoreError::validation("postgres_url", e.to_string()))?
        .options([(
            "statement_timeout",
            format!("{}ms", options.query_timeout.as_millis()),
        )]);

    let pool = with_retry(BackendKind::Postgres, options, || {
        PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect_with(connect_options.clone())
    })
    .await?;

    migrations::run_postgres(&pool).await?;
    info!(max_connections = options.max_connections, "PostgreSQL store ready");

    Ok(PostgresStore::new(pool))
}

/// Connect to SQLite (creating the file if needed) and apply pending
/// migrations.
pub async fn connect_sqlite(
    url: &str,
    options: &ConnectOptions,
) -> Result<SqliteStore, CoreError> {
    let connect_options = SqliteConnectOptions::from_str(url)
        .map_err(|e| CoreError::validation("sqlite_url", e.to_string()))?
        .create_if_missing(true)
        .busy_timeout(options.query_timeout);

    let pool = with_retry(BackendKind::Sqlite, options, || {
        SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect_with(connect_options.clone())
    })
    .await?;

    migrations::run_sqlite(&pool).await?;
    info!(max_connections = options.max_connections, "SQLite store ready");

    Ok(SqliteStore::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::StoreHealth;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let options = ConnectOptions {
            initial_backoff: Duration::from_millis(500),
            ..ConnectOptions::default()
        };
        assert_eq!(options.backoff_for(1), Duration::from_millis(500));
        assert_eq!(options.backoff_for(2), Duration::from_secs(1));
        assert_eq!(options.backoff_for(3), Duration::from_secs(2));
        assert_eq!(options.backoff_for(10), MAX_BACKOFF);
        assert_eq!(options.backoff_for(64), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_connect_sqlite_creates_and_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("core.db").display());

        let store = connect_sqlite(&url, &ConnectOptions::default())
            .await
            .unwrap();
        let report = store.health_check().await.unwrap();
        assert!(report.healthy);
        assert_eq!(report.documents, 0);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retries() {
        let options = ConnectOptions {
            retries: 1,
            initial_backoff: Duration::from_millis(1),
            acquire_timeout: Duration::from_millis(200),
            ..ConnectOptions::default()
        };
        let url = "sqlite:/nonexistent-dir/deeper/core.db";

        let err = connect_sqlite(url, &options).await.unwrap_err();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
        assert!(err.to_string().contains("after 2 attempts"), "{}", err);
    }

    #[tokio::test]
    async fn test_invalid_url_is_validation_error() {
        let err = connect_postgres("not a url", &ConnectOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
