// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema migrations for both storage backends.
//!
//! The two migration sets describe the same logical schema; only column
//! types differ (`TIMESTAMPTZ` vs RFC 3339 `TEXT`, `BOOLEAN` vs `INTEGER`).
//!
//! ```ignore
//! let pool = sqlx::SqlitePool::connect("sqlite:accessdoc.db?mode=rwc").await?;
//! accessdoc_core::migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::{MigrateError, Migrator};

/// PostgreSQL schema.
pub static POSTGRES: Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite schema.
pub static SQLITE: Migrator = sqlx::migrate!("./migrations/sqlite");

/// Bring a PostgreSQL database up to date. Already-applied migrations are
/// skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Bring a SQLite database up to date. Already-applied migrations are
/// skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backends_ship_the_same_migration_versions() {
        let pg: Vec<i64> = POSTGRES.iter().map(|m| m.version).collect();
        let sqlite: Vec<i64> = SQLITE.iter().map(|m| m.version).collect();
        assert!(!pg.is_empty());
        assert_eq!(pg, sqlite);
    }

    #[tokio::test]
    async fn test_sqlite_migrations_are_idempotent() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_sqlite(&pool).await.unwrap();
        run_sqlite(&pool).await.unwrap();
    }
}
