// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for accessdoc-core integration tests.
//!
//! SQLite tests run everywhere. PostgreSQL tests need `TEST_DATABASE_URL`
//! and are skipped without it.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use accessdoc_core::persistence::{
    ConnectOptions, PersistenceManager, PostgresStore, SqliteStore, Store, connect_postgres,
};

/// Primary and mirror stores wired into a dual-writing manager.
pub struct DualWrite {
    pub primary: Arc<SqliteStore>,
    pub mirror: Arc<SqliteStore>,
    pub manager: Arc<PersistenceManager>,
}

impl DualWrite {
    pub async fn new() -> Self {
        let primary = Arc::new(
            SqliteStore::in_memory()
                .await
                .expect("Failed to create primary store"),
        );
        let mirror = Arc::new(
            SqliteStore::in_memory()
                .await
                .expect("Failed to create mirror store"),
        );
        let manager = Arc::new(
            PersistenceManager::new(primary.clone()).with_mirror(mirror.clone()),
        );
        Self {
            primary,
            mirror,
            manager,
        }
    }

    /// The manager as a plain store, the way services consume it.
    pub fn store(&self) -> Arc<dyn Store> {
        self.manager.clone()
    }
}

/// Fresh in-memory SQLite store.
pub async fn sqlite_store() -> Arc<SqliteStore> {
    Arc::new(
        SqliteStore::in_memory()
            .await
            .expect("Failed to create in-memory store"),
    )
}

/// Connect to `TEST_DATABASE_URL` and migrate, or `None` when unset.
pub async fn postgres_store() -> Option<PostgresStore> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let options = ConnectOptions {
        retries: 1,
        initial_backoff: Duration::from_millis(100),
        acquire_timeout: Duration::from_secs(5),
        ..ConnectOptions::default()
    };
    connect_postgres(&url, &options).await.ok()
}

/// Organization id unique to one test run.
pub fn unique_org() -> String {
    format!("org-{}", Uuid::new_v4())
}

/// Fixed clock for deterministic tests.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

/// `fixed_now()` minus `secs` seconds.
pub fn secs_ago(secs: i64) -> DateTime<Utc> {
    fixed_now() - chrono::Duration::seconds(secs)
}

/// Skip the current test when no PostgreSQL database is configured.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
