// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! accessdoc-core service
//!
//! Connects the configured stores (plus the mirror when dual-write is on)
//! and runs the background loops:
//! - timeout sweeps over running jobs
//! - retention passes over expired terminal rows (when enabled)
//!
//! The quota enforcer is built over the same store so admission checks and
//! the workers share one view of usage.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use accessdoc_core::config::ConfigProvider;
use accessdoc_core::persistence::{
    BackendKind, ConnectOptions, PersistenceManager, PostgresStore, SqliteStore, Store,
    connect_postgres, connect_sqlite,
};
use accessdoc_core::quota::QuotaEnforcer;
use accessdoc_core::retention::RetentionWorker;
use accessdoc_core::timeout::{TimeoutEnforcer, TimeoutEvent, TimeoutReason};

enum Connected {
    Postgres(PostgresStore),
    Sqlite(SqliteStore),
}

impl Connected {
    async fn open(backend: BackendKind, url: &str, options: &ConnectOptions) -> Result<Self> {
        info!(backend = %backend, "Connecting to database...");
        Ok(match backend {
            BackendKind::Postgres => Self::Postgres(connect_postgres(url, options).await?),
            BackendKind::Sqlite => Self::Sqlite(connect_sqlite(url, options).await?),
        })
    }

    fn store(&self) -> Arc<dyn Store> {
        match self {
            Self::Postgres(store) => Arc::new(store.clone()),
            Self::Sqlite(store) => Arc::new(store.clone()),
        }
    }

    async fn close(&self) {
        match self {
            Self::Postgres(store) => store.pool().close().await,
            Self::Sqlite(store) => store.pool().close().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("accessdoc_core=info".parse()?),
        )
        .init();

    info!("Starting accessdoc-core");

    // Load configuration
    let provider = ConfigProvider::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let config = provider.snapshot();

    info!(
        backend = %config.backend,
        dual_write = config.dual_write,
        default_tier = %config.default_tier,
        sweep_interval_secs = config.sweep_interval.as_secs(),
        retention_enabled = config.retention_enabled,
        "Configuration loaded"
    );

    let options = config.connect_options();
    let primary_url = config
        .primary_url()
        .ok_or_else(|| anyhow::anyhow!("no URL for primary backend {}", config.backend))?;
    let primary = Connected::open(config.backend, primary_url, &options).await?;

    let health = primary.store().health_check().await?;
    info!(
        backend = %health.backend,
        latency_ms = health.latency_ms,
        documents = health.documents,
        jobs = health.jobs,
        "Database health check passed"
    );

    let mut manager = PersistenceManager::new(primary.store());
    let mirror = match config.mirror() {
        Some((backend, url)) => {
            let mirror = Connected::open(backend, url, &options).await?;
            manager = manager.with_mirror(mirror.store());
            info!(primary = %config.backend, mirror = %backend, "Dual-write enabled");
            Some(mirror)
        }
        None => None,
    };

    // Mirror problems never stop the service.
    match manager.mirror_health().await {
        Some(Ok(health)) if health.healthy => {
            info!(
                backend = %health.backend,
                latency_ms = health.latency_ms,
                "Mirror health check passed"
            );
        }
        Some(Ok(health)) => {
            warn!(backend = %health.backend, "Mirror reported unhealthy, continuing");
        }
        Some(Err(e)) => {
            warn!(error = %e, "Mirror health check failed, continuing");
        }
        None => {}
    }

    let store: Arc<dyn Store> = Arc::new(manager);

    let quotas = Arc::new(QuotaEnforcer::new(store.clone(), config.quota_config()));
    info!(
        default_tier = %quotas.config().default_tier,
        cache_ttl_secs = quotas.config().cache_ttl.as_secs(),
        "Quota enforcer ready"
    );

    let timeouts = Arc::new(TimeoutEnforcer::new(store.clone(), config.timeout_config()));
    timeouts.on_timeout(
        TimeoutReason::GlobalTimeout,
        Arc::new(|event: &TimeoutEvent| {
            warn!(
                job_id = %event.job_id,
                document_id = %event.document_id,
                step = %event.step,
                "Job exceeded its global timeout"
            );
        }),
    );
    let retention = Arc::new(RetentionWorker::new(store.clone(), config.retention_config()));

    info!("accessdoc-core initialized successfully");

    let timeout_shutdown = timeouts.shutdown_handle();
    let timeout_task = tokio::spawn({
        let timeouts = timeouts.clone();
        async move { timeouts.run().await }
    });

    let retention_shutdown = retention.shutdown_handle();
    let retention_task = tokio::spawn({
        let retention = retention.clone();
        async move { retention.run().await }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    timeout_shutdown.notify_one();
    retention_shutdown.notify_one();
    for (name, task) in [("timeout", timeout_task), ("retention", retention_task)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    primary.close().await;
    if let Some(mirror) = mirror {
        mirror.close().await;
    }
    info!("Shutdown complete");

    Ok(())
}
