// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker enforcing data retention.
//!
//! Each pass deletes, in this order:
//! 1. job log entries older than the log retention window
//! 2. terminal jobs completed before the job retention window
//! 3. terminal documents completed before the document retention window
//!    that no longer have unfinished jobs (artifacts and remaining jobs
//!    go with them through `ON DELETE CASCADE`)
//!
//! Rows in non-terminal states are never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::CoreError;
use crate::persistence::Store;

const DAY: u64 = 24 * 3600;

/// Configuration for the retention worker.
#[derive(Debug, Clone)]
pub struct RetentionWorkerConfig {
    /// Whether the worker runs at all.
    pub enabled: bool,
    /// Pause between passes.
    pub poll_interval: Duration,
    /// Age after which terminal documents are deleted.
    pub document_retention: Duration,
    /// Age after which terminal jobs are deleted.
    pub job_retention: Duration,
    /// Age after which job log entries are deleted.
    pub log_retention: Duration,
    /// Rows deleted per statement.
    pub batch_size: i64,
}

impl Default for RetentionWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),
            document_retention: Duration::from_secs(365 * DAY),
            job_retention: Duration::from_secs(90 * DAY),
            log_retention: Duration::from_secs(30 * DAY),
            batch_size: 100,
        }
    }
}

/// Rows deleted by one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    /// Job log entries.
    pub logs: u64,
    /// Jobs.
    pub jobs: u64,
    /// Documents.
    pub documents: u64,
}

/// Background worker that purges expired rows.
pub struct RetentionWorker {
    store: Arc<dyn Store>,
    config: RetentionWorkerConfig,
    shutdown: Arc<Notify>,
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> Result<DateTime<Utc>, CoreError> {
    let age = chrono::Duration::from_std(age)
        .map_err(|e| CoreError::validation("retention", format!("Invalid duration: {}", e)))?;
    Ok(now - age)
}

impl RetentionWorker {
    /// Create a retention worker deleting through `store`.
    pub fn new(store: Arc<dyn Store>, config: RetentionWorkerConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run passes until shutdown is signalled. Returns immediately when
    /// disabled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Retention worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            document_retention_days = self.config.document_retention.as_secs() / DAY,
            job_retention_days = self.config.job_retention.as_secs() / DAY,
            log_retention_days = self.config.log_retention.as_secs() / DAY,
            "Retention worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Retention worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_once_at(Utc::now()).await {
                        Ok(report) => info!(
                            logs = report.logs,
                            jobs = report.jobs,
                            documents = report.documents,
                            "Retention pass finished"
                        ),
                        Err(e) => error!(error = %e, "Failed to purge expired rows"),
                    }
                }
            }
        }

        info!("Retention worker stopped");
    }

    /// One pass evaluated at `now`.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<RetentionReport, CoreError> {
        let mut report = RetentionReport {
            logs: self
                .store
                .purge_job_logs(cutoff(now, self.config.log_retention)?)
                .await?,
            ..RetentionReport::default()
        };

        let jobs_before = cutoff(now, self.config.job_retention)?;
        loop {
            let deleted = self
                .store
                .purge_terminal_jobs(jobs_before, self.config.batch_size)
                .await?;
            report.jobs += deleted;
            debug!(deleted, total = report.jobs, "Purged batch of jobs");
            if deleted < self.config.batch_size as u64 {
                break;
            }
        }

        let documents_before = cutoff(now, self.config.document_retention)?;
        loop {
            let deleted = self
                .store
                .purge_terminal_documents(documents_before, self.config.batch_size)
                .await?;
            report.documents += deleted;
            debug!(deleted, total = report.documents, "Purged batch of documents");
            if deleted < self.config.batch_size as u64 {
                break;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{DocumentStatus, LogEntry, LogLevel, PipelineStep};
    use crate::persistence::{DocumentStatusUpdate, JobStatusUpdate, NewDocument, NewJob, SqliteStore};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 31, 0, 0, 0).unwrap()
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        now() - chrono::Duration::days(days)
    }

    fn config() -> RetentionWorkerConfig {
        RetentionWorkerConfig {
            enabled: true,
            batch_size: 1,
            ..RetentionWorkerConfig::default()
        }
    }

    /// Document processed `age` days ago with one finished job per step.
    async fn finished_document(store: &Arc<dyn Store>, age: i64, steps: &[PipelineStep]) -> String {
        let at = days_ago(age);
        let doc = store
            .create_document(NewDocument::new("user-1", "acme", "a.pdf").created_at(at))
            .await
            .unwrap();
        for step in steps {
            let job = store
                .create_job(NewJob::for_document(&doc, *step).created_at(at))
                .await
                .unwrap();
            store.claim_job(&job.id, "worker-1", at).await.unwrap();
            let running = store.get_job(&job.id).await.unwrap().unwrap();
            store
                .append_job_log(&job.id, &LogEntry::new(LogLevel::Info, "done", at))
                .await
                .unwrap();
            store
                .update_job_status(&job.id, &JobStatusUpdate::completed(&running, None, at))
                .await
                .unwrap();
        }
        store
            .update_document_status(&doc.id, &DocumentStatusUpdate::at(DocumentStatus::Processing, at))
            .await
            .unwrap();
        store
            .update_document_status(&doc.id, &DocumentStatusUpdate::at(DocumentStatus::Completed, at))
            .await
            .unwrap();
        doc.id
    }

    #[tokio::test]
    async fn test_purges_only_expired_terminal_rows() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());

        let ancient = finished_document(&store, 400, &[PipelineStep::Route, PipelineStep::Ocr]).await;
        let recent = finished_document(&store, 100, &[PipelineStep::Route]).await;
        let fresh = finished_document(&store, 5, &[PipelineStep::Route]).await;

        // Old but still running: never touched.
        let at = days_ago(200);
        let busy = store
            .create_document(NewDocument::new("user-2", "acme", "b.pdf").created_at(at))
            .await
            .unwrap();
        let job = store
            .create_job(NewJob::for_document(&busy, PipelineStep::Ocr).created_at(at))
            .await
            .unwrap();
        store.claim_job(&job.id, "worker-1", at).await.unwrap();

        let worker = RetentionWorker::new(store.clone(), config());
        let report = worker.run_once_at(now()).await.unwrap();

        assert_eq!(report.logs, 3);
        assert_eq!(report.jobs, 3);
        assert_eq!(report.documents, 1);

        assert!(store.get_document(&ancient).await.unwrap().is_none());
        assert!(store.get_document(&recent).await.unwrap().is_some());
        assert!(store.get_document(&fresh).await.unwrap().is_some());
        assert_eq!(store.list_jobs_by_document(&fresh).await.unwrap().len(), 1);
        assert!(store.get_job(&job.id).await.unwrap().is_some());

        let again = worker.run_once_at(now()).await.unwrap();
        assert_eq!(again, RetentionReport::default());
    }

    #[tokio::test]
    async fn test_disabled_worker_returns_immediately() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let worker = RetentionWorker::new(store, RetentionWorkerConfig::default());
        tokio::time::timeout(Duration::from_secs(1), worker.run())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let worker = Arc::new(RetentionWorker::new(store, config()));
        let shutdown = worker.shutdown_handle();

        let running = worker.clone();
        let handle = tokio::spawn(async move { running.run().await });
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
