// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend routing and dual-write mirroring.
//!
//! Every mutation runs against the primary store first. Only when it
//! succeeds is the same mutation replayed against the mirror; mirror
//! failures are logged and counted but never reach the caller. Reads always
//! go to the primary.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::lifecycle::{DocumentStatus, JobStatus, LogEntry, PipelineStep};
use crate::quota::ResourceType;

use super::{
    AggregateRow, BackendKind, DocumentAggregate, DocumentRecord, DocumentRepository,
    DocumentStatusUpdate, HealthReport, JobAggregate, JobFilter, JobRecord, JobRepository,
    JobStatusUpdate, ListQuery, NewDocument, NewJob, NewQuotaViolation, Page, QuotaLimitRecord,
    QuotaRepository, QuotaUsageRecord, QuotaViolationRecord, Store, StoreHealth, UsageIncrement,
};

/// What happened to the mirrored copy of a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum MirrorOutcome {
    /// No mirror configured, or the primary did not apply the change.
    Skipped,
    /// The mirror applied the change.
    Ok,
    /// The mirror rejected or could not apply the change.
    Failed(String),
}

impl MirrorOutcome {
    /// Whether the mirror write failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Primary result plus the outcome of its mirrored copy.
#[derive(Debug, Clone)]
pub struct Mirrored<T> {
    /// Result of the primary write.
    pub value: T,
    /// Mirror outcome.
    pub mirror: MirrorOutcome,
}

impl<T> Mirrored<T> {
    fn skipped(value: T) -> Self {
        Self {
            value,
            mirror: MirrorOutcome::Skipped,
        }
    }

    /// Drop the mirror outcome.
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Most recent mirror failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirrorFailure {
    /// Repository operation that failed.
    pub operation: &'static str,
    /// Affected entity.
    pub entity_id: String,
    /// Error text.
    pub error: String,
    /// When the failure was observed.
    pub at: DateTime<Utc>,
}

/// Cumulative mirror counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirrorStats {
    /// Mirror writes attempted.
    pub attempts: u64,
    /// Mirror writes that failed.
    pub failures: u64,
    /// Most recent failure.
    pub last_failure: Option<MirrorFailure>,
}

#[derive(Default)]
struct MirrorCounters {
    attempts: AtomicU64,
    failures: AtomicU64,
    last_failure: Mutex<Option<MirrorFailure>>,
}

/// Routes repository calls to the primary store and, during a backend
/// migration, mirrors mutations to a secondary store.
pub struct PersistenceManager {
    primary: Arc<dyn Store>,
    secondary: Option<Arc<dyn Store>>,
    counters: MirrorCounters,
}

impl PersistenceManager {
    /// Manager over a single store.
    pub fn new(primary: Arc<dyn Store>) -> Self {
        Self {
            primary,
            secondary: None,
            counters: MirrorCounters::default(),
        }
    }

    /// Mirror every mutation to `secondary`.
    pub fn with_mirror(mut self, secondary: Arc<dyn Store>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Backend serving reads and primary writes.
    pub fn primary_backend(&self) -> BackendKind {
        self.primary.backend()
    }

    /// Backend receiving mirrored writes, if dual-write is on.
    pub fn mirror_backend(&self) -> Option<BackendKind> {
        self.secondary.as_ref().map(|s| s.backend())
    }

    /// Snapshot of the mirror counters.
    pub fn stats(&self) -> MirrorStats {
        MirrorStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            last_failure: self.counters.last_failure.lock().clone(),
        }
    }

    /// Probe the mirror store.
    pub async fn mirror_health(&self) -> Option<Result<HealthReport, CoreError>> {
        match &self.secondary {
            Some(secondary) => Some(secondary.health_check().await),
            None => None,
        }
    }

    fn settle(
        &self,
        secondary: &dyn Store,
        operation: &'static str,
        entity_id: &str,
        result: Result<bool, CoreError>,
    ) -> MirrorOutcome {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

        let error = match result {
            Ok(true) => {
                debug!(operation, entity_id, "Mirrored write applied");
                return MirrorOutcome::Ok;
            }
            Ok(false) => "row missing or in a different state on mirror".to_string(),
            Err(e) => e.to_string(),
        };

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            operation,
            entity_id,
            backend = %secondary.backend(),
            error = %error,
            "Mirrored write failed"
        );
        *self.counters.last_failure.lock() = Some(MirrorFailure {
            operation,
            entity_id: entity_id.to_string(),
            error: error.clone(),
            at: Utc::now(),
        });

        MirrorOutcome::Failed(error)
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Insert a document in both stores.
    pub async fn create_document_mirrored(
        &self,
        new: NewDocument,
    ) -> Result<Mirrored<DocumentRecord>, CoreError> {
        let Some(secondary) = &self.secondary else {
            return Ok(Mirrored::skipped(self.primary.create_document(new).await?));
        };

        let copy = new.clone();
        let value = self.primary.create_document(new).await?;
        let result = secondary.create_document(copy).await.map(|_| true);
        let mirror = self.settle(secondary.as_ref(), "create_document", &value.id, result);

        Ok(Mirrored { value, mirror })
    }

    /// Guarded document status change in both stores.
    pub async fn update_document_status_mirrored(
        &self,
        id: &str,
        update: &DocumentStatusUpdate,
    ) -> Result<Mirrored<bool>, CoreError> {
        let applied = self.primary.update_document_status(id, update).await?;
        let Some(secondary) = self.secondary.as_ref().filter(|_| applied) else {
            return Ok(Mirrored::skipped(applied));
        };

        let result = secondary.update_document_status(id, update).await;
        let mirror = self.settle(secondary.as_ref(), "update_document_status", id, result);

        Ok(Mirrored {
            value: applied,
            mirror,
        })
    }

    /// Artifact upsert in both stores.
    pub async fn set_document_artifact_mirrored(
        &self,
        id: &str,
        name: &str,
        locator: &str,
        at: DateTime<Utc>,
    ) -> Result<Mirrored<bool>, CoreError> {
        let applied = self
            .primary
            .set_document_artifact(id, name, locator, at)
            .await?;
        let Some(secondary) = self.secondary.as_ref().filter(|_| applied) else {
            return Ok(Mirrored::skipped(applied));
        };

        let result = secondary.set_document_artifact(id, name, locator, at).await;
        let mirror = self.settle(secondary.as_ref(), "set_document_artifact", id, result);

        Ok(Mirrored {
            value: applied,
            mirror,
        })
    }

    /// Retention purge in both stores. Row counts may differ.
    pub async fn purge_terminal_documents_mirrored(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Mirrored<u64>, CoreError> {
        let purged = self.primary.purge_terminal_documents(before, limit).await?;
        let Some(secondary) = &self.secondary else {
            return Ok(Mirrored::skipped(purged));
        };

        let result = secondary
            .purge_terminal_documents(before, limit)
            .await
            .map(|_| true);
        let mirror = self.settle(
            secondary.as_ref(),
            "purge_terminal_documents",
            "documents",
            result,
        );

        Ok(Mirrored {
            value: purged,
            mirror,
        })
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Insert a job in both stores and move its document from `pending` to
    /// `processing`.
    ///
    /// Once the job insert succeeds the call succeeds; a failed promotion is
    /// only logged.
    pub async fn create_job_mirrored(&self, new: NewJob) -> Result<Mirrored<JobRecord>, CoreError> {
        let copy = self.secondary.as_ref().map(|_| new.clone());
        let job = self.primary.create_job(new).await?;

        let mirror = match (&self.secondary, copy) {
            (Some(secondary), Some(copy)) => {
                let result = secondary.create_job(copy).await.map(|_| true);
                self.settle(secondary.as_ref(), "create_job", &job.id, result)
            }
            _ => MirrorOutcome::Skipped,
        };

        // The job is already stored, so a failed promotion must not turn
        // into a failed create.
        let promote = DocumentStatusUpdate::at(DocumentStatus::Processing, job.created_at);
        match self
            .update_document_status_mirrored(&job.document_id, &promote)
            .await
        {
            Ok(promoted) if promoted.value => {
                debug!(
                    document_id = %job.document_id,
                    job_id = %job.id,
                    "Document entered processing"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    document_id = %job.document_id,
                    job_id = %job.id,
                    error = %e,
                    "Job created but document promotion failed"
                );
            }
        }

        Ok(Mirrored { value: job, mirror })
    }

    /// Create a job for `step` of a stored document, inheriting its
    /// organization and priority.
    pub async fn create_job_for_document(
        &self,
        document_id: &str,
        step: PipelineStep,
    ) -> Result<Mirrored<JobRecord>, CoreError> {
        let document = self.primary.get_document(document_id).await?.ok_or_else(|| {
            CoreError::DocumentNotFound {
                document_id: document_id.to_string(),
            }
        })?;

        self.create_job_mirrored(NewJob::for_document(&document, step))
            .await
    }

    /// Claim in both stores.
    pub async fn claim_job_mirrored(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Mirrored<bool>, CoreError> {
        let applied = self.primary.claim_job(id, worker_id, now).await?;
        let Some(secondary) = self.secondary.as_ref().filter(|_| applied) else {
            return Ok(Mirrored::skipped(applied));
        };

        let result = secondary.claim_job(id, worker_id, now).await;
        let mirror = self.settle(secondary.as_ref(), "claim_job", id, result);

        Ok(Mirrored {
            value: applied,
            mirror,
        })
    }

    /// Heartbeat in both stores.
    pub async fn set_heartbeat_mirrored(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Mirrored<bool>, CoreError> {
        let applied = self.primary.set_heartbeat(id, worker_id, now).await?;
        let Some(secondary) = self.secondary.as_ref().filter(|_| applied) else {
            return Ok(Mirrored::skipped(applied));
        };

        let result = secondary.set_heartbeat(id, worker_id, now).await;
        let mirror = self.settle(secondary.as_ref(), "set_heartbeat", id, result);

        Ok(Mirrored {
            value: applied,
            mirror,
        })
    }

    /// Guarded job status change in both stores.
    pub async fn update_job_status_mirrored(
        &self,
        id: &str,
        update: &JobStatusUpdate,
    ) -> Result<Mirrored<bool>, CoreError> {
        let applied = self.primary.update_job_status(id, update).await?;
        let Some(secondary) = self.secondary.as_ref().filter(|_| applied) else {
            return Ok(Mirrored::skipped(applied));
        };

        let result = secondary.update_job_status(id, update).await;
        let mirror = self.settle(secondary.as_ref(), "update_job_status", id, result);

        Ok(Mirrored {
            value: applied,
            mirror,
        })
    }

    /// Log append in both stores.
    pub async fn append_job_log_mirrored(
        &self,
        id: &str,
        entry: &LogEntry,
    ) -> Result<Mirrored<()>, CoreError> {
        self.primary.append_job_log(id, entry).await?;
        let Some(secondary) = &self.secondary else {
            return Ok(Mirrored::skipped(()));
        };

        let result = secondary.append_job_log(id, entry).await.map(|_| true);
        let mirror = self.settle(secondary.as_ref(), "append_job_log", id, result);

        Ok(Mirrored { value: (), mirror })
    }

    /// Log purge in both stores.
    pub async fn purge_job_logs_mirrored(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Mirrored<u64>, CoreError> {
        let purged = self.primary.purge_job_logs(before).await?;
        let Some(secondary) = &self.secondary else {
            return Ok(Mirrored::skipped(purged));
        };

        let result = secondary.purge_job_logs(before).await.map(|_| true);
        let mirror = self.settle(secondary.as_ref(), "purge_job_logs", "job_logs", result);

        Ok(Mirrored {
            value: purged,
            mirror,
        })
    }

    /// Terminal job purge in both stores.
    pub async fn purge_terminal_jobs_mirrored(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Mirrored<u64>, CoreError> {
        let purged = self.primary.purge_terminal_jobs(before, limit).await?;
        let Some(secondary) = &self.secondary else {
            return Ok(Mirrored::skipped(purged));
        };

        let result = secondary
            .purge_terminal_jobs(before, limit)
            .await
            .map(|_| true);
        let mirror = self.settle(secondary.as_ref(), "purge_terminal_jobs", "jobs", result);

        Ok(Mirrored {
            value: purged,
            mirror,
        })
    }

    // ========================================================================
    // Quotas
    // ========================================================================

    /// Lazy limit creation in both stores.
    pub async fn insert_limit_if_absent_mirrored(
        &self,
        limit: &QuotaLimitRecord,
    ) -> Result<Mirrored<QuotaLimitRecord>, CoreError> {
        let stored = self.primary.insert_limit_if_absent(limit).await?;
        let Some(secondary) = &self.secondary else {
            return Ok(Mirrored::skipped(stored));
        };

        // Replay what the primary holds so both stores agree on the value.
        let result = secondary.insert_limit_if_absent(&stored).await.map(|_| true);
        let mirror = self.settle(
            secondary.as_ref(),
            "insert_limit_if_absent",
            &limit.organization_id,
            result,
        );

        Ok(Mirrored {
            value: stored,
            mirror,
        })
    }

    /// Limit upsert in both stores.
    pub async fn upsert_limit_mirrored(
        &self,
        limit: &QuotaLimitRecord,
    ) -> Result<Mirrored<()>, CoreError> {
        self.primary.upsert_limit(limit).await?;
        let Some(secondary) = &self.secondary else {
            return Ok(Mirrored::skipped(()));
        };

        let result = secondary.upsert_limit(limit).await.map(|_| true);
        let mirror = self.settle(
            secondary.as_ref(),
            "upsert_limit",
            &limit.organization_id,
            result,
        );

        Ok(Mirrored { value: (), mirror })
    }

    /// Usage increment in both stores. Returns the primary's counter.
    pub async fn increment_usage_mirrored(
        &self,
        increment: &UsageIncrement,
    ) -> Result<Mirrored<i64>, CoreError> {
        let usage = self.primary.increment_usage(increment).await?;
        let Some(secondary) = &self.secondary else {
            return Ok(Mirrored::skipped(usage));
        };

        let result = secondary.increment_usage(increment).await.map(|_| true);
        let mirror = self.settle(
            secondary.as_ref(),
            "increment_usage",
            &increment.organization_id,
            result,
        );

        Ok(Mirrored {
            value: usage,
            mirror,
        })
    }

    /// Violation audit row in both stores.
    pub async fn record_violation_mirrored(
        &self,
        violation: &NewQuotaViolation,
    ) -> Result<Mirrored<()>, CoreError> {
        self.primary.record_violation(violation).await?;
        let Some(secondary) = &self.secondary else {
            return Ok(Mirrored::skipped(()));
        };

        let result = secondary.record_violation(violation).await.map(|_| true);
        let mirror = self.settle(
            secondary.as_ref(),
            "record_violation",
            &violation.organization_id,
            result,
        );

        Ok(Mirrored { value: (), mirror })
    }
}

// ============================================================================
// Repository traits
// ============================================================================

#[async_trait::async_trait]
impl DocumentRepository for PersistenceManager {
    async fn create_document(&self, new: NewDocument) -> Result<DocumentRecord, CoreError> {
        self.create_document_mirrored(new)
            .await
            .map(Mirrored::into_inner)
    }

    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>, CoreError> {
        self.primary.get_document(id).await
    }

    async fn list_documents_by_owner(
        &self,
        owner_id: &str,
        query: &ListQuery<DocumentStatus>,
    ) -> Result<Page<DocumentRecord>, CoreError> {
        self.primary.list_documents_by_owner(owner_id, query).await
    }

    async fn update_document_status(
        &self,
        id: &str,
        update: &DocumentStatusUpdate,
    ) -> Result<bool, CoreError> {
        self.update_document_status_mirrored(id, update)
            .await
            .map(Mirrored::into_inner)
    }

    async fn set_document_artifact(
        &self,
        id: &str,
        name: &str,
        locator: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.set_document_artifact_mirrored(id, name, locator, at)
            .await
            .map(Mirrored::into_inner)
    }

    async fn aggregate_documents(
        &self,
        spec: &DocumentAggregate,
    ) -> Result<Vec<AggregateRow>, CoreError> {
        self.primary.aggregate_documents(spec).await
    }

    async fn purge_terminal_documents(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        self.purge_terminal_documents_mirrored(before, limit)
            .await
            .map(Mirrored::into_inner)
    }
}

#[async_trait::async_trait]
impl JobRepository for PersistenceManager {
    async fn create_job(&self, new: NewJob) -> Result<JobRecord, CoreError> {
        self.create_job_mirrored(new).await.map(Mirrored::into_inner)
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, CoreError> {
        self.primary.get_job(id).await
    }

    async fn list_jobs_by_document(&self, document_id: &str) -> Result<Vec<JobRecord>, CoreError> {
        self.primary.list_jobs_by_document(document_id).await
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        query: &ListQuery<JobStatus>,
    ) -> Result<Page<JobRecord>, CoreError> {
        self.primary.list_jobs(filter, query).await
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<JobRecord>, CoreError> {
        self.primary.list_jobs_by_status(status, limit).await
    }

    async fn count_active_jobs(&self, organization_id: &str) -> Result<i64, CoreError> {
        self.primary.count_active_jobs(organization_id).await
    }

    async fn claim_job(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.claim_job_mirrored(id, worker_id, now)
            .await
            .map(Mirrored::into_inner)
    }

    async fn set_heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        self.set_heartbeat_mirrored(id, worker_id, now)
            .await
            .map(Mirrored::into_inner)
    }

    async fn update_job_status(
        &self,
        id: &str,
        update: &JobStatusUpdate,
    ) -> Result<bool, CoreError> {
        self.update_job_status_mirrored(id, update)
            .await
            .map(Mirrored::into_inner)
    }

    async fn append_job_log(&self, id: &str, entry: &LogEntry) -> Result<(), CoreError> {
        self.append_job_log_mirrored(id, entry)
            .await
            .map(Mirrored::into_inner)
    }

    async fn list_job_logs(&self, id: &str) -> Result<Vec<LogEntry>, CoreError> {
        self.primary.list_job_logs(id).await
    }

    async fn aggregate_jobs(&self, spec: &JobAggregate) -> Result<Vec<AggregateRow>, CoreError> {
        self.primary.aggregate_jobs(spec).await
    }

    async fn purge_job_logs(&self, before: DateTime<Utc>) -> Result<u64, CoreError> {
        self.purge_job_logs_mirrored(before)
            .await
            .map(Mirrored::into_inner)
    }

    async fn purge_terminal_jobs(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        self.purge_terminal_jobs_mirrored(before, limit)
            .await
            .map(Mirrored::into_inner)
    }
}

#[async_trait::async_trait]
impl QuotaRepository for PersistenceManager {
    async fn get_limit(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
    ) -> Result<Option<QuotaLimitRecord>, CoreError> {
        self.primary.get_limit(organization_id, resource_type).await
    }

    async fn insert_limit_if_absent(
        &self,
        limit: &QuotaLimitRecord,
    ) -> Result<QuotaLimitRecord, CoreError> {
        self.insert_limit_if_absent_mirrored(limit)
            .await
            .map(Mirrored::into_inner)
    }

    async fn upsert_limit(&self, limit: &QuotaLimitRecord) -> Result<(), CoreError> {
        self.upsert_limit_mirrored(limit)
            .await
            .map(Mirrored::into_inner)
    }

    async fn list_limits(
        &self,
        organization_id: &str,
    ) -> Result<Vec<QuotaLimitRecord>, CoreError> {
        self.primary.list_limits(organization_id).await
    }

    async fn get_usage(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
        period_start: DateTime<Utc>,
    ) -> Result<Option<QuotaUsageRecord>, CoreError> {
        self.primary
            .get_usage(organization_id, resource_type, period_start)
            .await
    }

    async fn increment_usage(&self, increment: &UsageIncrement) -> Result<i64, CoreError> {
        self.increment_usage_mirrored(increment)
            .await
            .map(Mirrored::into_inner)
    }

    async fn record_violation(&self, violation: &NewQuotaViolation) -> Result<(), CoreError> {
        self.record_violation_mirrored(violation)
            .await
            .map(Mirrored::into_inner)
    }

    async fn list_violations(
        &self,
        organization_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<QuotaViolationRecord>, CoreError> {
        self.primary.list_violations(organization_id, since).await
    }
}

#[async_trait::async_trait]
impl StoreHealth for PersistenceManager {
    fn backend(&self) -> BackendKind {
        self.primary.backend()
    }

    async fn health_check(&self) -> Result<HealthReport, CoreError> {
        self.primary.health_check().await
    }
}
