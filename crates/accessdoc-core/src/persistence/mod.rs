// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence layer for accessdoc-core.
//!
//! One repository contract per entity ([`DocumentRepository`],
//! [`JobRepository`], [`QuotaRepository`]) plus [`StoreHealth`], implemented
//! by [`PostgresStore`] and [`SqliteStore`]. [`PersistenceManager`] routes
//! calls to the primary store and optionally mirrors mutations to a second
//! one while a backend migration is in progress.
//!
//! Identifiers and timestamps are generated by the caller (see
//! [`NewDocument`], [`NewJob`], [`DocumentStatusUpdate`],
//! [`JobStatusUpdate`]) so that a mirrored write produces the same row in
//! both stores.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::lifecycle::{
    DocumentStatus, JobStatus, JobTimeoutPolicy, LogEntry, PipelineStep, RetryPolicy,
};
use crate::quota::{QuotaWindow, ResourceType, Tier};

pub mod connect;
pub mod manager;
pub mod postgres;
pub mod sqlite;

pub use connect::{ConnectOptions, connect_postgres, connect_sqlite};
pub use manager::{MirrorOutcome, MirrorStats, Mirrored, PersistenceManager};
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Largest page a listing call may request.
pub const MAX_PAGE_SIZE: u32 = 200;

// ============================================================================
// Records
// ============================================================================

/// A document submitted for remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Unique document identifier.
    pub id: String,
    /// User that uploaded the document.
    pub owner_id: String,
    /// Organization the document is billed to.
    pub organization_id: String,
    /// Original file name.
    pub filename: String,
    /// Lifecycle status.
    pub status: DocumentStatus,
    /// When the document was ingested.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// When the document reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Artifact name to storage locator, filled in as steps finish.
    pub artifacts: BTreeMap<String, String>,
    /// Error message for failed documents.
    pub error: Option<String>,
    /// Free-form metadata supplied at ingestion.
    pub metadata: serde_json::Value,
}

impl DocumentRecord {
    /// Whether the uploader flagged the document as priority work.
    pub fn is_priority(&self) -> bool {
        self.metadata
            .get("priority")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Input for [`DocumentRepository::create_document`].
#[derive(Debug, Clone)]
pub struct NewDocument {
    /// Identifier to assign (a fresh UUID v4 by default).
    pub id: String,
    /// Uploading user.
    pub owner_id: String,
    /// Billing organization.
    pub organization_id: String,
    /// Original file name.
    pub filename: String,
    /// Free-form metadata.
    pub metadata: serde_json::Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl NewDocument {
    /// Describe a new pending document with an empty metadata object.
    pub fn new(
        owner_id: impl Into<String>,
        organization_id: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            organization_id: organization_id.into(),
            filename: filename.into(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    /// Use a caller-chosen identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Override the creation timestamp.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// The record as it reads back right after insertion.
    pub fn into_record(self) -> DocumentRecord {
        DocumentRecord {
            id: self.id,
            owner_id: self.owner_id,
            organization_id: self.organization_id,
            filename: self.filename,
            status: DocumentStatus::Pending,
            created_at: self.created_at,
            updated_at: self.created_at,
            completed_at: None,
            artifacts: BTreeMap::new(),
            error: None,
            metadata: self.metadata,
        }
    }
}

/// A single pipeline step executed for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job identifier.
    pub id: String,
    /// Document this job processes.
    pub document_id: String,
    /// Organization inherited from the document, used for quota attribution.
    pub organization_id: String,
    /// Pipeline step.
    pub step: PipelineStep,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Scheduling priority (higher runs first).
    pub priority: i32,
    /// Failed or timed-out attempts so far.
    pub attempts: i32,
    /// Upper bound for `attempts`.
    pub max_attempts: i32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// When a worker claimed the job.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job left `running`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Measured wall-clock execution time.
    pub execution_time_seconds: Option<f64>,
    /// Worker instance executing the job.
    pub worker_id: Option<String>,
    /// Last liveness signal from the worker.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Input references handed to the worker.
    pub input_refs: serde_json::Value,
    /// Artifact reference produced by the step.
    pub output_ref: Option<String>,
    /// Structured error payload.
    pub error: Option<serde_json::Value>,
    /// Why the job was terminated, if it was.
    pub termination_reason: Option<String>,
    /// Retry backoff policy.
    pub retry_policy: RetryPolicy,
    /// Execution budget.
    pub timeout_policy: JobTimeoutPolicy,
}

/// Input for [`JobRepository::create_job`].
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Identifier to assign (a fresh UUID v4 by default).
    pub id: String,
    /// Owning document.
    pub document_id: String,
    /// Organization inherited from the document.
    pub organization_id: String,
    /// Pipeline step.
    pub step: PipelineStep,
    /// Scheduling priority.
    pub priority: i32,
    /// Attempt ceiling.
    pub max_attempts: i32,
    /// Input references.
    pub input_refs: serde_json::Value,
    /// Retry policy.
    pub retry_policy: RetryPolicy,
    /// Timeout policy.
    pub timeout_policy: JobTimeoutPolicy,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Priority given to jobs of documents flagged `priority`.
pub const PRIORITY_BOOST: i32 = 10;

/// Default attempt ceiling for new jobs.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

impl NewJob {
    /// Describe a job for `step` of `document`, inheriting its organization.
    pub fn for_document(document: &DocumentRecord, step: PipelineStep) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            document_id: document.id.clone(),
            organization_id: document.organization_id.clone(),
            step,
            priority: if document.is_priority() {
                PRIORITY_BOOST
            } else {
                0
            },
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            input_refs: serde_json::json!({}),
            retry_policy: RetryPolicy::default(),
            timeout_policy: JobTimeoutPolicy::default(),
            created_at: Utc::now(),
        }
    }

    /// Use a caller-chosen identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the input references.
    pub fn with_input_refs(mut self, input_refs: serde_json::Value) -> Self {
        self.input_refs = input_refs;
        self
    }

    /// Set the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the timeout policy.
    pub fn with_timeout_policy(mut self, policy: JobTimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Override the creation timestamp.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Reject shapes the store would refuse anyway.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts < 1 {
            return Err(CoreError::validation(
                "max_attempts",
                "must be at least 1",
            ));
        }
        if self.timeout_policy.execution_timeout_secs <= 0 {
            return Err(CoreError::validation(
                "execution_timeout_secs",
                "must be positive",
            ));
        }
        Ok(())
    }

    /// The record as it reads back right after insertion.
    pub fn into_record(self) -> JobRecord {
        JobRecord {
            id: self.id,
            document_id: self.document_id,
            organization_id: self.organization_id,
            step: self.step,
            status: JobStatus::Pending,
            priority: self.priority,
            attempts: 0,
            max_attempts: self.max_attempts,
            created_at: self.created_at,
            updated_at: self.created_at,
            started_at: None,
            completed_at: None,
            execution_time_seconds: None,
            worker_id: None,
            last_heartbeat: None,
            input_refs: self.input_refs,
            output_ref: None,
            error: None,
            termination_reason: None,
            retry_policy: self.retry_policy,
            timeout_policy: self.timeout_policy,
        }
    }
}

/// Status change for a document.
#[derive(Debug, Clone)]
pub struct DocumentStatusUpdate {
    /// Target status; applied only from one of its predecessors.
    pub status: DocumentStatus,
    /// Error message to record.
    pub error: Option<String>,
    /// Completion time (defaults to `updated_at` for terminal statuses).
    pub completed_at: Option<DateTime<Utc>>,
    /// Artifacts to upsert alongside the status change.
    pub artifacts: BTreeMap<String, String>,
    /// Replacement metadata.
    pub metadata: Option<serde_json::Value>,
    /// Modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl DocumentStatusUpdate {
    /// Move to `status` now.
    pub fn new(status: DocumentStatus) -> Self {
        Self::at(status, Utc::now())
    }

    /// Move to `status` at `now`.
    pub fn at(status: DocumentStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            error: None,
            completed_at: status.is_terminal().then_some(now),
            artifacts: BTreeMap::new(),
            metadata: None,
            updated_at: now,
        }
    }

    /// Record an error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Upsert an artifact.
    pub fn with_artifact(mut self, name: impl Into<String>, locator: impl Into<String>) -> Self {
        self.artifacts.insert(name.into(), locator.into());
        self
    }

    /// Replace metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Status change for a job.
#[derive(Debug, Clone)]
pub struct JobStatusUpdate {
    /// Target status; applied only from one of its predecessors.
    pub status: JobStatus,
    /// Structured error payload.
    pub error: Option<serde_json::Value>,
    /// Termination reason code.
    pub termination_reason: Option<String>,
    /// Output artifact reference.
    pub output_ref: Option<String>,
    /// Measured execution time.
    pub execution_time_seconds: Option<f64>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Increment `attempts` (capped at `max_attempts`).
    pub increment_attempts: bool,
    /// Clear worker identity and execution timestamps (re-admission).
    pub reset_execution: bool,
    /// Modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl JobStatusUpdate {
    fn base(status: JobStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            error: None,
            termination_reason: None,
            output_ref: None,
            execution_time_seconds: None,
            completed_at: None,
            increment_attempts: false,
            reset_execution: false,
            updated_at: now,
        }
    }

    /// `running -> completed` with the produced artifact.
    pub fn completed(job: &JobRecord, output_ref: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            output_ref,
            execution_time_seconds: Some(elapsed_seconds(job.started_at, now)),
            completed_at: Some(now),
            ..Self::base(JobStatus::Completed, now)
        }
    }

    /// `running -> failed`, or `running -> retry` while attempts remain and
    /// the job's retry policy allows it.
    pub fn failure(job: &JobRecord, error: serde_json::Value, now: DateTime<Utc>) -> Self {
        let attempts_after = (job.attempts + 1).min(job.max_attempts);
        let status = if job.retry_policy.enabled && attempts_after < job.max_attempts {
            JobStatus::Retry
        } else {
            JobStatus::Failed
        };
        Self {
            error: Some(error),
            execution_time_seconds: Some(elapsed_seconds(job.started_at, now)),
            completed_at: Some(now),
            increment_attempts: true,
            ..Self::base(status, now)
        }
    }

    /// `running -> retry | timeout` decided by the timeout enforcer.
    pub fn timed_out(
        retry: bool,
        reason: impl Into<String>,
        payload: serde_json::Value,
        execution_time_seconds: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let status = if retry {
            JobStatus::Retry
        } else {
            JobStatus::Timeout
        };
        Self {
            error: Some(payload),
            termination_reason: Some(reason.into()),
            execution_time_seconds: Some(execution_time_seconds),
            completed_at: Some(now),
            increment_attempts: true,
            ..Self::base(status, now)
        }
    }

    /// `retry -> pending` re-admission. Clears the previous run's worker,
    /// timings, outcome and termination reason.
    pub fn requeue(now: DateTime<Utc>) -> Self {
        Self {
            reset_execution: true,
            ..Self::base(JobStatus::Pending, now)
        }
    }
}

/// Seconds between `started_at` and `now`, zero when never started.
pub fn elapsed_seconds(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    started_at
        .map(|started| (now - started).num_milliseconds().max(0) as f64 / 1000.0)
        .unwrap_or(0.0)
}

// ============================================================================
// Listing and aggregation
// ============================================================================

/// Sort order for listings, by creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Most recent first.
    #[default]
    NewestFirst,
    /// Oldest first.
    OldestFirst,
}

impl SortOrder {
    /// SQL direction keyword.
    pub fn sql(&self) -> &'static str {
        match self {
            Self::NewestFirst => "DESC",
            Self::OldestFirst => "ASC",
        }
    }
}

/// Paginated listing request.
#[derive(Debug, Clone)]
pub struct ListQuery<S> {
    /// Optional status filter.
    pub status: Option<S>,
    /// 1-based page number.
    pub page: u32,
    /// Items per page, at most [`MAX_PAGE_SIZE`].
    pub page_size: u32,
    /// Sort order.
    pub sort: SortOrder,
}

impl<S> Default for ListQuery<S> {
    fn default() -> Self {
        Self {
            status: None,
            page: 1,
            page_size: 50,
            sort: SortOrder::default(),
        }
    }
}

impl<S> ListQuery<S> {
    /// Filter by status.
    pub fn with_status(mut self, status: S) -> Self {
        self.status = Some(status);
        self
    }

    /// Select a page.
    pub fn page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    /// Choose the sort order.
    pub fn sorted(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    /// Check page bounds.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.page == 0 {
            return Err(CoreError::validation("page", "pages are 1-based"));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(CoreError::validation(
                "page_size",
                format!("must be between 1 and {}", MAX_PAGE_SIZE),
            ));
        }
        Ok(())
    }

    /// SQL `LIMIT`.
    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }

    /// SQL `OFFSET`.
    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.page_size)
    }
}

/// One page of results.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Total matching items across all pages.
    pub total: i64,
    /// 1-based page number.
    pub page: u32,
    /// Requested page size.
    pub page_size: u32,
    /// Whether later pages exist.
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Build a page for `query`.
    pub fn new<S>(items: Vec<T>, total: i64, query: &ListQuery<S>) -> Self {
        let has_more = query.offset() + (items.len() as i64) < total;
        Self {
            items,
            total,
            page: query.page,
            page_size: query.page_size,
            has_more,
        }
    }
}

/// Extra filters for [`JobRepository::list_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Restrict to an organization.
    pub organization_id: Option<String>,
    /// Restrict to a document.
    pub document_id: Option<String>,
    /// Restrict to a step.
    pub step: Option<PipelineStep>,
}

/// Grouping column for document aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentGroupBy {
    /// Group by lifecycle status.
    Status,
    /// Group by organization.
    Organization,
    /// Group by owner.
    Owner,
}

impl DocumentGroupBy {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Organization => "organization_id",
            Self::Owner => "owner_id",
        }
    }
}

/// Group/count request over documents. `average` is the mean processing
/// time in seconds of completed documents in each group.
#[derive(Debug, Clone)]
pub struct DocumentAggregate {
    /// Grouping column.
    pub group_by: DocumentGroupBy,
    /// Restrict to an organization.
    pub organization_id: Option<String>,
    /// Restrict to documents created at or after this time.
    pub since: Option<DateTime<Utc>>,
}

/// Grouping column for job aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobGroupBy {
    /// Group by pipeline step.
    Step,
    /// Group by lifecycle status.
    Status,
    /// Group by termination reason (`none` when absent).
    TerminationReason,
    /// Group by organization.
    Organization,
}

impl JobGroupBy {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Step => "step",
            Self::Status => "status",
            Self::TerminationReason => "COALESCE(termination_reason, 'none')",
            Self::Organization => "organization_id",
        }
    }
}

/// Group/count/average request over jobs. `average` is the mean
/// `execution_time_seconds` in each group.
#[derive(Debug, Clone)]
pub struct JobAggregate {
    /// Grouping column.
    pub group_by: JobGroupBy,
    /// Restrict to these statuses (all when empty).
    pub statuses: Vec<JobStatus>,
    /// Restrict to jobs that have a termination reason.
    pub terminated_only: bool,
    /// Restrict to an organization.
    pub organization_id: Option<String>,
    /// Restrict to jobs updated at or after this time.
    pub since: Option<DateTime<Utc>>,
}

impl JobAggregate {
    /// Aggregate every job, grouped by `group_by`.
    pub fn by(group_by: JobGroupBy) -> Self {
        Self {
            group_by,
            statuses: Vec::new(),
            terminated_only: false,
            organization_id: None,
            since: None,
        }
    }
}

/// One aggregation group.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct AggregateRow {
    /// Group key.
    pub key: String,
    /// Rows in the group.
    pub count: i64,
    /// Mean of the aggregated measure, when defined.
    pub average: Option<f64>,
}

// ============================================================================
// Quota records
// ============================================================================

/// Per-organization ceiling for one resource type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaLimitRecord {
    /// Organization.
    pub organization_id: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Tier the limit was derived from.
    pub tier: Tier,
    /// Ceiling, `-1` for unlimited.
    pub limit_value: i64,
    /// Whether an administrator set the value explicitly.
    pub overridden: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Usage counter for one (organization, resource, period).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsageRecord {
    /// Organization.
    pub organization_id: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Counting window.
    pub window: QuotaWindow,
    /// Accumulated usage, never negative.
    pub current_usage: i64,
    /// Last increment.
    pub updated_at: DateTime<Utc>,
}

/// Atomic increment of a usage counter.
#[derive(Debug, Clone)]
pub struct UsageIncrement {
    /// Organization.
    pub organization_id: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Window the increment lands in.
    pub window: QuotaWindow,
    /// Units to add (positive).
    pub amount: i64,
    /// Increment time.
    pub at: DateTime<Utc>,
}

/// Audit record of a rejected admission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewQuotaViolation {
    /// Organization.
    pub organization_id: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Usage at decision time.
    pub current_usage: i64,
    /// Limit at decision time.
    pub limit_value: i64,
    /// Units that were requested.
    pub requested: i64,
    /// `current + requested - limit`.
    pub exceeded_by: i64,
    /// Service that made the check.
    pub service: String,
    /// Decision time.
    pub occurred_at: DateTime<Utc>,
}

/// Stored quota violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaViolationRecord {
    /// Row identifier (backend-local).
    pub id: i64,
    /// Violation details.
    #[serde(flatten)]
    pub violation: NewQuotaViolation,
}

// ============================================================================
// Health
// ============================================================================

/// Storage backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// PostgreSQL.
    Postgres,
    /// SQLite.
    Sqlite,
}

impl BackendKind {
    /// Name used in configuration and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    /// The other backend.
    pub fn other(&self) -> Self {
        match self {
            Self::Postgres => Self::Sqlite,
            Self::Sqlite => Self::Postgres,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness plus basic size and latency statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Backend kind.
    pub backend: BackendKind,
    /// Whether the store answered a trivial query.
    pub healthy: bool,
    /// Round-trip latency of the liveness query.
    pub latency_ms: u64,
    /// Stored documents.
    pub documents: i64,
    /// Stored jobs.
    pub jobs: i64,
}

// ============================================================================
// Repository traits
// ============================================================================

/// Document storage operations.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Insert a document. Fails with [`CoreError::AlreadyExists`] on a
    /// duplicate id.
    async fn create_document(&self, new: NewDocument) -> Result<DocumentRecord, CoreError>;

    /// Fetch a document with its artifacts.
    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>, CoreError>;

    /// List an owner's documents.
    async fn list_documents_by_owner(
        &self,
        owner_id: &str,
        query: &ListQuery<DocumentStatus>,
    ) -> Result<Page<DocumentRecord>, CoreError>;

    /// Apply a status change if the document currently holds a legal
    /// predecessor status. Returns whether the change applied.
    async fn update_document_status(
        &self,
        id: &str,
        update: &DocumentStatusUpdate,
    ) -> Result<bool, CoreError>;

    /// Upsert one artifact locator. Returns false for unknown documents.
    async fn set_document_artifact(
        &self,
        id: &str,
        name: &str,
        locator: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Group/count/average over a filtered set of documents.
    async fn aggregate_documents(
        &self,
        spec: &DocumentAggregate,
    ) -> Result<Vec<AggregateRow>, CoreError>;

    /// Delete up to `limit` terminal documents completed before `before`.
    async fn purge_terminal_documents(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError>;
}

/// Job storage operations.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a job. Fails with [`CoreError::AlreadyExists`] on a duplicate id.
    async fn create_job(&self, new: NewJob) -> Result<JobRecord, CoreError>;

    /// Fetch a job.
    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, CoreError>;

    /// All jobs of a document, in pipeline order.
    async fn list_jobs_by_document(&self, document_id: &str) -> Result<Vec<JobRecord>, CoreError>;

    /// Filtered, paginated listing.
    async fn list_jobs(
        &self,
        filter: &JobFilter,
        query: &ListQuery<JobStatus>,
    ) -> Result<Page<JobRecord>, CoreError>;

    /// Jobs currently in `status`, oldest first.
    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<JobRecord>, CoreError>;

    /// Pending plus running jobs of an organization.
    async fn count_active_jobs(&self, organization_id: &str) -> Result<i64, CoreError>;

    /// `pending -> running` for `worker_id`. Returns whether the claim won.
    async fn claim_job(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Record a heartbeat for a running job. Never changes status.
    async fn set_heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Apply a status change if the job currently holds a legal predecessor
    /// status. Returns whether the change applied.
    async fn update_job_status(&self, id: &str, update: &JobStatusUpdate)
    -> Result<bool, CoreError>;

    /// Append a structured log entry.
    async fn append_job_log(&self, id: &str, entry: &LogEntry) -> Result<(), CoreError>;

    /// Log entries of a job, oldest first.
    async fn list_job_logs(&self, id: &str) -> Result<Vec<LogEntry>, CoreError>;

    /// Group/count/average over a filtered set of jobs.
    async fn aggregate_jobs(&self, spec: &JobAggregate) -> Result<Vec<AggregateRow>, CoreError>;

    /// Delete log entries written before `before`.
    async fn purge_job_logs(&self, before: DateTime<Utc>) -> Result<u64, CoreError>;

    /// Delete up to `limit` terminal jobs completed before `before`.
    async fn purge_terminal_jobs(&self, before: DateTime<Utc>, limit: i64)
    -> Result<u64, CoreError>;
}

/// Quota storage operations.
#[async_trait]
pub trait QuotaRepository: Send + Sync {
    /// Stored limit, if any.
    async fn get_limit(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
    ) -> Result<Option<QuotaLimitRecord>, CoreError>;

    /// Insert `limit` unless a row already exists; returns the stored row.
    async fn insert_limit_if_absent(
        &self,
        limit: &QuotaLimitRecord,
    ) -> Result<QuotaLimitRecord, CoreError>;

    /// Insert or replace a limit.
    async fn upsert_limit(&self, limit: &QuotaLimitRecord) -> Result<(), CoreError>;

    /// All stored limits of an organization.
    async fn list_limits(&self, organization_id: &str)
    -> Result<Vec<QuotaLimitRecord>, CoreError>;

    /// Usage row for the window starting at `period_start`.
    async fn get_usage(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
        period_start: DateTime<Utc>,
    ) -> Result<Option<QuotaUsageRecord>, CoreError>;

    /// Atomically add to the counter, creating it on first use. Returns the
    /// new value.
    async fn increment_usage(&self, increment: &UsageIncrement) -> Result<i64, CoreError>;

    /// Persist a violation audit row.
    async fn record_violation(&self, violation: &NewQuotaViolation) -> Result<(), CoreError>;

    /// Violations of an organization at or after `since`, newest first.
    async fn list_violations(
        &self,
        organization_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<QuotaViolationRecord>, CoreError>;
}

/// Liveness and statistics.
#[async_trait]
pub trait StoreHealth: Send + Sync {
    /// Backend kind.
    fn backend(&self) -> BackendKind;

    /// Probe the store. A failed probe is reported as unhealthy, not as an
    /// error.
    async fn health_check(&self) -> Result<HealthReport, CoreError>;
}

/// Everything a storage backend provides.
pub trait Store: DocumentRepository + JobRepository + QuotaRepository + StoreHealth {}

impl<T> Store for T where T: DocumentRepository + JobRepository + QuotaRepository + StoreHealth {}

// ============================================================================
// Row mapping shared by both backends
// ============================================================================

#[derive(sqlx::FromRow)]
pub(crate) struct DocumentRow {
    pub id: String,
    pub owner_id: String,
    pub organization_id: String,
    pub filename: String,
    pub status: String,
    pub error: Option<String>,
    pub metadata: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct ArtifactRow {
    pub document_id: String,
    pub name: String,
    pub locator: String,
}

#[derive(sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub document_id: String,
    pub organization_id: String,
    pub step: String,
    pub status: String,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub worker_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub input_refs: String,
    pub output_ref: Option<String>,
    pub error: Option<String>,
    pub termination_reason: Option<String>,
    pub execution_time_seconds: Option<f64>,
    pub retry_policy: String,
    pub execution_timeout_secs: i64,
    pub heartbeat_interval_secs: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct LogRow {
    pub level: String,
    pub message: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct LimitRow {
    pub organization_id: String,
    pub resource_type: String,
    pub tier: String,
    pub limit_value: i64,
    pub overridden: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct UsageRow {
    pub organization_id: String,
    pub resource_type: String,
    pub period: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub current_usage: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub(crate) struct ViolationRow {
    pub id: i64,
    pub organization_id: String,
    pub resource_type: String,
    pub current_usage: i64,
    pub limit_value: i64,
    pub requested: i64,
    pub exceeded_by: i64,
    pub service: String,
    pub occurred_at: DateTime<Utc>,
}

/// Column list matching [`DocumentRow`].
pub(crate) const DOCUMENT_COLUMNS: &str = "id, owner_id, organization_id, filename, status, error, metadata, \
     created_at, updated_at, completed_at";

/// Column list matching [`JobRow`].
pub(crate) const JOB_COLUMNS: &str = "id, document_id, organization_id, step, status, priority, attempts, \
     max_attempts, worker_id, last_heartbeat, input_refs, output_ref, error, termination_reason, \
     execution_time_seconds, retry_policy, execution_timeout_secs, heartbeat_interval_secs, \
     created_at, updated_at, started_at, completed_at";

/// Quoted, comma-separated status literals for `IN (...)` clauses.
pub(crate) fn status_list<I, S>(statuses: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    statuses
        .into_iter()
        .map(|s| format!("'{}'", s.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn job_predecessors(status: JobStatus) -> String {
    status_list(status.predecessors().iter().map(|s| s.as_str()))
}

pub(crate) fn document_predecessors(status: DocumentStatus) -> String {
    status_list(status.predecessors().iter().map(|s| s.as_str()))
}

/// Attach artifacts to their documents, preserving row order.
pub(crate) fn assemble_documents(
    rows: Vec<DocumentRow>,
    artifacts: Vec<ArtifactRow>,
) -> Result<Vec<DocumentRecord>, CoreError> {
    let mut by_document: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for artifact in artifacts {
        by_document
            .entry(artifact.document_id)
            .or_default()
            .insert(artifact.name, artifact.locator);
    }

    rows.into_iter()
        .map(|row| {
            let artifacts = by_document.remove(&row.id).unwrap_or_default();
            document_from_row(row, artifacts)
        })
        .collect()
}

pub(crate) fn document_from_row(
    row: DocumentRow,
    artifacts: BTreeMap<String, String>,
) -> Result<DocumentRecord, CoreError> {
    Ok(DocumentRecord {
        status: row.status.parse()?,
        metadata: serde_json::from_str(&row.metadata)?,
        id: row.id,
        owner_id: row.owner_id,
        organization_id: row.organization_id,
        filename: row.filename,
        created_at: row.created_at,
        updated_at: row.updated_at,
        completed_at: row.completed_at,
        artifacts,
        error: row.error,
    })
}

impl TryFrom<JobRow> for JobRecord {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            step: row.step.parse()?,
            status: row.status.parse()?,
            input_refs: serde_json::from_str(&row.input_refs)?,
            error: row.error.as_deref().map(serde_json::from_str).transpose()?,
            retry_policy: serde_json::from_str(&row.retry_policy)?,
            timeout_policy: JobTimeoutPolicy {
                execution_timeout_secs: row.execution_timeout_secs,
                heartbeat_interval_secs: row.heartbeat_interval_secs,
            },
            id: row.id,
            document_id: row.document_id,
            organization_id: row.organization_id,
            priority: row.priority,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            execution_time_seconds: row.execution_time_seconds,
            worker_id: row.worker_id,
            last_heartbeat: row.last_heartbeat,
            output_ref: row.output_ref,
            termination_reason: row.termination_reason,
        })
    }
}

impl TryFrom<LogRow> for LogEntry {
    type Error = CoreError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        Ok(LogEntry {
            timestamp: row.created_at,
            level: row.level.parse()?,
            message: row.message,
            details: row.details.as_deref().map(serde_json::from_str).transpose()?,
        })
    }
}

impl TryFrom<LimitRow> for QuotaLimitRecord {
    type Error = CoreError;

    fn try_from(row: LimitRow) -> Result<Self, Self::Error> {
        Ok(QuotaLimitRecord {
            resource_type: row.resource_type.parse()?,
            tier: row.tier.parse()?,
            organization_id: row.organization_id,
            limit_value: row.limit_value,
            overridden: row.overridden,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<UsageRow> for QuotaUsageRecord {
    type Error = CoreError;

    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        Ok(QuotaUsageRecord {
            resource_type: row.resource_type.parse()?,
            window: QuotaWindow {
                kind: row.period.parse()?,
                start: row.period_start,
                end: row.period_end,
            },
            organization_id: row.organization_id,
            current_usage: row.current_usage,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<ViolationRow> for QuotaViolationRecord {
    type Error = CoreError;

    fn try_from(row: ViolationRow) -> Result<Self, Self::Error> {
        Ok(QuotaViolationRecord {
            id: row.id,
            violation: NewQuotaViolation {
                resource_type: row.resource_type.parse()?,
                organization_id: row.organization_id,
                current_usage: row.current_usage,
                limit_value: row.limit_value,
                requested: row.requested,
                exceeded_by: row.exceeded_by,
                service: row.service,
                occurred_at: row.occurred_at,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn document() -> DocumentRecord {
        NewDocument::new("user-1", "acme", "report.pdf")
            .with_metadata(serde_json::json!({"priority": true}))
            .into_record()
    }

    fn running_job(attempts: i32, max_attempts: i32) -> JobRecord {
        let started = Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap();
        let mut job = NewJob::for_document(&document(), PipelineStep::Ocr)
            .with_max_attempts(max_attempts)
            .into_record();
        job.status = JobStatus::Running;
        job.started_at = Some(started);
        job.attempts = attempts;
        job
    }

    #[test]
    fn test_job_inherits_document_organization_and_priority() {
        let doc = document();
        let job = NewJob::for_document(&doc, PipelineStep::Route);
        assert_eq!(job.organization_id, "acme");
        assert_eq!(job.document_id, doc.id);
        assert_eq!(job.priority, PRIORITY_BOOST);
    }

    #[test]
    fn test_failure_routes_to_retry_while_attempts_remain() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 10, 1, 30).unwrap();
        let update = JobStatusUpdate::failure(&running_job(0, 3), serde_json::json!({}), now);
        assert_eq!(update.status, JobStatus::Retry);
        assert!(update.increment_attempts);
        assert_eq!(update.execution_time_seconds, Some(90.0));

        let update = JobStatusUpdate::failure(&running_job(2, 3), serde_json::json!({}), now);
        assert_eq!(update.status, JobStatus::Failed);
    }

    #[test]
    fn test_failure_without_retry_policy_is_terminal() {
        let now = Utc::now();
        let mut job = running_job(0, 3);
        job.retry_policy.enabled = false;
        let update = JobStatusUpdate::failure(&job, serde_json::json!({}), now);
        assert_eq!(update.status, JobStatus::Failed);
    }

    #[test]
    fn test_terminal_document_update_sets_completion() {
        let now = Utc::now();
        let update = DocumentStatusUpdate::at(DocumentStatus::Completed, now);
        assert_eq!(update.completed_at, Some(now));
        let update = DocumentStatusUpdate::at(DocumentStatus::Processing, now);
        assert_eq!(update.completed_at, None);
    }

    #[test]
    fn test_list_query_bounds() {
        let query: ListQuery<JobStatus> = ListQuery::default().page(3, 20);
        assert_eq!(query.offset(), 40);
        assert_eq!(query.limit(), 20);
        assert!(query.validate().is_ok());

        let query: ListQuery<JobStatus> = ListQuery::default().page(0, 20);
        assert!(query.validate().is_err());
        let query: ListQuery<JobStatus> = ListQuery::default().page(1, MAX_PAGE_SIZE + 1);
        assert!(query.validate().is_err());
    }

    #[test]
    fn test_page_has_more() {
        let query: ListQuery<DocumentStatus> = ListQuery::default().page(1, 2);
        let page = Page::new(vec![1, 2], 5, &query);
        assert!(page.has_more);

        let query: ListQuery<DocumentStatus> = ListQuery::default().page(3, 2);
        let page = Page::new(vec![5], 5, &query);
        assert!(!page.has_more);
    }

    #[test]
    fn test_status_list_quoting() {
        assert_eq!(job_predecessors(JobStatus::Timeout), "'running'");
        assert_eq!(
            status_list(JobStatus::TERMINAL.iter().map(|s| s.as_str())),
            "'completed', 'failed', 'timeout'"
        );
    }
}
