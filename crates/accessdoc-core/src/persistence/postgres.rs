// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store.
//!
//! Storage functions take a `&PgPool` so they can be reused from tooling;
//! [`PostgresStore`] exposes them through the repository traits.

use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::CoreError;
use crate::lifecycle::{DocumentStatus, JobStatus, LogEntry};
use crate::quota::ResourceType;

use super::{
    AggregateRow, ArtifactRow, BackendKind, DOCUMENT_COLUMNS, DocumentAggregate, DocumentRecord,
    DocumentRepository, DocumentRow, DocumentStatusUpdate, HealthReport, JOB_COLUMNS,
    JobAggregate, JobFilter, JobRecord, JobRepository, JobRow, JobStatusUpdate, LimitRow,
    ListQuery, LogRow, NewDocument, NewJob, NewQuotaViolation, Page, QuotaLimitRecord,
    QuotaRepository, QuotaUsageRecord, QuotaViolationRecord, StoreHealth, UsageIncrement,
    UsageRow, ViolationRow, assemble_documents, document_predecessors, job_predecessors,
    status_list,
};

/// PostgreSQL-backed store.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store from an existing, already migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Document Operations
// ============================================================================

/// Insert a document.
pub async fn create_document(pool: &PgPool, new: NewDocument) -> Result<DocumentRecord, CoreError> {
    let metadata = serde_json::to_string(&new.metadata)?;

    sqlx::query(
        r#"
        INSERT INTO documents (id, owner_id, organization_id, filename, status, metadata, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 'pending', $5, $6, $6)
        "#,
    )
    .bind(&new.id)
    .bind(&new.owner_id)
    .bind(&new.organization_id)
    .bind(&new.filename)
    .bind(metadata)
    .bind(new.created_at)
    .execute(pool)
    .await
    .map_err(|e| CoreError::from_insert(e, "document", &new.id))?;

    Ok(new.into_record())
}

async fn load_artifacts(pool: &PgPool, ids: &[String]) -> Result<Vec<ArtifactRow>, CoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query_as::<_, ArtifactRow>(
        r#"
        SELECT document_id, name, locator
        FROM document_artifacts
        WHERE document_id = ANY($1)
        ORDER BY document_id, name
        "#,
    )
    .bind(ids)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Fetch a document with its artifacts.
pub async fn get_document(pool: &PgPool, id: &str) -> Result<Option<DocumentRecord>, CoreError> {
    let row = sqlx::query_as::<_, DocumentRow>(&format!(
        "SELECT {} FROM documents WHERE id = $1",
        DOCUMENT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let artifacts = load_artifacts(pool, &[row.id.clone()]).await?;
    Ok(assemble_documents(vec![row], artifacts)?.pop())
}

/// List an owner's documents.
pub async fn list_documents_by_owner(
    pool: &PgPool,
    owner_id: &str,
    query: &ListQuery<DocumentStatus>,
) -> Result<Page<DocumentRecord>, CoreError> {
    query.validate()?;

    let mut count: QueryBuilder<'_, Postgres> =
        QueryBuilder::new("SELECT COUNT(*) FROM documents WHERE owner_id = ");
    count.push_bind(owner_id);
    if let Some(status) = query.status {
        count.push(" AND status = ").push_bind(status.as_str());
    }
    let (total,): (i64,) = count.build_query_as().fetch_one(pool).await?;

    let mut items: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
        "SELECT {} FROM documents WHERE owner_id = ",
        DOCUMENT_COLUMNS
    ));
    items.push_bind(owner_id);
    if let Some(status) = query.status {
        items.push(" AND status = ").push_bind(status.as_str());
    }
    items.push(format!(
        " ORDER BY created_at {dir}, id {dir} LIMIT ",
        dir = query.sort.sql()
    ));
    items.push_bind(query.limit());
    items.push(" OFFSET ");
    items.push_bind(query.offset());

    let rows = items.build_query_as::<DocumentRow>().fetch_all(pool).await?;

    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let artifacts = load_artifacts(pool, &ids).await?;
    let documents = assemble_documents(rows, artifacts)?;

    Ok(Page::new(documents, total, query))
}

/// Apply a guarded document status change.
pub async fn update_document_status(
    pool: &PgPool,
    id: &str,
    update: &DocumentStatusUpdate,
) -> Result<bool, CoreError> {
    if update.status.predecessors().is_empty() {
        return Ok(false);
    }

    let metadata = update
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let mut tx = pool.begin().await?;

    let result = sqlx::query(&format!(
        r#"
        UPDATE documents
        SET status = $1,
            error = COALESCE($2, error),
            completed_at = COALESCE($3, completed_at),
            metadata = COALESCE($4, metadata),
            updated_at = $5
        WHERE id = $6
          AND status IN ({})
        "#,
        document_predecessors(update.status)
    ))
    .bind(update.status.as_str())
    .bind(&update.error)
    .bind(update.completed_at)
    .bind(metadata)
    .bind(update.updated_at)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    for (name, locator) in &update.artifacts {
        upsert_artifact(&mut tx, id, name, locator, update.updated_at).await?;
    }

    tx.commit().await?;
    Ok(true)
}

async fn upsert_artifact(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    id: &str,
    name: &str,
    locator: &str,
    at: DateTime<Utc>,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO document_artifacts (document_id, name, locator, updated_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (document_id, name) DO UPDATE
        SET locator = EXCLUDED.locator,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(locator)
    .bind(at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Upsert one artifact locator.
pub async fn set_document_artifact(
    pool: &PgPool,
    id: &str,
    name: &str,
    locator: &str,
    at: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let mut tx = pool.begin().await?;

    let touched = sqlx::query("UPDATE documents SET updated_at = $1 WHERE id = $2")
        .bind(at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

    if touched.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    upsert_artifact(&mut tx, id, name, locator, at).await?;

    tx.commit().await?;
    Ok(true)
}

/// Group/count/average over documents.
pub async fn aggregate_documents(
    pool: &PgPool,
    spec: &DocumentAggregate,
) -> Result<Vec<AggregateRow>, CoreError> {
    let column = spec.group_by.column();
    let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
        r#"
        SELECT {column} AS key,
               COUNT(*) AS count,
               AVG(EXTRACT(EPOCH FROM (completed_at - created_at)))::DOUBLE PRECISION AS average
        FROM documents
        WHERE 1 = 1
        "#
    ));
    if let Some(org) = &spec.organization_id {
        builder.push(" AND organization_id = ").push_bind(org.as_str());
    }
    if let Some(since) = spec.since {
        builder.push(" AND created_at >= ").push_bind(since);
    }
    builder.push(" GROUP BY 1 ORDER BY 1");

    let rows = builder
        .build_query_as::<AggregateRow>()
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Delete terminal documents without unfinished jobs.
pub async fn purge_terminal_documents(
    pool: &PgPool,
    before: DateTime<Utc>,
    limit: i64,
) -> Result<u64, CoreError> {
    let result = sqlx::query(&format!(
        r#"
        DELETE FROM documents
        WHERE id IN (
            SELECT d.id FROM documents d
            WHERE d.status IN ({terminal})
              AND d.completed_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM jobs j
                  WHERE j.document_id = d.id
                    AND j.status NOT IN ({job_terminal})
              )
            ORDER BY d.completed_at
            LIMIT $2
        )
        "#,
        terminal = status_list(DocumentStatus::TERMINAL.iter().map(|s| s.as_str())),
        job_terminal = status_list(JobStatus::TERMINAL.iter().map(|s| s.as_str())),
    ))
    .bind(before)
    .bind(limit)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Job Operations
// ============================================================================

/// Insert a job.
pub async fn create_job(pool: &PgPool, new: NewJob) -> Result<JobRecord, CoreError> {
    new.validate()?;
    let input_refs = serde_json::to_string(&new.input_refs)?;
    let retry_policy = serde_json::to_string(&new.retry_policy)?;

    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, document_id, organization_id, step, status, priority, attempts, max_attempts,
            input_refs, retry_policy, execution_timeout_secs, heartbeat_interval_secs,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, 'pending', $5, 0, $6, $7, $8, $9, $10, $11, $11)
        "#,
    )
    .bind(&new.id)
    .bind(&new.document_id)
    .bind(&new.organization_id)
    .bind(new.step.as_str())
    .bind(new.priority)
    .bind(new.max_attempts)
    .bind(input_refs)
    .bind(retry_policy)
    .bind(new.timeout_policy.execution_timeout_secs)
    .bind(new.timeout_policy.heartbeat_interval_secs)
    .bind(new.created_at)
    .execute(pool)
    .await
    .map_err(|e| CoreError::from_insert(e, "job", &new.id))?;

    Ok(new.into_record())
}

/// Fetch a job.
pub async fn get_job(pool: &PgPool, id: &str) -> Result<Option<JobRecord>, CoreError> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {} FROM jobs WHERE id = $1",
        JOB_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(JobRecord::try_from).transpose()
}

/// Jobs of a document in pipeline order.
pub async fn list_jobs_by_document(
    pool: &PgPool,
    document_id: &str,
) -> Result<Vec<JobRecord>, CoreError> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {} FROM jobs WHERE document_id = $1 ORDER BY created_at, id",
        JOB_COLUMNS
    ))
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    let mut jobs = rows
        .into_iter()
        .map(JobRecord::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    jobs.sort_by_key(|job| (job.step.position(), job.created_at));
    Ok(jobs)
}

fn push_job_filters<'a>(
    builder: &mut QueryBuilder<'a, Postgres>,
    filter: &'a JobFilter,
    status: Option<JobStatus>,
) {
    if let Some(org) = &filter.organization_id {
        builder.push(" AND organization_id = ").push_bind(org.as_str());
    }
    if let Some(document_id) = &filter.document_id {
        builder
            .push(" AND document_id = ")
            .push_bind(document_id.as_str());
    }
    if let Some(step) = filter.step {
        builder.push(" AND step = ").push_bind(step.as_str());
    }
    if let Some(status) = status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
}

/// Filtered, paginated job listing.
pub async fn list_jobs(
    pool: &PgPool,
    filter: &JobFilter,
    query: &ListQuery<JobStatus>,
) -> Result<Page<JobRecord>, CoreError> {
    query.validate()?;

    let mut count: QueryBuilder<'_, Postgres> =
        QueryBuilder::new("SELECT COUNT(*) FROM jobs WHERE 1 = 1");
    push_job_filters(&mut count, filter, query.status);
    let (total,): (i64,) = count.build_query_as().fetch_one(pool).await?;

    let mut items: QueryBuilder<'_, Postgres> =
        QueryBuilder::new(format!("SELECT {} FROM jobs WHERE 1 = 1", JOB_COLUMNS));
    push_job_filters(&mut items, filter, query.status);
    items.push(format!(
        " ORDER BY created_at {dir}, id {dir} LIMIT ",
        dir = query.sort.sql()
    ));
    items.push_bind(query.limit());
    items.push(" OFFSET ");
    items.push_bind(query.offset());

    let jobs = items
        .build_query_as::<JobRow>()
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(JobRecord::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Page::new(jobs, total, query))
}

/// Jobs in `status`, oldest first.
pub async fn list_jobs_by_status(
    pool: &PgPool,
    status: JobStatus,
    limit: i64,
) -> Result<Vec<JobRecord>, CoreError> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {} FROM jobs WHERE status = $1 ORDER BY created_at, id LIMIT $2",
        JOB_COLUMNS
    ))
    .bind(status.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(JobRecord::try_from).collect()
}

/// Pending plus running jobs of an organization.
pub async fn count_active_jobs(pool: &PgPool, organization_id: &str) -> Result<i64, CoreError> {
    let row: (i64,) = sqlx::query_as(&format!(
        r#"
        SELECT COUNT(*)
        FROM jobs
        WHERE organization_id = $1
          AND status IN ({})
        "#,
        status_list(JobStatus::ACTIVE.iter().map(|s| s.as_str()))
    ))
    .bind(organization_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Claim a pending job.
pub async fn claim_job(
    pool: &PgPool,
    id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'running',
            worker_id = $1,
            started_at = $2,
            last_heartbeat = NULL,
            completed_at = NULL,
            updated_at = $2
        WHERE id = $3
          AND status = 'pending'
        "#,
    )
    .bind(worker_id)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Record a heartbeat.
pub async fn set_heartbeat(
    pool: &PgPool,
    id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET last_heartbeat = $1,
            worker_id = $2,
            updated_at = $1
        WHERE id = $3
          AND status = 'running'
        "#,
    )
    .bind(now)
    .bind(worker_id)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Apply a guarded job status change.
pub async fn update_job_status(
    pool: &PgPool,
    id: &str,
    update: &JobStatusUpdate,
) -> Result<bool, CoreError> {
    let error = update
        .error
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let result = sqlx::query(&format!(
        r#"
        UPDATE jobs
        SET status = $1,
            error = CASE WHEN $8 THEN NULL ELSE COALESCE($2, error) END,
            termination_reason = CASE WHEN $8 THEN NULL ELSE COALESCE($3, termination_reason) END,
            output_ref = CASE WHEN $8 THEN NULL ELSE COALESCE($4, output_ref) END,
            execution_time_seconds = CASE WHEN $8 THEN NULL ELSE COALESCE($5, execution_time_seconds) END,
            completed_at = CASE WHEN $8 THEN NULL ELSE COALESCE($6, completed_at) END,
            attempts = CASE WHEN $7 THEN LEAST(attempts + 1, max_attempts) ELSE attempts END,
            worker_id = CASE WHEN $8 THEN NULL ELSE worker_id END,
            started_at = CASE WHEN $8 THEN NULL ELSE started_at END,
            last_heartbeat = CASE WHEN $8 THEN NULL ELSE last_heartbeat END,
            updated_at = $9
        WHERE id = $10
          AND status IN ({})
        "#,
        job_predecessors(update.status)
    ))
    .bind(update.status.as_str())
    .bind(error)
    .bind(&update.termination_reason)
    .bind(&update.output_ref)
    .bind(update.execution_time_seconds)
    .bind(update.completed_at)
    .bind(update.increment_attempts)
    .bind(update.reset_execution)
    .bind(update.updated_at)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Append a job log entry.
pub async fn append_job_log(pool: &PgPool, id: &str, entry: &LogEntry) -> Result<(), CoreError> {
    let details = entry
        .details
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO job_logs (job_id, level, message, details, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(entry.level.as_str())
    .bind(&entry.message)
    .bind(details)
    .bind(entry.timestamp)
    .execute(pool)
    .await
    .map_err(|e| CoreError::from_insert(e, "job_log", id))?;

    Ok(())
}

/// Log entries of a job, oldest first.
pub async fn list_job_logs(pool: &PgPool, id: &str) -> Result<Vec<LogEntry>, CoreError> {
    let rows = sqlx::query_as::<_, LogRow>(
        r#"
        SELECT level, message, details, created_at
        FROM job_logs
        WHERE job_id = $1
        ORDER BY id
        "#,
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(LogEntry::try_from).collect()
}

/// Group/count/average over jobs.
pub async fn aggregate_jobs(
    pool: &PgPool,
    spec: &JobAggregate,
) -> Result<Vec<AggregateRow>, CoreError> {
    let column = spec.group_by.column();
    let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
        r#"
        SELECT {column} AS key,
               COUNT(*) AS count,
               AVG(execution_time_seconds) AS average
        FROM jobs
        WHERE 1 = 1
        "#
    ));
    if !spec.statuses.is_empty() {
        builder.push(format!(
            " AND status IN ({})",
            status_list(spec.statuses.iter().map(|s| s.as_str()))
        ));
    }
    if spec.terminated_only {
        builder.push(" AND termination_reason IS NOT NULL");
    }
    if let Some(org) = &spec.organization_id {
        builder.push(" AND organization_id = ").push_bind(org.as_str());
    }
    if let Some(since) = spec.since {
        builder.push(" AND updated_at >= ").push_bind(since);
    }
    builder.push(" GROUP BY 1 ORDER BY 1");

    let rows = builder
        .build_query_as::<AggregateRow>()
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Delete old log entries.
pub async fn purge_job_logs(pool: &PgPool, before: DateTime<Utc>) -> Result<u64, CoreError> {
    let result = sqlx::query("DELETE FROM job_logs WHERE created_at < $1")
        .bind(before)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Delete old terminal jobs.
pub async fn purge_terminal_jobs(
    pool: &PgPool,
    before: DateTime<Utc>,
    limit: i64,
) -> Result<u64, CoreError> {
    let result = sqlx::query(&format!(
        r#"
        DELETE FROM jobs
        WHERE id IN (
            SELECT id FROM jobs
            WHERE status IN ({})
              AND completed_at < $1
            ORDER BY completed_at
            LIMIT $2
        )
        "#,
        status_list(JobStatus::TERMINAL.iter().map(|s| s.as_str()))
    ))
    .bind(before)
    .bind(limit)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Quota Operations
// ============================================================================

/// Stored limit for an organization and resource.
pub async fn get_limit(
    pool: &PgPool,
    organization_id: &str,
    resource_type: ResourceType,
) -> Result<Option<QuotaLimitRecord>, CoreError> {
    let row = sqlx::query_as::<_, LimitRow>(
        r#"
        SELECT organization_id, resource_type, tier, limit_value, overridden, created_at, updated_at
        FROM quota_limits
        WHERE organization_id = $1 AND resource_type = $2
        "#,
    )
    .bind(organization_id)
    .bind(resource_type.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(QuotaLimitRecord::try_from).transpose()
}

/// Insert a limit unless one exists, returning the stored row.
pub async fn insert_limit_if_absent(
    pool: &PgPool,
    limit: &QuotaLimitRecord,
) -> Result<QuotaLimitRecord, CoreError> {
    sqlx::query(
        r#"
        INSERT INTO quota_limits (organization_id, resource_type, tier, limit_value, overridden, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (organization_id, resource_type) DO NOTHING
        "#,
    )
    .bind(&limit.organization_id)
    .bind(limit.resource_type.as_str())
    .bind(limit.tier.as_str())
    .bind(limit.limit_value)
    .bind(limit.overridden)
    .bind(limit.created_at)
    .bind(limit.updated_at)
    .execute(pool)
    .await?;

    get_limit(pool, &limit.organization_id, limit.resource_type)
        .await?
        .ok_or_else(|| CoreError::DatabaseError {
            operation: "insert_limit".to_string(),
            details: format!(
                "limit for '{}'/{} vanished after insert",
                limit.organization_id, limit.resource_type
            ),
        })
}

/// Insert or replace a limit.
pub async fn upsert_limit(pool: &PgPool, limit: &QuotaLimitRecord) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO quota_limits (organization_id, resource_type, tier, limit_value, overridden, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (organization_id, resource_type) DO UPDATE
        SET tier = EXCLUDED.tier,
            limit_value = EXCLUDED.limit_value,
            overridden = EXCLUDED.overridden,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&limit.organization_id)
    .bind(limit.resource_type.as_str())
    .bind(limit.tier.as_str())
    .bind(limit.limit_value)
    .bind(limit.overridden)
    .bind(limit.created_at)
    .bind(limit.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// All limits of an organization.
pub async fn list_limits(
    pool: &PgPool,
    organization_id: &str,
) -> Result<Vec<QuotaLimitRecord>, CoreError> {
    let rows = sqlx::query_as::<_, LimitRow>(
        r#"
        SELECT organization_id, resource_type, tier, limit_value, overridden, created_at, updated_at
        FROM quota_limits
        WHERE organization_id = $1
        ORDER BY resource_type
        "#,
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(QuotaLimitRecord::try_from).collect()
}

/// Usage row for a window.
pub async fn get_usage(
    pool: &PgPool,
    organization_id: &str,
    resource_type: ResourceType,
    period_start: DateTime<Utc>,
) -> Result<Option<QuotaUsageRecord>, CoreError> {
    let row = sqlx::query_as::<_, UsageRow>(
        r#"
        SELECT organization_id, resource_type, period, period_start, period_end, current_usage, updated_at
        FROM quota_usage
        WHERE organization_id = $1 AND resource_type = $2 AND period_start = $3
        "#,
    )
    .bind(organization_id)
    .bind(resource_type.as_str())
    .bind(period_start)
    .fetch_optional(pool)
    .await?;

    row.map(QuotaUsageRecord::try_from).transpose()
}

/// Atomic upsert-increment of a usage counter.
///
/// The addition happens inside the `ON CONFLICT` clause, so simultaneous
/// increments never lose updates.
pub async fn increment_usage(pool: &PgPool, increment: &UsageIncrement) -> Result<i64, CoreError> {
    if increment.amount < 0 {
        return Err(CoreError::validation("amount", "must not be negative"));
    }

    let (usage,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO quota_usage (organization_id, resource_type, period, period_start, period_end, current_usage, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (organization_id, resource_type, period_start) DO UPDATE
        SET current_usage = quota_usage.current_usage + EXCLUDED.current_usage,
            updated_at = EXCLUDED.updated_at
        RETURNING current_usage
        "#,
    )
    .bind(&increment.organization_id)
    .bind(increment.resource_type.as_str())
    .bind(increment.window.kind.as_str())
    .bind(increment.window.start)
    .bind(increment.window.end)
    .bind(increment.amount)
    .bind(increment.at)
    .fetch_one(pool)
    .await?;

    Ok(usage)
}

/// Persist a violation audit row.
pub async fn record_violation(
    pool: &PgPool,
    violation: &NewQuotaViolation,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO quota_violations (
            organization_id, resource_type, current_usage, limit_value, requested,
            exceeded_by, service, occurred_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&violation.organization_id)
    .bind(violation.resource_type.as_str())
    .bind(violation.current_usage)
    .bind(violation.limit_value)
    .bind(violation.requested)
    .bind(violation.exceeded_by)
    .bind(&violation.service)
    .bind(violation.occurred_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Violations of an organization since a point in time.
pub async fn list_violations(
    pool: &PgPool,
    organization_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<QuotaViolationRecord>, CoreError> {
    let rows = sqlx::query_as::<_, ViolationRow>(
        r#"
        SELECT id, organization_id, resource_type, current_usage, limit_value, requested,
               exceeded_by, service, occurred_at
        FROM quota_violations
        WHERE organization_id = $1 AND occurred_at >= $2
        ORDER BY occurred_at DESC, id DESC
        "#,
    )
    .bind(organization_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(QuotaViolationRecord::try_from).collect()
}

// ============================================================================
// Trait implementation
// ============================================================================

#[async_trait::async_trait]
impl DocumentRepository for PostgresStore {
    async fn create_document(&self, new: NewDocument) -> Result<DocumentRecord, CoreError> {
        create_document(&self.pool, new).await
    }

    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>, CoreError> {
        get_document(&self.pool, id).await
    }

    async fn list_documents_by_owner(
        &self,
        owner_id: &str,
        query: &ListQuery<DocumentStatus>,
    ) -> Result<Page<DocumentRecord>, CoreError> {
        list_documents_by_owner(&self.pool, owner_id, query).await
    }

    async fn update_document_status(
        &self,
        id: &str,
        update: &DocumentStatusUpdate,
    ) -> Result<bool, CoreError> {
        update_document_status(&self.pool, id, update).await
    }

    async fn set_document_artifact(
        &self,
        id: &str,
        name: &str,
        locator: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        set_document_artifact(&self.pool, id, name, locator, at).await
    }

    async fn aggregate_documents(
        &self,
        spec: &DocumentAggregate,
    ) -> Result<Vec<AggregateRow>, CoreError> {
        aggregate_documents(&self.pool, spec).await
    }

    async fn purge_terminal_documents(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        purge_terminal_documents(&self.pool, before, limit).await
    }
}

#[async_trait::async_trait]
impl JobRepository for PostgresStore {
    async fn create_job(&self, new: NewJob) -> Result<JobRecord, CoreError> {
        create_job(&self.pool, new).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, CoreError> {
        get_job(&self.pool, id).await
    }

    async fn list_jobs_by_document(&self, document_id: &str) -> Result<Vec<JobRecord>, CoreError> {
        list_jobs_by_document(&self.pool, document_id).await
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        query: &ListQuery<JobStatus>,
    ) -> Result<Page<JobRecord>, CoreError> {
        list_jobs(&self.pool, filter, query).await
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<JobRecord>, CoreError> {
        list_jobs_by_status(&self.pool, status, limit).await
    }

    async fn count_active_jobs(&self, organization_id: &str) -> Result<i64, CoreError> {
        count_active_jobs(&self.pool, organization_id).await
    }

    async fn claim_job(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        claim_job(&self.pool, id, worker_id, now).await
    }

    async fn set_heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        set_heartbeat(&self.pool, id, worker_id, now).await
    }

    async fn update_job_status(
        &self,
        id: &str,
        update: &JobStatusUpdate,
    ) -> Result<bool, CoreError> {
        update_job_status(&self.pool, id, update).await
    }

    async fn append_job_log(&self, id: &str, entry: &LogEntry) -> Result<(), CoreError> {
        append_job_log(&self.pool, id, entry).await
    }

    async fn list_job_logs(&self, id: &str) -> Result<Vec<LogEntry>, CoreError> {
        list_job_logs(&self.pool, id).await
    }

    async fn aggregate_jobs(&self, spec: &JobAggregate) -> Result<Vec<AggregateRow>, CoreError> {
        aggregate_jobs(&self.pool, spec).await
    }

    async fn purge_job_logs(&self, before: DateTime<Utc>) -> Result<u64, CoreError> {
        purge_job_logs(&self.pool, before).await
    }

    async fn purge_terminal_jobs(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        purge_terminal_jobs(&self.pool, before, limit).await
    }
}

#[async_trait::async_trait]
impl QuotaRepository for PostgresStore {
    async fn get_limit(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
    ) -> Result<Option<QuotaLimitRecord>, CoreError> {
        get_limit(&self.pool, organization_id, resource_type).await
    }

    async fn insert_limit_if_absent(
        &self,
        limit: &QuotaLimitRecord,
    ) -> Result<QuotaLimitRecord, CoreError> {
        insert_limit_if_absent(&self.pool, limit).await
    }

    async fn upsert_limit(&self, limit: &QuotaLimitRecord) -> Result<(), CoreError> {
        upsert_limit(&self.pool, limit).await
    }

    async fn list_limits(
        &self,
        organization_id: &str,
    ) -> Result<Vec<QuotaLimitRecord>, CoreError> {
        list_limits(&self.pool, organization_id).await
    }

    async fn get_usage(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
        period_start: DateTime<Utc>,
    ) -> Result<Option<QuotaUsageRecord>, CoreError> {
        get_usage(&self.pool, organization_id, resource_type, period_start).await
    }

    async fn increment_usage(&self, increment: &UsageIncrement) -> Result<i64, CoreError> {
        increment_usage(&self.pool, increment).await
    }

    async fn record_violation(&self, violation: &NewQuotaViolation) -> Result<(), CoreError> {
        record_violation(&self.pool, violation).await
    }

    async fn list_violations(
        &self,
        organization_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<QuotaViolationRecord>, CoreError> {
        list_violations(&self.pool, organization_id, since).await
    }
}

#[async_trait::async_trait]
impl StoreHealth for PostgresStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn health_check(&self) -> Result<HealthReport, CoreError> {
        let started = Instant::now();
        let probe: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        if probe.is_err() {
            return Ok(HealthReport {
                backend: BackendKind::Postgres,
                healthy: false,
                latency_ms,
                documents: 0,
                jobs: 0,
            });
        }

        let (documents, jobs): (i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM documents), (SELECT COUNT(*) FROM jobs)",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(HealthReport {
            backend: BackendKind::Postgres,
            healthy: true,
            latency_ms,
            documents,
            jobs,
        })
    }
}
