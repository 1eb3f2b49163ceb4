// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store.

use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::CoreError;
use crate::lifecycle::{DocumentStatus, JobStatus, LogEntry};
use crate::migrations;
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

/// SQLite-backed store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database with migrations applied.
    ///
    /// Limited to one connection that never expires, since every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    async fn load_artifacts(&self, ids: &[String]) -> Result<Vec<ArtifactRow>, CoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT document_id, name, locator FROM document_artifacts WHERE document_id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(") ORDER BY document_id, name");

        let rows = builder
            .build_query_as::<ArtifactRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[async_trait::async_trait]
impl DocumentRepository for SqliteStore {
    async fn create_document(&self, new: NewDocument) -> Result<DocumentRecord, CoreError> {
        let metadata = serde_json::to_string(&new.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, owner_id, organization_id, filename, status, metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)
            "#,
        )
        .bind(&new.id)
        .bind(&new.owner_id)
        .bind(&new.organization_id)
        .bind(&new.filename)
        .bind(metadata)
        .bind(new.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::from_insert(e, "document", &new.id))?;

        Ok(new.into_record())
    }

    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>, CoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let artifacts = self.load_artifacts(&[row.id.clone()]).await?;
        Ok(assemble_documents(vec![row], artifacts)?.pop())
    }

    async fn list_documents_by_owner(
        &self,
        owner_id: &str,
        query: &ListQuery<DocumentStatus>,
    ) -> Result<Page<DocumentRecord>, CoreError> {
        query.validate()?;

        let mut count: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM documents WHERE owner_id = ");
        count.push_bind(owner_id);
        if let Some(status) = query.status {
            count.push(" AND status = ").push_bind(status.as_str());
        }
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await?;

        let mut items: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
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

        let rows = items
            .build_query_as::<DocumentRow>()
            .fetch_all(&self.pool)
            .await?;

        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let artifacts = self.load_artifacts(&ids).await?;
        let documents = assemble_documents(rows, artifacts)?;

        Ok(Page::new(documents, total, query))
    }

    async fn update_document_status(
        &self,
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

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(&format!(
            r#"
            UPDATE documents
            SET status = ?1,
                error = COALESCE(?2, error),
                completed_at = COALESCE(?3, completed_at),
                metadata = COALESCE(?4, metadata),
                updated_at = ?5
            WHERE id = ?6
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
            sqlx::query(
                r#"
                INSERT INTO document_artifacts (document_id, name, locator, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(document_id, name) DO UPDATE SET
                    locator = excluded.locator,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(id)
            .bind(name)
            .bind(locator)
            .bind(update.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn set_document_artifact(
        &self,
        id: &str,
        name: &str,
        locator: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query("UPDATE documents SET updated_at = ?1 WHERE id = ?2")
            .bind(at)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO document_artifacts (document_id, name, locator, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(document_id, name) DO UPDATE SET
                locator = excluded.locator,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(locator)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn aggregate_documents(
        &self,
        spec: &DocumentAggregate,
    ) -> Result<Vec<AggregateRow>, CoreError> {
        let column = spec.group_by.column();
        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            r#"
            SELECT {column} AS key,
                   COUNT(*) AS count,
                   AVG(CASE WHEN completed_at IS NOT NULL
                            THEN (julianday(completed_at) - julianday(created_at)) * 86400.0
                       END) AS average
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
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn purge_terminal_documents(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(&format!(
            r#"
            DELETE FROM documents
            WHERE id IN (
                SELECT d.id FROM documents d
                WHERE d.status IN ({terminal})
                  AND d.completed_at < ?1
                  AND NOT EXISTS (
                      SELECT 1 FROM jobs j
                      WHERE j.document_id = d.id
                        AND j.status NOT IN ({job_terminal})
                  )
                ORDER BY d.completed_at
                LIMIT ?2
            )
            "#,
            terminal = status_list(DocumentStatus::TERMINAL.iter().map(|s| s.as_str())),
            job_terminal = status_list(JobStatus::TERMINAL.iter().map(|s| s.as_str())),
        ))
        .bind(before)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl JobRepository for SqliteStore {
    async fn create_job(&self, new: NewJob) -> Result<JobRecord, CoreError> {
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
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
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
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::from_insert(e, "job", &new.id))?;

        Ok(new.into_record())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, CoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn list_jobs_by_document(&self, document_id: &str) -> Result<Vec<JobRecord>, CoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE document_id = ? ORDER BY created_at, id",
            JOB_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(JobRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|job| (job.step.position(), job.created_at));
        Ok(jobs)
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        query: &ListQuery<JobStatus>,
    ) -> Result<Page<JobRecord>, CoreError> {
        query.validate()?;

        fn push_filters<'a>(
            builder: &mut QueryBuilder<'a, Sqlite>,
            filter: &'a JobFilter,
            status: Option<JobStatus>,
        ) {
            if let Some(org) = &filter.organization_id {
                builder.push(" AND organization_id = ").push_bind(org.as_str());
            }
            if let Some(document_id) = &filter.document_id {
                builder.push(" AND document_id = ").push_bind(document_id.as_str());
            }
            if let Some(step) = filter.step {
                builder.push(" AND step = ").push_bind(step.as_str());
            }
            if let Some(status) = status {
                builder.push(" AND status = ").push_bind(status.as_str());
            }
        }

        let mut count: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM jobs WHERE 1 = 1");
        push_filters(&mut count, filter, query.status);
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await?;

        let mut items: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM jobs WHERE 1 = 1", JOB_COLUMNS));
        push_filters(&mut items, filter, query.status);
        items.push(format!(
            " ORDER BY created_at {dir}, id {dir} LIMIT ",
            dir = query.sort.sql()
        ));
        items.push_bind(query.limit());
        items.push(" OFFSET ");
        items.push_bind(query.offset());

        let jobs = items
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(JobRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page::new(jobs, total, query))
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<JobRecord>, CoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at, id LIMIT ?2",
            JOB_COLUMNS
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn count_active_jobs(&self, organization_id: &str) -> Result<i64, CoreError> {
        let row: (i64,) = sqlx::query_as(&format!(
            r#"
            SELECT COUNT(*)
            FROM jobs
            WHERE organization_id = ?
              AND status IN ({})
            "#,
            status_list(JobStatus::ACTIVE.iter().map(|s| s.as_str()))
        ))
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn claim_job(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running',
                worker_id = ?1,
                started_at = ?2,
                last_heartbeat = NULL,
                completed_at = NULL,
                updated_at = ?2
            WHERE id = ?3
              AND status = 'pending'
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET last_heartbeat = ?1,
                worker_id = ?2,
                updated_at = ?1
            WHERE id = ?3
              AND status = 'running'
            "#,
        )
        .bind(now)
        .bind(worker_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_job_status(
        &self,
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
            SET status = ?1,
                error = CASE WHEN ?8 THEN NULL ELSE COALESCE(?2, error) END,
                termination_reason = CASE WHEN ?8 THEN NULL ELSE COALESCE(?3, termination_reason) END,
                output_ref = CASE WHEN ?8 THEN NULL ELSE COALESCE(?4, output_ref) END,
                execution_time_seconds = CASE WHEN ?8 THEN NULL ELSE COALESCE(?5, execution_time_seconds) END,
                completed_at = CASE WHEN ?8 THEN NULL ELSE COALESCE(?6, completed_at) END,
                attempts = CASE WHEN ?7 THEN MIN(attempts + 1, max_attempts) ELSE attempts END,
                worker_id = CASE WHEN ?8 THEN NULL ELSE worker_id END,
                started_at = CASE WHEN ?8 THEN NULL ELSE started_at END,
                last_heartbeat = CASE WHEN ?8 THEN NULL ELSE last_heartbeat END,
                updated_at = ?9
            WHERE id = ?10
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
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_job_log(&self, id: &str, entry: &LogEntry) -> Result<(), CoreError> {
        let details = entry
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO job_logs (job_id, level, message, details, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(id)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(details)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::from_insert(e, "job_log", id))?;

        Ok(())
    }

    async fn list_job_logs(&self, id: &str) -> Result<Vec<LogEntry>, CoreError> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT level, message, details, created_at
            FROM job_logs
            WHERE job_id = ?
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LogEntry::try_from).collect()
    }

    async fn aggregate_jobs(&self, spec: &JobAggregate) -> Result<Vec<AggregateRow>, CoreError> {
        let column = spec.group_by.column();
        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
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
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn purge_job_logs(&self, before: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM job_logs WHERE created_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn purge_terminal_jobs(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(&format!(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status IN ({})
                  AND completed_at < ?1
                ORDER BY completed_at
                LIMIT ?2
            )
            "#,
            status_list(JobStatus::TERMINAL.iter().map(|s| s.as_str()))
        ))
        .bind(before)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl QuotaRepository for SqliteStore {
    async fn get_limit(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
    ) -> Result<Option<QuotaLimitRecord>, CoreError> {
        let row = sqlx::query_as::<_, LimitRow>(
            r#"
            SELECT organization_id, resource_type, tier, limit_value, overridden, created_at, updated_at
            FROM quota_limits
            WHERE organization_id = ?1 AND resource_type = ?2
            "#,
        )
        .bind(organization_id)
        .bind(resource_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(QuotaLimitRecord::try_from).transpose()
    }

    async fn insert_limit_if_absent(
        &self,
        limit: &QuotaLimitRecord,
    ) -> Result<QuotaLimitRecord, CoreError> {
        sqlx::query(
            r#"
            INSERT INTO quota_limits (organization_id, resource_type, tier, limit_value, overridden, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(organization_id, resource_type) DO NOTHING
            "#,
        )
        .bind(&limit.organization_id)
        .bind(limit.resource_type.as_str())
        .bind(limit.tier.as_str())
        .bind(limit.limit_value)
        .bind(limit.overridden)
        .bind(limit.created_at)
        .bind(limit.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_limit(&limit.organization_id, limit.resource_type)
            .await?
            .ok_or_else(|| CoreError::DatabaseError {
                operation: "insert_limit".to_string(),
                details: format!(
                    "limit for '{}'/{} vanished after insert",
                    limit.organization_id, limit.resource_type
                ),
            })
    }

    async fn upsert_limit(&self, limit: &QuotaLimitRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO quota_limits (organization_id, resource_type, tier, limit_value, overridden, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(organization_id, resource_type) DO UPDATE SET
                tier = excluded.tier,
                limit_value = excluded.limit_value,
                overridden = excluded.overridden,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&limit.organization_id)
        .bind(limit.resource_type.as_str())
        .bind(limit.tier.as_str())
        .bind(limit.limit_value)
        .bind(limit.overridden)
        .bind(limit.created_at)
        .bind(limit.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_limits(
        &self,
        organization_id: &str,
    ) -> Result<Vec<QuotaLimitRecord>, CoreError> {
        let rows = sqlx::query_as::<_, LimitRow>(
            r#"
            SELECT organization_id, resource_type, tier, limit_value, overridden, created_at, updated_at
            FROM quota_limits
            WHERE organization_id = ?
            ORDER BY resource_type
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QuotaLimitRecord::try_from).collect()
    }

    async fn get_usage(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
        period_start: DateTime<Utc>,
    ) -> Result<Option<QuotaUsageRecord>, CoreError> {
        let row = sqlx::query_as::<_, UsageRow>(
            r#"
            SELECT organization_id, resource_type, period, period_start, period_end, current_usage, updated_at
            FROM quota_usage
            WHERE organization_id = ?1 AND resource_type = ?2 AND period_start = ?3
            "#,
        )
        .bind(organization_id)
        .bind(resource_type.as_str())
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QuotaUsageRecord::try_from).transpose()
    }

    async fn increment_usage(&self, increment: &UsageIncrement) -> Result<i64, CoreError> {
        if increment.amount < 0 {
            return Err(CoreError::validation("amount", "must not be negative"));
        }

        let (usage,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO quota_usage (organization_id, resource_type, period, period_start, period_end, current_usage, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(organization_id, resource_type, period_start) DO UPDATE SET
                current_usage = quota_usage.current_usage + excluded.current_usage,
                updated_at = excluded.updated_at
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
        .fetch_one(&self.pool)
        .await?;

        Ok(usage)
    }

    async fn record_violation(&self, violation: &NewQuotaViolation) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO quota_violations (
                organization_id, resource_type, current_usage, limit_value, requested,
                exceeded_by, service, occurred_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
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
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_violations(
        &self,
        organization_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<QuotaViolationRecord>, CoreError> {
        let rows = sqlx::query_as::<_, ViolationRow>(
            r#"
            SELECT id, organization_id, resource_type, current_usage, limit_value, requested,
                   exceeded_by, service, occurred_at
            FROM quota_violations
            WHERE organization_id = ?1 AND occurred_at >= ?2
            ORDER BY occurred_at DESC, id DESC
            "#,
        )
        .bind(organization_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QuotaViolationRecord::try_from).collect()
    }
}

#[async_trait::async_trait]
impl StoreHealth for SqliteStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn health_check(&self) -> Result<HealthReport, CoreError> {
        let started = Instant::now();
        let probe: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        if probe.is_err() {
            return Ok(HealthReport {
                backend: BackendKind::Sqlite,
                healthy: false,
                latency_ms,
                documents: 0,
                jobs: 0,
            });
        }

        let (documents,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let (jobs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;

        Ok(HealthReport {
            backend: BackendKind::Sqlite,
            healthy: true,
            latency_ms,
            documents,
            jobs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LogLevel, PipelineStep};
    use crate::persistence::{DocumentGroupBy, JobGroupBy, SortOrder};
    use crate::quota::{PeriodKind, QuotaWindow, Tier};
    use chrono::TimeZone;

    async fn test_store() -> SqliteStore {
        SqliteStore::in_memory()
            .await
            .expect("Failed to create in-memory store")
    }

    async fn seed_document(store: &SqliteStore, owner: &str) -> DocumentRecord {
        store
            .create_document(NewDocument::new(owner, "acme", "report.pdf"))
            .await
            .expect("Failed to create document")
    }

    #[tokio::test]
    async fn test_create_and_get_document() {
        let store = test_store().await;
        let metadata = serde_json::json!({"priority": true, "language": "en"});

        let created = store
            .create_document(
                NewDocument::new("user-1", "acme", "report.pdf").with_metadata(metadata.clone()),
            )
            .await
            .expect("Failed to create document");

        let fetched = store
            .get_document(&created.id)
            .await
            .expect("Failed to get document")
            .expect("Document should exist");

        assert_eq!(fetched.owner_id, "user-1");
        assert_eq!(fetched.organization_id, "acme");
        assert_eq!(fetched.status, DocumentStatus::Pending);
        assert_eq!(fetched.metadata, metadata);
        assert!(fetched.is_priority());
        assert!(fetched.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_document_is_already_exists() {
        let store = test_store().await;
        let new = NewDocument::new("user-1", "acme", "a.pdf").with_id("doc-1");

        store.create_document(new.clone()).await.unwrap();
        let err = store.create_document(new).await.unwrap_err();

        assert!(err.is_already_exists(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_get_document_not_found() {
        let store = test_store().await;
        assert!(store.get_document("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_document_status_transitions_are_guarded() {
        let store = test_store().await;
        let doc = seed_document(&store, "user-1").await;

        // pending -> completed is not a legal transition
        let applied = store
            .update_document_status(&doc.id, &DocumentStatusUpdate::new(DocumentStatus::Completed))
            .await
            .unwrap();
        assert!(!applied);

        assert!(
            store
                .update_document_status(
                    &doc.id,
                    &DocumentStatusUpdate::new(DocumentStatus::Processing)
                )
                .await
                .unwrap()
        );

        let update = DocumentStatusUpdate::new(DocumentStatus::Completed)
            .with_artifact("pdf_ua", "s3://bucket/out.pdf");
        assert!(store.update_document_status(&doc.id, &update).await.unwrap());

        let fetched = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, DocumentStatus::Completed);
        assert!(fetched.completed_at.is_some());
        assert_eq!(
            fetched.artifacts.get("pdf_ua").map(String::as_str),
            Some("s3://bucket/out.pdf")
        );
    }

    #[tokio::test]
    async fn test_set_document_artifact() {
        let store = test_store().await;
        let doc = seed_document(&store, "user-1").await;
        let now = Utc::now();

        assert!(
            store
                .set_document_artifact(&doc.id, "ocr_text", "s3://a", now)
                .await
                .unwrap()
        );
        assert!(
            store
                .set_document_artifact(&doc.id, "ocr_text", "s3://b", now)
                .await
                .unwrap()
        );
        assert!(
            !store
                .set_document_artifact("missing", "ocr_text", "s3://c", now)
                .await
                .unwrap()
        );

        let fetched = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(fetched.artifacts.len(), 1);
        assert_eq!(fetched.artifacts["ocr_text"], "s3://b");
    }

    #[tokio::test]
    async fn test_list_documents_by_owner_paginates() {
        let store = test_store().await;
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        for i in 0..5 {
            store
                .create_document(
                    NewDocument::new("user-1", "acme", format!("doc-{}.pdf", i))
                        .created_at(base + chrono::Duration::minutes(i)),
                )
                .await
                .unwrap();
        }
        seed_document(&store, "user-2").await;

        let first = store
            .list_documents_by_owner("user-1", &ListQuery::default().page(1, 2))
            .await
            .unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.items[0].filename, "doc-4.pdf");

        let last = store
            .list_documents_by_owner(
                "user-1",
                &ListQuery::default()
                    .page(3, 2)
                    .sorted(SortOrder::OldestFirst),
            )
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].filename, "doc-4.pdf");
        assert!(!last.has_more);

        let completed = store
            .list_documents_by_owner(
                "user-1",
                &ListQuery::default().with_status(DocumentStatus::Completed),
            )
            .await
            .unwrap();
        assert_eq!(completed.total, 0);
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let store = test_store().await;
        let doc = seed_document(&store, "user-1").await;
        let job = store
            .create_job(NewJob::for_document(&doc, PipelineStep::Ocr))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let now = Utc::now();
        assert!(store.claim_job(&job.id, "worker-1", now).await.unwrap());
        assert!(!store.claim_job(&job.id, "worker-2", now).await.unwrap());

        assert!(store.set_heartbeat(&job.id, "worker-1", now).await.unwrap());

        let running = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.worker_id.as_deref(), Some("worker-1"));
        assert!(running.last_heartbeat.is_some());

        let done = JobStatusUpdate::completed(&running, Some("s3://ocr".to_string()), now);
        assert!(store.update_job_status(&job.id, &done).await.unwrap());

        // Heartbeats never move a finished job.
        assert!(!store.set_heartbeat(&job.id, "worker-1", now).await.unwrap());

        let completed = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.output_ref.as_deref(), Some("s3://ocr"));
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_pending_job_cannot_complete() {
        let store = test_store().await;
        let doc = seed_document(&store, "user-1").await;
        let job = store
            .create_job(NewJob::for_document(&doc, PipelineStep::Route))
            .await
            .unwrap();

        let done = JobStatusUpdate::completed(&job, None, Utc::now());
        assert!(!store.update_job_status(&job.id, &done).await.unwrap());
    }

    #[tokio::test]
    async fn test_attempts_capped_at_max() {
        let store = test_store().await;
        let doc = seed_document(&store, "user-1").await;
        let job = store
            .create_job(NewJob::for_document(&doc, PipelineStep::Tag).with_max_attempts(2))
            .await
            .unwrap();

        for _ in 0..3 {
            let now = Utc::now();
            if store.get_job(&job.id).await.unwrap().unwrap().status == JobStatus::Retry {
                store
                    .update_job_status(&job.id, &JobStatusUpdate::requeue(now))
                    .await
                    .unwrap();
            }
            store.claim_job(&job.id, "worker-1", now).await.unwrap();
            let current = store.get_job(&job.id).await.unwrap().unwrap();
            let failure = JobStatusUpdate::failure(&current, serde_json::json!({"e": 1}), now);
            store.update_job_status(&job.id, &failure).await.unwrap();
        }

        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_job_for_missing_document_rejected() {
        let store = test_store().await;
        let ghost = NewDocument::new("user-1", "acme", "ghost.pdf").into_record();
        let err = store
            .create_job(NewJob::for_document(&ghost, PipelineStep::Route))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_jobs_listed_in_pipeline_order() {
        let store = test_store().await;
        let doc = seed_document(&store, "user-1").await;
        for step in [PipelineStep::Export, PipelineStep::Route, PipelineStep::Ocr] {
            store
                .create_job(NewJob::for_document(&doc, step))
                .await
                .unwrap();
        }

        let steps: Vec<_> = store
            .list_jobs_by_document(&doc.id)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.step)
            .collect();
        assert_eq!(
            steps,
            vec![PipelineStep::Route, PipelineStep::Ocr, PipelineStep::Export]
        );

        let page = store
            .list_jobs(
                &JobFilter {
                    step: Some(PipelineStep::Ocr),
                    ..Default::default()
                },
                &ListQuery::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_job_logs() {
        let store = test_store().await;
        let doc = seed_document(&store, "user-1").await;
        let job = store
            .create_job(NewJob::for_document(&doc, PipelineStep::Validate))
            .await
            .unwrap();

        let now = Utc::now();
        store
            .append_job_log(&job.id, &LogEntry::new(LogLevel::Info, "started", now))
            .await
            .unwrap();
        store
            .append_job_log(
                &job.id,
                &LogEntry::new(LogLevel::Error, "crashed", now)
                    .with_details(serde_json::json!({"code": 3})),
            )
            .await
            .unwrap();

        let logs = store.list_job_logs(&job.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "started");
        assert_eq!(logs[1].level, LogLevel::Error);
        assert_eq!(logs[1].details, Some(serde_json::json!({"code": 3})));

        let purged = store
            .purge_job_logs(now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 2);
    }

    #[tokio::test]
    async fn test_aggregate_jobs() {
        let store = test_store().await;
        let doc = seed_document(&store, "user-1").await;
        let started = Utc::now() - chrono::Duration::seconds(10);

        for step in [PipelineStep::Route, PipelineStep::Ocr, PipelineStep::Structure] {
            let job = store
                .create_job(NewJob::for_document(&doc, step))
                .await
                .unwrap();
            store.claim_job(&job.id, "w", started).await.unwrap();
            if step != PipelineStep::Structure {
                let running = store.get_job(&job.id).await.unwrap().unwrap();
                let done = JobStatusUpdate::completed(
                    &running,
                    None,
                    started + chrono::Duration::seconds(4),
                );
                store.update_job_status(&job.id, &done).await.unwrap();
            }
        }

        let rows = store
            .aggregate_jobs(&JobAggregate::by(JobGroupBy::Status))
            .await
            .unwrap();
        let completed = rows.iter().find(|r| r.key == "completed").unwrap();
        assert_eq!(completed.count, 2);
        assert_eq!(completed.average, Some(4.0));
        let running = rows.iter().find(|r| r.key == "running").unwrap();
        assert_eq!(running.count, 1);
        assert_eq!(running.average, None);
    }

    #[tokio::test]
    async fn test_aggregate_documents() {
        let store = test_store().await;
        seed_document(&store, "user-1").await;
        seed_document(&store, "user-1").await;
        seed_document(&store, "user-2").await;

        let rows = store
            .aggregate_documents(&DocumentAggregate {
                group_by: DocumentGroupBy::Owner,
                organization_id: Some("acme".to_string()),
                since: None,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "user-1");
        assert_eq!(rows[0].count, 2);
    }

    #[tokio::test]
    async fn test_increment_usage_upserts() {
        let store = test_store().await;
        let now = Utc::now();
        let window = QuotaWindow::containing(PeriodKind::Monthly, now).unwrap();
        let increment = UsageIncrement {
            organization_id: "acme".to_string(),
            resource_type: ResourceType::ApiCallsMonthly,
            window,
            amount: 3,
            at: now,
        };

        assert_eq!(store.increment_usage(&increment).await.unwrap(), 3);
        assert_eq!(store.increment_usage(&increment).await.unwrap(), 6);

        let usage = store
            .get_usage("acme", ResourceType::ApiCallsMonthly, window.start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(usage.current_usage, 6);
        assert_eq!(usage.window.kind, PeriodKind::Monthly);
    }

    #[tokio::test]
    async fn test_insert_limit_if_absent_keeps_existing() {
        let store = test_store().await;
        let now = Utc::now();
        let limit = QuotaLimitRecord {
            organization_id: "acme".to_string(),
            resource_type: ResourceType::FilesTotal,
            tier: Tier::Basic,
            limit_value: 7,
            overridden: true,
            created_at: now,
            updated_at: now,
        };
        store.upsert_limit(&limit).await.unwrap();

        let stored = store
            .insert_limit_if_absent(&QuotaLimitRecord {
                limit_value: 100,
                overridden: false,
                ..limit.clone()
            })
            .await
            .unwrap();
        assert_eq!(stored.limit_value, 7);
        assert!(stored.overridden);
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = test_store().await;
        seed_document(&store, "user-1").await;

        let report = store.health_check().await.unwrap();
        assert!(report.healthy);
        assert_eq!(report.backend, BackendKind::Sqlite);
        assert_eq!(report.documents, 1);
        assert_eq!(report.jobs, 0);
    }

    #[tokio::test]
    async fn test_from_path_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("accessdoc.db");

        let store = SqliteStore::from_path(&path).await.unwrap();
        seed_document(&store, "user-1").await;

        assert!(path.exists());
    }
}
