// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timeout enforcement for running pipeline jobs.
//!
//! A periodic sweep inspects every `running` job and terminates the ones
//! that overran their step's budget:
//!
//! 1. elapsed execution time above `global_timeout` → `GLOBAL_TIMEOUT`
//! 2. elapsed execution time above `execution_timeout` → `EXECUTION_TIMEOUT`
//! 3. last heartbeat (or, without one, the start) older than
//!    `heartbeat_timeout` → `HEARTBEAT_TIMEOUT`
//!
//! The first matching rule wins. Execution and heartbeat overruns are
//! routed to `retry` while the step's `max_retries_on_timeout` allows it;
//! global overruns are always final. Every transition is conditioned on
//! the job still being `running`, so a worker finishing concurrently (or a
//! second sweeper) wins cleanly and the sweep skips the job.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::CoreError;
use crate::lifecycle::{JobStatus, LogEntry, LogLevel, PipelineStep};
use crate::persistence::{
    JobAggregate, JobFilter, JobGroupBy, JobRecord, JobStatusUpdate, ListQuery, MAX_PAGE_SIZE,
    SortOrder, Store,
};

// ============================================================================
// Policies
// ============================================================================

/// Time budget for one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepTimeoutPolicy {
    /// Longest regular execution.
    pub execution_timeout: Duration,
    /// Longest silence between heartbeats.
    pub heartbeat_timeout: Duration,
    /// Absolute ceiling; never retried.
    pub global_timeout: Duration,
    /// Heartbeat cadence expected from workers.
    pub heartbeat_interval: Duration,
    /// Timed-out attempts that may still be retried.
    pub max_retries_on_timeout: i32,
}

const fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

impl StepTimeoutPolicy {
    /// Budget for steps without a built-in policy.
    pub const PLATFORM_DEFAULT: StepTimeoutPolicy = StepTimeoutPolicy {
        execution_timeout: secs(3600),
        heartbeat_timeout: secs(300),
        global_timeout: secs(7200),
        heartbeat_interval: secs(60),
        max_retries_on_timeout: 2,
    };

    const fn new(execution: u64, heartbeat: u64, global: u64) -> Self {
        Self {
            execution_timeout: secs(execution),
            heartbeat_timeout: secs(heartbeat),
            global_timeout: secs(global),
            heartbeat_interval: secs(30),
            max_retries_on_timeout: 2,
        }
    }

    /// Built-in budget for `step`.
    pub fn builtin(step: PipelineStep) -> Self {
        match step {
            PipelineStep::Route => Self::new(300, 60, 600),
            PipelineStep::Ocr => Self::new(1800, 120, 3600),
            PipelineStep::Structure => Self::new(1200, 120, 2400),
            PipelineStep::AltText => Self::new(1800, 120, 3600),
            PipelineStep::Tag => Self::new(900, 120, 1800),
            PipelineStep::Export => Self::new(900, 120, 1800),
            PipelineStep::Validate => Self::new(600, 120, 1200),
            PipelineStep::Notify => Self {
                heartbeat_interval: secs(10),
                max_retries_on_timeout: 3,
                ..Self::new(120, 30, 300)
            },
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.execution_timeout.is_zero()
            || self.heartbeat_timeout.is_zero()
            || self.global_timeout.is_zero()
        {
            return Err("timeouts must be positive".to_string());
        }
        if self.execution_timeout > self.global_timeout {
            return Err("execution_timeout exceeds global_timeout".to_string());
        }
        if self.heartbeat_timeout > self.global_timeout {
            return Err("heartbeat_timeout exceeds global_timeout".to_string());
        }
        if self.max_retries_on_timeout < 0 {
            return Err("max_retries_on_timeout must not be negative".to_string());
        }
        Ok(())
    }
}

/// Partial per-step override, as read from configuration (seconds).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepTimeoutOverride {
    /// Execution timeout.
    pub execution_timeout_secs: Option<u64>,
    /// Heartbeat timeout.
    pub heartbeat_timeout_secs: Option<u64>,
    /// Global timeout.
    pub global_timeout_secs: Option<u64>,
    /// Heartbeat interval.
    pub heartbeat_interval_secs: Option<u64>,
    /// Retries on timeout.
    pub max_retries_on_timeout: Option<i32>,
}

impl StepTimeoutOverride {
    /// Apply the set fields on top of `base`.
    pub fn apply(&self, base: StepTimeoutPolicy) -> StepTimeoutPolicy {
        StepTimeoutPolicy {
            execution_timeout: self
                .execution_timeout_secs
                .map(secs)
                .unwrap_or(base.execution_timeout),
            heartbeat_timeout: self
                .heartbeat_timeout_secs
                .map(secs)
                .unwrap_or(base.heartbeat_timeout),
            global_timeout: self
                .global_timeout_secs
                .map(secs)
                .unwrap_or(base.global_timeout),
            heartbeat_interval: self
                .heartbeat_interval_secs
                .map(secs)
                .unwrap_or(base.heartbeat_interval),
            max_retries_on_timeout: self
                .max_retries_on_timeout
                .unwrap_or(base.max_retries_on_timeout),
        }
    }
}

/// Resolved budgets for every step.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutPolicies {
    policies: HashMap<PipelineStep, StepTimeoutPolicy>,
}

impl Default for TimeoutPolicies {
    fn default() -> Self {
        Self {
            policies: PipelineStep::ALL
                .into_iter()
                .map(|step| (step, StepTimeoutPolicy::builtin(step)))
                .collect(),
        }
    }
}

impl TimeoutPolicies {
    /// Built-in budgets with `overrides` applied.
    pub fn with_overrides(
        overrides: &HashMap<PipelineStep, StepTimeoutOverride>,
    ) -> Result<Self, String> {
        let mut policies = Self::default();
        for (step, patch) in overrides {
            let resolved = patch.apply(policies.policy_for(*step));
            resolved
                .validate()
                .map_err(|e| format!("step '{}': {}", step, e))?;
            policies.policies.insert(*step, resolved);
        }
        Ok(policies)
    }

    /// Budget for `step`.
    pub fn policy_for(&self, step: PipelineStep) -> StepTimeoutPolicy {
        self.policies
            .get(&step)
            .copied()
            .unwrap_or(StepTimeoutPolicy::PLATFORM_DEFAULT)
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Why a job was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutReason {
    /// Absolute ceiling exceeded, or manual termination.
    GlobalTimeout,
    /// Regular execution budget exceeded.
    ExecutionTimeout,
    /// Worker went silent.
    HeartbeatTimeout,
}

impl TimeoutReason {
    /// All reasons.
    pub const ALL: [TimeoutReason; 3] = [
        Self::GlobalTimeout,
        Self::ExecutionTimeout,
        Self::HeartbeatTimeout,
    ];

    /// Stored termination reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GlobalTimeout => "GLOBAL_TIMEOUT",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
        }
    }

    /// Whether a job terminated for this reason may be retried at all.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::GlobalTimeout)
    }
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeoutReason {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| {
                CoreError::validation("termination_reason", format!("unknown reason '{}'", s))
            })
    }
}

fn since(earlier: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}

/// First overrun rule `job` violates at `now`, if any. A job that never
/// recorded `started_at` is treated as having started at `now`.
pub fn classify(
    job: &JobRecord,
    policy: &StepTimeoutPolicy,
    now: DateTime<Utc>,
) -> Option<TimeoutReason> {
    let execution = job.started_at.map(|s| since(s, now)).unwrap_or_default();

    if execution > policy.global_timeout {
        return Some(TimeoutReason::GlobalTimeout);
    }
    if execution > policy.execution_timeout {
        return Some(TimeoutReason::ExecutionTimeout);
    }
    let silence = match job.last_heartbeat {
        Some(heartbeat) => since(heartbeat, now),
        None => execution,
    };
    if silence > policy.heartbeat_timeout {
        return Some(TimeoutReason::HeartbeatTimeout);
    }
    None
}

/// Whether a job timed out for `reason` goes back to `retry`.
pub fn should_retry(job: &JobRecord, reason: TimeoutReason, policy: &StepTimeoutPolicy) -> bool {
    reason.is_retryable()
        && job.attempts < policy.max_retries_on_timeout
        && job.attempts + 1 < job.max_attempts
}

/// Terminated job, as stored in its error payload and passed to callbacks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeoutEvent {
    /// Job.
    pub job_id: String,
    /// Owning document.
    pub document_id: String,
    /// Organization.
    pub organization_id: String,
    /// Step.
    pub step: PipelineStep,
    /// Trigger.
    pub reason: TimeoutReason,
    /// Set for operator-initiated terminations.
    pub manual: bool,
    /// Operator note.
    pub note: Option<String>,
    /// Seconds since the job started.
    pub execution_seconds: f64,
    /// Last heartbeat received.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Worker that held the job.
    pub worker_id: Option<String>,
    /// Attempts before this termination.
    pub attempts: i32,
    /// Whether the job was routed to `retry`.
    pub will_retry: bool,
    /// Decision time.
    pub occurred_at: DateTime<Utc>,
}

impl TimeoutEvent {
    fn new(job: &JobRecord, reason: TimeoutReason, will_retry: bool, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id.clone(),
            document_id: job.document_id.clone(),
            organization_id: job.organization_id.clone(),
            step: job.step,
            reason,
            manual: false,
            note: None,
            execution_seconds: crate::persistence::elapsed_seconds(job.started_at, now),
            last_heartbeat: job.last_heartbeat,
            worker_id: job.worker_id.clone(),
            attempts: job.attempts,
            will_retry,
            occurred_at: now,
        }
    }

    fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.reason.as_str(),
            "message": format!("{} step exceeded its time budget", self.step),
            "timeout": self,
        })
    }
}

/// Callback invoked for every applied timeout.
pub type TimeoutCallback = Arc<dyn Fn(&TimeoutEvent) + Send + Sync>;

// ============================================================================
// Enforcer
// ============================================================================

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Running jobs inspected.
    pub examined: usize,
    /// Jobs moved to `timeout`.
    pub timed_out: usize,
    /// Jobs moved to `retry`.
    pub retried: usize,
    /// Overrunning jobs another actor resolved first.
    pub skipped: usize,
    /// Jobs whose processing failed.
    pub errors: usize,
    /// Set when the sweep did not run because another was in progress.
    pub overlapped: bool,
}

/// Timeout counts over a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeoutStatistics {
    /// Window length in seconds.
    pub window_secs: u64,
    /// Jobs updated within the window.
    pub total_jobs: i64,
    /// Of those, jobs carrying a timeout termination reason.
    pub total_timeouts: i64,
    /// `total_timeouts / total_jobs`, zero without jobs.
    pub timeout_rate: f64,
    /// Timeouts per step.
    pub by_step: BTreeMap<String, i64>,
    /// Timeouts per reason.
    pub by_reason: BTreeMap<String, i64>,
}

/// Configuration for the timeout enforcer.
#[derive(Debug, Clone)]
pub struct TimeoutEnforcerConfig {
    /// Pause between sweeps.
    pub sweep_interval: Duration,
    /// Per-step budgets.
    pub policies: TimeoutPolicies,
    /// Running jobs fetched per page while sweeping.
    pub page_size: u32,
}

impl Default for TimeoutEnforcerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            policies: TimeoutPolicies::default(),
            page_size: MAX_PAGE_SIZE,
        }
    }
}

enum Resolution {
    Healthy,
    Applied { retried: bool },
    Lost,
}

struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Background worker terminating overdue jobs.
pub struct TimeoutEnforcer {
    store: Arc<dyn Store>,
    config: TimeoutEnforcerConfig,
    callbacks: RwLock<HashMap<TimeoutReason, Vec<TimeoutCallback>>>,
    sweeping: AtomicBool,
    shutdown: Arc<Notify>,
}

impl TimeoutEnforcer {
    /// Create an enforcer writing through `store`.
    pub fn new(store: Arc<dyn Store>, config: TimeoutEnforcerConfig) -> Self {
        Self {
            store,
            config,
            callbacks: RwLock::new(HashMap::new()),
            sweeping: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Budget applied to `step`.
    pub fn policy_for(&self, step: PipelineStep) -> StepTimeoutPolicy {
        self.config.policies.policy_for(step)
    }

    /// Register `callback` for timeouts with `reason`.
    pub fn on_timeout(&self, reason: TimeoutReason, callback: TimeoutCallback) {
        self.callbacks.write().entry(reason).or_default().push(callback);
    }

    fn notify(&self, event: &TimeoutEvent) {
        let callbacks = self
            .callbacks
            .read()
            .get(&event.reason)
            .cloned()
            .unwrap_or_default();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "Timeout enforcer started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Timeout enforcer received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    match self.sweep_at(Utc::now()).await {
                        Ok(report) if report.timed_out + report.retried + report.errors > 0 => {
                            info!(
                                examined = report.examined,
                                timed_out = report.timed_out,
                                retried = report.retried,
                                skipped = report.skipped,
                                errors = report.errors,
                                "Timeout sweep finished"
                            );
                        }
                        Ok(report) => {
                            debug!(examined = report.examined, "Timeout sweep found nothing overdue");
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to sweep running jobs");
                        }
                    }
                }
            }
        }

        info!("Timeout enforcer stopped");
    }

    /// One pass over the running jobs at the current time.
    pub async fn sweep(&self) -> Result<SweepReport, CoreError> {
        self.sweep_at(Utc::now()).await
    }

    /// One pass over the running jobs, evaluated at `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, CoreError> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Previous timeout sweep still in progress, skipping");
            return Ok(SweepReport {
                overlapped: true,
                ..SweepReport::default()
            });
        }
        let _guard = SweepGuard(&self.sweeping);

        let running = self.running_jobs().await?;

        let mut report = SweepReport {
            examined: running.len(),
            ..SweepReport::default()
        };

        for job in running {
            match self.resolve(&job, now).await {
                Ok(Resolution::Healthy) => {}
                Ok(Resolution::Applied { retried: true }) => report.retried += 1,
                Ok(Resolution::Applied { retried: false }) => report.timed_out += 1,
                Ok(Resolution::Lost) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    error!(job_id = %job.id, error = %e, "Failed to enforce job timeout");
                }
            }
        }

        Ok(report)
    }

    /// Every running job, oldest first, read page by page before any
    /// transition is applied.
    async fn running_jobs(&self) -> Result<Vec<JobRecord>, CoreError> {
        let filter = JobFilter::default();
        let page_size = self.config.page_size.clamp(1, MAX_PAGE_SIZE);
        let mut jobs = Vec::new();
        let mut page = 1;

        loop {
            let query = ListQuery::default()
                .with_status(JobStatus::Running)
                .page(page, page_size)
                .sorted(SortOrder::OldestFirst);
            let batch = self.store.list_jobs(&filter, &query).await?;
            let done = !batch.has_more || batch.items.is_empty();
            jobs.extend(batch.items);
            if done {
                return Ok(jobs);
            }
            page += 1;
        }
    }

    async fn resolve(&self, job: &JobRecord, now: DateTime<Utc>) -> Result<Resolution, CoreError> {
        if job.started_at.is_none() {
            warn!(job_id = %job.id, "Running job has no start time, treating as started now");
        }

        let policy = self.policy_for(job.step);
        let Some(reason) = classify(job, &policy, now) else {
            return Ok(Resolution::Healthy);
        };

        let retry = should_retry(job, reason, &policy);
        let event = TimeoutEvent::new(job, reason, retry, now);

        if self.apply(job, &event).await? {
            Ok(Resolution::Applied { retried: retry })
        } else {
            debug!(job_id = %job.id, "Job left running before timeout applied");
            Ok(Resolution::Lost)
        }
    }

    async fn apply(&self, job: &JobRecord, event: &TimeoutEvent) -> Result<bool, CoreError> {
        let update = JobStatusUpdate::timed_out(
            event.will_retry,
            event.reason.as_str(),
            event.payload(),
            event.execution_seconds,
            event.occurred_at,
        );
        if !self.store.update_job_status(&job.id, &update).await? {
            return Ok(false);
        }

        info!(
            job_id = %job.id,
            step = %job.step,
            reason = %event.reason,
            execution_seconds = event.execution_seconds,
            will_retry = event.will_retry,
            manual = event.manual,
            "Job timed out"
        );

        let entry = LogEntry::new(
            LogLevel::Warning,
            format!("Job terminated: {}", event.reason),
            event.occurred_at,
        )
        .with_details(serde_json::to_value(event)?);
        if let Err(e) = self.store.append_job_log(&job.id, &entry).await {
            error!(job_id = %job.id, error = %e, "Failed to append timeout log entry");
        }

        self.notify(event);
        Ok(true)
    }

    /// Terminate a running job immediately as `GLOBAL_TIMEOUT`.
    pub async fn force_timeout(
        &self,
        job_id: &str,
        note: Option<String>,
    ) -> Result<TimeoutEvent, CoreError> {
        self.force_timeout_at(job_id, note, Utc::now()).await
    }

    /// [`Self::force_timeout`] evaluated at `now`.
    pub async fn force_timeout_at(
        &self,
        job_id: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TimeoutEvent, CoreError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: job_id.to_string(),
            })?;

        let invalid = |actual: JobStatus| CoreError::InvalidJobState {
            job_id: job_id.to_string(),
            expected: JobStatus::Running.to_string(),
            actual: actual.to_string(),
        };
        if job.status != JobStatus::Running {
            return Err(invalid(job.status));
        }

        let mut event = TimeoutEvent::new(&job, TimeoutReason::GlobalTimeout, false, now);
        event.manual = true;
        event.note = note;

        if !self.apply(&job, &event).await? {
            let actual = self
                .store
                .get_job(job_id)
                .await?
                .map(|j| j.status)
                .unwrap_or(job.status);
            return Err(invalid(actual));
        }

        Ok(event)
    }

    /// Timeout statistics over the trailing `window`.
    pub async fn statistics(&self, window: Duration) -> Result<TimeoutStatistics, CoreError> {
        self.statistics_at(window, Utc::now()).await
    }

    /// [`Self::statistics`] evaluated at `now`.
    pub async fn statistics_at(
        &self,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<TimeoutStatistics, CoreError> {
        let span = chrono::Duration::from_std(window)
            .map_err(|e| CoreError::validation("window", e.to_string()))?;
        let since = now - span;

        let all = JobAggregate {
            since: Some(since),
            ..JobAggregate::by(JobGroupBy::Status)
        };
        let total_jobs: i64 = self
            .store
            .aggregate_jobs(&all)
            .await?
            .iter()
            .map(|row| row.count)
            .sum();

        let by_reason: BTreeMap<String, i64> = self
            .store
            .aggregate_jobs(&JobAggregate {
                terminated_only: true,
                since: Some(since),
                ..JobAggregate::by(JobGroupBy::TerminationReason)
            })
            .await?
            .into_iter()
            .filter(|row| row.key.parse::<TimeoutReason>().is_ok())
            .map(|row| (row.key, row.count))
            .collect();

        let by_step: BTreeMap<String, i64> = self
            .store
            .aggregate_jobs(&JobAggregate {
                terminated_only: true,
                since: Some(since),
                ..JobAggregate::by(JobGroupBy::Step)
            })
            .await?
            .into_iter()
            .map(|row| (row.key, row.count))
            .collect();

        let total_timeouts: i64 = by_reason.values().sum();
        let timeout_rate = if total_jobs > 0 {
            total_timeouts as f64 / total_jobs as f64
        } else {
            0.0
        };

        Ok(TimeoutStatistics {
            window_secs: window.as_secs(),
            total_jobs,
            total_timeouts,
            timeout_rate,
            by_step,
            by_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{NewDocument, NewJob, SqliteStore};
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn ago(seconds: i64) -> DateTime<Utc> {
        now() - chrono::Duration::seconds(seconds)
    }

    fn running(step: PipelineStep, started: i64, heartbeat: Option<i64>) -> JobRecord {
        let doc = NewDocument::new("user-1", "acme", "a.pdf").into_record();
        let mut job = NewJob::for_document(&doc, step)
            .created_at(ago(started + 5))
            .into_record();
        job.status = JobStatus::Running;
        job.started_at = Some(ago(started));
        job.last_heartbeat = heartbeat.map(ago);
        job
    }

    /// Store with one document and a claimed job for `step`.
    async fn seeded(
        step: PipelineStep,
        started: i64,
        heartbeat: Option<i64>,
    ) -> (Arc<dyn Store>, JobRecord) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let doc = store
            .create_document(NewDocument::new("user-1", "acme", "a.pdf").created_at(ago(started + 10)))
            .await
            .unwrap();
        let job = store
            .create_job(NewJob::for_document(&doc, step).created_at(ago(started + 5)))
            .await
            .unwrap();
        assert!(store.claim_job(&job.id, "worker-1", ago(started)).await.unwrap());
        if let Some(heartbeat) = heartbeat {
            assert!(store.set_heartbeat(&job.id, "worker-1", ago(heartbeat)).await.unwrap());
        }
        (store, job)
    }

    #[test]
    fn test_builtin_policies_are_consistent() {
        for step in PipelineStep::ALL {
            StepTimeoutPolicy::builtin(step).validate().unwrap();
        }
        StepTimeoutPolicy::PLATFORM_DEFAULT.validate().unwrap();
    }

    #[test]
    fn test_override_applies_and_validates() {
        let mut overrides = HashMap::new();
        overrides.insert(
            PipelineStep::Ocr,
            StepTimeoutOverride {
                execution_timeout_secs: Some(2400),
                ..StepTimeoutOverride::default()
            },
        );
        let policies = TimeoutPolicies::with_overrides(&overrides).unwrap();
        let ocr = policies.policy_for(PipelineStep::Ocr);
        assert_eq!(ocr.execution_timeout, secs(2400));
        assert_eq!(ocr.global_timeout, secs(3600));

        overrides.insert(
            PipelineStep::Route,
            StepTimeoutOverride {
                heartbeat_timeout_secs: Some(900),
                ..StepTimeoutOverride::default()
            },
        );
        let err = TimeoutPolicies::with_overrides(&overrides).unwrap_err();
        assert!(err.contains("route"), "{}", err);
    }

    #[test]
    fn test_classify_order() {
        let policy = StepTimeoutPolicy::builtin(PipelineStep::Ocr);

        let job = running(PipelineStep::Ocr, 60, Some(10));
        assert_eq!(classify(&job, &policy, now()), None);

        let job = running(PipelineStep::Ocr, 1801, Some(10));
        assert_eq!(
            classify(&job, &policy, now()),
            Some(TimeoutReason::ExecutionTimeout)
        );

        // Both execution and global are exceeded; global wins.
        let job = running(PipelineStep::Ocr, 3601, Some(10));
        assert_eq!(
            classify(&job, &policy, now()),
            Some(TimeoutReason::GlobalTimeout)
        );

        let job = running(PipelineStep::Ocr, 600, Some(121));
        assert_eq!(
            classify(&job, &policy, now()),
            Some(TimeoutReason::HeartbeatTimeout)
        );

        let job = running(PipelineStep::Ocr, 121, None);
        assert_eq!(
            classify(&job, &policy, now()),
            Some(TimeoutReason::HeartbeatTimeout)
        );
    }

    #[test]
    fn test_missing_start_is_never_overdue() {
        let policy = StepTimeoutPolicy::builtin(PipelineStep::Route);
        let mut job = running(PipelineStep::Route, 10_000, None);
        job.started_at = None;
        assert_eq!(classify(&job, &policy, now()), None);
    }

    #[test]
    fn test_global_never_retried() {
        let policy = StepTimeoutPolicy::builtin(PipelineStep::Ocr);
        let job = running(PipelineStep::Ocr, 3601, None);
        assert!(!should_retry(&job, TimeoutReason::GlobalTimeout, &policy));
        assert!(should_retry(&job, TimeoutReason::ExecutionTimeout, &policy));

        let mut exhausted = job.clone();
        exhausted.attempts = policy.max_retries_on_timeout;
        assert!(!should_retry(&exhausted, TimeoutReason::HeartbeatTimeout, &policy));
    }

    #[test]
    fn test_reason_round_trip() {
        for reason in TimeoutReason::ALL {
            assert_eq!(reason.as_str().parse::<TimeoutReason>().unwrap(), reason);
        }
        assert!("none".parse::<TimeoutReason>().is_err());
    }

    #[tokio::test]
    async fn test_execution_overrun_is_retried() {
        let (store, job) = seeded(PipelineStep::Ocr, 1801, Some(10)).await;
        let enforcer = TimeoutEnforcer::new(store.clone(), TimeoutEnforcerConfig::default());

        let report = enforcer.sweep_at(now()).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(report.timed_out, 0);

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retry);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.termination_reason.as_deref(), Some("EXECUTION_TIMEOUT"));
        assert_eq!(stored.completed_at, Some(now()));
        assert_eq!(stored.execution_time_seconds, Some(1801.0));
        let error = stored.error.unwrap();
        assert_eq!(error["code"], "EXECUTION_TIMEOUT");
        assert_eq!(error["timeout"]["will_retry"], true);

        let logs = store.list_job_logs(&job.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Warning);
    }

    #[tokio::test]
    async fn test_silent_notifier_hits_heartbeat_timeout() {
        let step: PipelineStep = "notifier".parse().unwrap();
        let (store, job) = seeded(step, 35, None).await;
        let enforcer = TimeoutEnforcer::new(store.clone(), TimeoutEnforcerConfig::default());

        enforcer.sweep_at(now()).await.unwrap();

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.termination_reason.as_deref(), Some("HEARTBEAT_TIMEOUT"));
        assert_eq!(stored.status, JobStatus::Retry);
    }

    #[tokio::test]
    async fn test_global_overrun_is_final() {
        let (store, job) = seeded(PipelineStep::Ocr, 3601, Some(10)).await;
        let enforcer = TimeoutEnforcer::new(store.clone(), TimeoutEnforcerConfig::default());

        let report = enforcer.sweep_at(now()).await.unwrap();
        assert_eq!(report.timed_out, 1);

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Timeout);
        assert_eq!(stored.termination_reason.as_deref(), Some("GLOBAL_TIMEOUT"));
    }

    #[tokio::test]
    async fn test_terminal_jobs_untouched() {
        let (store, job) = seeded(PipelineStep::Ocr, 5000, None).await;
        let completed = store.get_job(&job.id).await.unwrap().unwrap();
        let update = JobStatusUpdate::completed(&completed, Some("s3://out".to_string()), ago(4000));
        assert!(store.update_job_status(&job.id, &update).await.unwrap());
        let before = store.get_job(&job.id).await.unwrap().unwrap();

        let enforcer = TimeoutEnforcer::new(store.clone(), TimeoutEnforcerConfig::default());
        let report = enforcer.sweep_at(now()).await.unwrap();
        assert_eq!(report.examined, 0);

        let after = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_callbacks_fire_once_per_applied_timeout() {
        let (store, _job) = seeded(PipelineStep::Ocr, 3601, None).await;
        let enforcer = TimeoutEnforcer::new(store, TimeoutEnforcerConfig::default());

        let global = Arc::new(AtomicUsize::new(0));
        let counter = global.clone();
        enforcer.on_timeout(
            TimeoutReason::GlobalTimeout,
            Arc::new(move |event: &TimeoutEvent| {
                assert_eq!(event.step, PipelineStep::Ocr);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let heartbeat = Arc::new(AtomicUsize::new(0));
        let counter = heartbeat.clone();
        enforcer.on_timeout(
            TimeoutReason::HeartbeatTimeout,
            Arc::new(move |_: &TimeoutEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        enforcer.sweep_at(now()).await.unwrap();
        enforcer.sweep_at(now()).await.unwrap();

        assert_eq!(global.load(Ordering::SeqCst), 1);
        assert_eq!(heartbeat.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_force_timeout() {
        let (store, job) = seeded(PipelineStep::Tag, 20, Some(5)).await;
        let enforcer = TimeoutEnforcer::new(store.clone(), TimeoutEnforcerConfig::default());

        let event = enforcer
            .force_timeout_at(&job.id, Some("stuck on page 3".to_string()), now())
            .await
            .unwrap();
        assert!(event.manual);
        assert!(!event.will_retry);
        assert_eq!(event.reason, TimeoutReason::GlobalTimeout);

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Timeout);
        assert_eq!(stored.error.unwrap()["timeout"]["manual"], true);

        let err = enforcer
            .force_timeout_at(&job.id, None, now())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_JOB_STATE");

        let err = enforcer
            .force_timeout_at("missing", None, now())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "JOB_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_statistics() {
        let (store, _job) = seeded(PipelineStep::Ocr, 1801, None).await;
        let enforcer = TimeoutEnforcer::new(store.clone(), TimeoutEnforcerConfig::default());
        enforcer.sweep_at(now()).await.unwrap();

        let stats = enforcer
            .statistics_at(Duration::from_secs(3600), now())
            .await
            .unwrap();
        assert_eq!(stats.total_jobs, 1);
        assert_eq!(stats.total_timeouts, 1);
        assert_eq!(stats.timeout_rate, 1.0);
        assert_eq!(stats.by_step.get("ocr"), Some(&1));
        assert_eq!(stats.by_reason.get("EXECUTION_TIMEOUT"), Some(&1));
    }

    #[tokio::test]
    async fn test_requeued_job_sheds_timeout_history() {
        let (store, job) = seeded(PipelineStep::Ocr, 1801, Some(10)).await;
        let enforcer = TimeoutEnforcer::new(store.clone(), TimeoutEnforcerConfig::default());
        let report = enforcer.sweep_at(now()).await.unwrap();
        assert_eq!(report.retried, 1);

        let later = now() + chrono::Duration::days(2);
        assert!(
            store
                .update_job_status(&job.id, &JobStatusUpdate::requeue(now()))
                .await
                .unwrap()
        );
        let pending = store.get_job(&job.id).await.unwrap().unwrap();
        assert!(pending.termination_reason.is_none());
        assert!(pending.error.is_none());
        assert!(pending.execution_time_seconds.is_none());

        assert!(
            store
                .claim_job(&job.id, "worker-2", later - chrono::Duration::seconds(60))
                .await
                .unwrap()
        );
        let running = store.get_job(&job.id).await.unwrap().unwrap();
        let done = JobStatusUpdate::completed(&running, Some("s3://ocr".to_string()), later);
        assert!(store.update_job_status(&job.id, &done).await.unwrap());

        let finished = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.attempts, 1);
        assert!(finished.termination_reason.is_none());
        assert!(finished.error.is_none());
        assert_eq!(finished.execution_time_seconds, Some(60.0));

        let stats = enforcer
            .statistics_at(Duration::from_secs(3600), later)
            .await
            .unwrap();
        assert_eq!(stats.total_jobs, 1);
        assert_eq!(stats.total_timeouts, 0);
        assert!(stats.by_reason.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_reads_every_page_of_running_jobs() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let doc = store
            .create_document(NewDocument::new("user-1", "acme", "big.pdf").created_at(ago(4000)))
            .await
            .unwrap();
        for i in 0..5 {
            let job = store
                .create_job(NewJob::for_document(&doc, PipelineStep::Ocr).created_at(ago(3900 - i)))
                .await
                .unwrap();
            assert!(store.claim_job(&job.id, "worker-1", ago(3700)).await.unwrap());
        }

        let config = TimeoutEnforcerConfig {
            page_size: 2,
            ..TimeoutEnforcerConfig::default()
        };
        let enforcer = TimeoutEnforcer::new(store.clone(), config);
        let report = enforcer.sweep_at(now()).await.unwrap();
        assert_eq!(report.examined, 5);
        assert_eq!(report.timed_out, 5);

        let timed_out = store
            .list_jobs_by_status(JobStatus::Timeout, 100)
            .await
            .unwrap();
        assert_eq!(timed_out.len(), 5);
    }
}
