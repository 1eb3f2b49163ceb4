// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document and job lifecycle: statuses, transition tables, pipeline steps,
//! and the retry/timeout policy shapes stored on each job.
//!
//! Every status update issued by the persistence layer is conditioned on the
//! row currently holding one of [`JobStatus::predecessors`] (or
//! [`DocumentStatus::predecessors`]), so an illegal transition simply does
//! not apply instead of corrupting the record.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Ingested, no job created yet.
    Pending,
    /// At least one pipeline job has been created.
    Processing,
    /// All steps finished successfully.
    Completed,
    /// A step failed terminally.
    Failed,
    /// The compliance validation step rejected the output.
    ValidationFailed,
    /// Processing finished but the owner could not be notified.
    NotificationFailed,
}

impl DocumentStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [DocumentStatus; 6] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::ValidationFailed,
        Self::NotificationFailed,
    ];

    /// Terminal statuses.
    pub const TERMINAL: [DocumentStatus; 4] = [
        Self::Completed,
        Self::Failed,
        Self::ValidationFailed,
        Self::NotificationFailed,
    ];

    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::ValidationFailed => "validation_failed",
            Self::NotificationFailed => "notification_failed",
        }
    }

    /// Statuses a document may move into this one from.
    pub fn predecessors(&self) -> &'static [DocumentStatus] {
        match self {
            Self::Pending => &[],
            Self::Processing => &[Self::Pending],
            Self::Completed | Self::Failed | Self::ValidationFailed | Self::NotificationFailed => {
                &[Self::Processing]
            }
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        next.predecessors().contains(self)
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::validation("document_status", format!("unknown status '{}'", s)))
    }
}

/// Lifecycle status of a pipeline job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed with no retry left.
    Failed,
    /// Failed or timed out, eligible for re-admission by the scheduler.
    Retry,
    /// Terminated by the timeout enforcer.
    Timeout,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Retry,
        Self::Timeout,
    ];

    /// Statuses that count against concurrency quotas.
    pub const ACTIVE: [JobStatus; 2] = [Self::Pending, Self::Running];

    /// Statuses a job never leaves.
    pub const TERMINAL: [JobStatus; 3] = [Self::Completed, Self::Failed, Self::Timeout];

    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retry => "retry",
            Self::Timeout => "timeout",
        }
    }

    /// Statuses a job may move into this one from.
    pub fn predecessors(&self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[Self::Retry],
            Self::Running => &[Self::Pending],
            Self::Completed | Self::Failed | Self::Retry | Self::Timeout => &[Self::Running],
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.predecessors().contains(self)
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Whether the job occupies a concurrency slot.
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::validation("job_status", format!("unknown status '{}'", s)))
    }
}

/// Named stage of the remediation pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    /// Classify the upload and pick the processing path.
    Route,
    /// Optical character recognition.
    Ocr,
    /// Structure detection (headings, tables, lists).
    Structure,
    /// Alternative text generation for figures.
    AltText,
    /// Accessibility tagging.
    Tag,
    /// Output format generation.
    Export,
    /// Compliance validation.
    Validate,
    /// Owner notification.
    Notify,
}

impl PipelineStep {
    /// The fixed step order.
    pub const ALL: [PipelineStep; 8] = [
        Self::Route,
        Self::Ocr,
        Self::Structure,
        Self::AltText,
        Self::Tag,
        Self::Export,
        Self::Validate,
        Self::Notify,
    ];

    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Route => "route",
            Self::Ocr => "ocr",
            Self::Structure => "structure",
            Self::AltText => "alt_text",
            Self::Tag => "tag",
            Self::Export => "export",
            Self::Validate => "validate",
            Self::Notify => "notify",
        }
    }

    /// Zero-based position in the pipeline.
    pub fn position(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or_default()
    }

    /// The step that follows this one, if any.
    pub fn next(&self) -> Option<PipelineStep> {
        Self::ALL.get(self.position() + 1).copied()
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStep {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "notifier" => return Ok(Self::Notify),
            "alt-text" | "alttext" => return Ok(Self::AltText),
            "validator" => return Ok(Self::Validate),
            "router" => return Ok(Self::Route),
            _ => {}
        }
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == normalized)
            .ok_or_else(|| CoreError::validation("step", format!("unknown pipeline step '{}'", s)))
    }
}

/// Backoff policy applied when a failed job is routed to `retry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether failures may be retried at all.
    pub enabled: bool,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Delay before the first retry.
    pub initial_delay_secs: u64,
    /// Upper bound for any single delay.
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            backoff_multiplier: 2.0,
            initial_delay_secs: 60,
            max_delay_secs: 3600,
        }
    }
}

impl RetryPolicy {
    /// Delay before re-admitting a job that has failed `attempts` times.
    ///
    /// `min(initial * multiplier^(attempts - 1), max)`.
    pub fn delay_for_attempt(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).max(0);
        let raw = self.initial_delay_secs as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_secs as f64).max(0.0);
        // Values past `Duration::MAX` fall back to the configured cap.
        Duration::try_from_secs_f64(capped).unwrap_or(Duration::from_secs(self.max_delay_secs))
    }
}

/// Execution budget recorded on the job itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimeoutPolicy {
    /// Maximum execution time before the job is considered overdue.
    pub execution_timeout_secs: i64,
    /// Expected interval between worker heartbeats.
    pub heartbeat_interval_secs: i64,
}

impl Default for JobTimeoutPolicy {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 3600,
            heartbeat_interval_secs: 60,
        }
    }
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress.
    Info,
    /// Recoverable problem.
    Warning,
    /// Failure.
    Error,
}

impl LogLevel {
    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(CoreError::validation(
                "log_level",
                format!("unknown level '{}'", other),
            )),
        }
    }
}

/// Structured entry in a job's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload.
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create an entry stamped with `timestamp`.
    pub fn new(level: LogLevel, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            level,
            message: message.into(),
            details: None,
        }
    }

    /// Attach a structured payload.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
