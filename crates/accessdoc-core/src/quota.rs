// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-organization admission control.
//!
//! [`QuotaEnforcer::check`] answers whether `delta` more units of a resource
//! fit under the organization's limit; [`QuotaEnforcer::increment`] records
//! consumed units. Concurrency quotas are counted live from the job table,
//! every other type reads a per-period counter through a short-lived cache.
//!
//! The enforcer fails open: an internal error during a check admits the
//! request and logs a warning. Violations it does detect are always
//! reported as not-allowed, even when the audit row cannot be written.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cache::ExpiringCache;
use crate::error::CoreError;
use crate::persistence::{
    NewQuotaViolation, QuotaLimitRecord, QuotaViolationRecord, Store, UsageIncrement,
};

/// Limit value meaning "no ceiling".
pub const UNLIMITED: i64 = -1;

const GIB: i64 = 1024 * 1024 * 1024;

/// Metered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Documents processed per calendar month.
    ProcessingMonthly,
    /// Stored bytes.
    #[serde(rename = "storage_bytes_total")]
    StorageTotal,
    /// API calls per calendar month.
    ApiCallsMonthly,
    /// Jobs pending or running at once.
    ConcurrentJobs,
    /// Downloaded bytes per calendar month.
    #[serde(rename = "bandwidth_bytes_monthly")]
    BandwidthMonthly,
    /// Stored files.
    FilesTotal,
}

impl ResourceType {
    /// Every metered resource.
    pub const ALL: [ResourceType; 6] = [
        Self::ProcessingMonthly,
        Self::StorageTotal,
        Self::ApiCallsMonthly,
        Self::ConcurrentJobs,
        Self::BandwidthMonthly,
        Self::FilesTotal,
    ];

    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessingMonthly => "processing_monthly",
            Self::StorageTotal => "storage_bytes_total",
            Self::ApiCallsMonthly => "api_calls_monthly",
            Self::ConcurrentJobs => "concurrent_jobs",
            Self::BandwidthMonthly => "bandwidth_bytes_monthly",
            Self::FilesTotal => "files_total",
        }
    }

    /// Window over which usage accumulates.
    pub fn period(&self) -> PeriodKind {
        match self {
            Self::ProcessingMonthly | Self::ApiCallsMonthly | Self::BandwidthMonthly => {
                PeriodKind::Monthly
            }
            Self::StorageTotal | Self::FilesTotal => PeriodKind::Total,
            Self::ConcurrentJobs => PeriodKind::Concurrent,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|rt| rt.as_str() == s)
            .ok_or_else(|| {
                CoreError::validation("resource_type", format!("unknown resource type '{}'", s))
            })
    }
}

/// Subscription tier; determines default limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Free plan.
    Free,
    /// Basic plan.
    Basic,
    /// Professional plan.
    Pro,
    /// Enterprise plan, unlimited.
    Enterprise,
}

impl Tier {
    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    /// Default ceiling for `resource` on this tier.
    pub fn default_limit(&self, resource: ResourceType) -> i64 {
        use ResourceType::*;

        match (self, resource) {
            (Self::Enterprise, _) => UNLIMITED,

            (Self::Free, ProcessingMonthly) => 50,
            (Self::Free, StorageTotal) => GIB,
            (Self::Free, ApiCallsMonthly) => 1_000,
            (Self::Free, ConcurrentJobs) => 2,
            (Self::Free, BandwidthMonthly) => 5 * GIB,
            (Self::Free, FilesTotal) => 100,

            (Self::Basic, ProcessingMonthly) => 500,
            (Self::Basic, StorageTotal) => 10 * GIB,
            (Self::Basic, ApiCallsMonthly) => 10_000,
            (Self::Basic, ConcurrentJobs) => 5,
            (Self::Basic, BandwidthMonthly) => 50 * GIB,
            (Self::Basic, FilesTotal) => 1_000,

            (Self::Pro, ProcessingMonthly) => 5_000,
            (Self::Pro, StorageTotal) => 100 * GIB,
            (Self::Pro, ApiCallsMonthly) => 100_000,
            (Self::Pro, ConcurrentJobs) => 20,
            (Self::Pro, BandwidthMonthly) => 500 * GIB,
            (Self::Pro, FilesTotal) => 10_000,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "pro" | "professional" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(CoreError::validation("tier", format!("unknown tier '{}'", other))),
        }
    }
}

/// How a resource's usage is windowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    /// Calendar month in UTC.
    Monthly,
    /// Live count, never stored.
    Concurrent,
    /// Open-ended.
    Total,
}

impl PeriodKind {
    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Concurrent => "concurrent",
            Self::Total => "total",
        }
    }
}

impl FromStr for PeriodKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(Self::Monthly),
            "concurrent" => Ok(Self::Concurrent),
            "total" => Ok(Self::Total),
            other => Err(CoreError::validation(
                "period",
                format!("unknown period '{}'", other),
            )),
        }
    }
}

/// Concrete counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaWindow {
    /// Window kind.
    pub kind: PeriodKind,
    /// First instant of the window.
    pub start: DateTime<Utc>,
    /// Last instant of the window.
    pub end: DateTime<Utc>,
}

impl QuotaWindow {
    /// Window of `kind` containing `now`; `None` for live counts.
    pub fn containing(kind: PeriodKind, now: DateTime<Utc>) -> Option<Self> {
        match kind {
            PeriodKind::Concurrent => None,
            PeriodKind::Monthly => {
                let start = Utc
                    .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                    .single()?;
                let (next_year, next_month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                let next = Utc
                    .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
                    .single()?;
                Some(Self {
                    kind,
                    start,
                    end: next - chrono::Duration::microseconds(1),
                })
            }
            PeriodKind::Total => Some(Self {
                kind,
                start: Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).single()?,
                end: Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).single()?,
            }),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaDecision {
    /// Whether the work may proceed.
    pub allowed: bool,
    /// Organization checked.
    pub organization_id: String,
    /// Resource checked.
    pub resource_type: ResourceType,
    /// Usage before the request.
    pub current_usage: i64,
    /// Applicable limit, `-1` for unlimited.
    pub limit: i64,
    /// Units requested.
    pub requested: i64,
    /// Set when the request was rejected.
    pub violation: Option<NewQuotaViolation>,
    /// Set when the check could not be evaluated and was admitted anyway.
    pub degraded: bool,
}

impl QuotaDecision {
    /// Units over the limit, zero when allowed.
    pub fn exceeded_by(&self) -> i64 {
        self.violation.as_ref().map(|v| v.exceeded_by).unwrap_or(0)
    }
}

/// Usage of one resource against its limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    /// Resource.
    pub resource_type: ResourceType,
    /// Window kind.
    pub period: PeriodKind,
    /// Current usage.
    pub current_usage: i64,
    /// Limit, `-1` for unlimited.
    pub limit: i64,
    /// Tier the limit came from.
    pub tier: Tier,
    /// Units left, `None` when unlimited.
    pub remaining: Option<i64>,
    /// Percentage of the limit used, `None` when unlimited.
    pub percent_used: Option<f64>,
}

/// Configuration for the quota enforcer.
#[derive(Debug, Clone)]
pub struct QuotaEnforcerConfig {
    /// How long usage and limit lookups are memoized.
    pub cache_ttl: Duration,
    /// Tier for organizations without any stored limit.
    pub default_tier: Tier,
    /// Service name recorded on violations.
    pub service_name: String,
}

impl Default for QuotaEnforcerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            default_tier: Tier::Free,
            service_name: "accessdoc-core".to_string(),
        }
    }
}

type CacheKey = (String, ResourceType);

/// Admission control and usage accounting.
pub struct QuotaEnforcer {
    store: Arc<dyn Store>,
    config: QuotaEnforcerConfig,
    usage_cache: ExpiringCache<CacheKey, (DateTime<Utc>, i64)>,
    limit_cache: ExpiringCache<CacheKey, QuotaLimitRecord>,
}

impl QuotaEnforcer {
    /// Create an enforcer writing through `store`.
    pub fn new(store: Arc<dyn Store>, config: QuotaEnforcerConfig) -> Self {
        Self {
            usage_cache: ExpiringCache::new(config.cache_ttl),
            limit_cache: ExpiringCache::new(config.cache_ttl),
            store,
            config,
        }
    }

    /// Settings the enforcer was built with.
    pub fn config(&self) -> &QuotaEnforcerConfig {
        &self.config
    }

    /// Decide whether `delta` more units fit under the limit.
    pub async fn check(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
        delta: i64,
    ) -> QuotaDecision {
        self.check_at(organization_id, resource_type, delta, Utc::now())
            .await
    }

    /// [`Self::check`] as of `now`.
    pub async fn check_at(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
        delta: i64,
        now: DateTime<Utc>,
    ) -> QuotaDecision {
        match self
            .evaluate(organization_id, resource_type, delta.max(0), now)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    organization_id = %organization_id,
                    resource_type = %resource_type,
                    error = %e,
                    "Quota check failed, admitting request"
                );
                QuotaDecision {
                    allowed: true,
                    organization_id: organization_id.to_string(),
                    resource_type,
                    current_usage: 0,
                    limit: UNLIMITED,
                    requested: delta,
                    violation: None,
                    degraded: true,
                }
            }
        }
    }

    async fn evaluate(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, CoreError> {
        let limit = self.limit_for(organization_id, resource_type, now).await?;
        let current = self.current_usage(organization_id, resource_type, now).await?;
        let projected = current.saturating_add(delta);

        let mut decision = QuotaDecision {
            allowed: true,
            organization_id: organization_id.to_string(),
            resource_type,
            current_usage: current,
            limit: limit.limit_value,
            requested: delta,
            violation: None,
            degraded: false,
        };

        if limit.limit_value == UNLIMITED || projected <= limit.limit_value {
            return Ok(decision);
        }

        let violation = NewQuotaViolation {
            organization_id: organization_id.to_string(),
            resource_type,
            current_usage: current,
            limit_value: limit.limit_value,
            requested: delta,
            exceeded_by: projected - limit.limit_value,
            service: self.config.service_name.clone(),
            occurred_at: now,
        };

        info!(
            organization_id = %organization_id,
            resource_type = %resource_type,
            current_usage = current,
            limit = limit.limit_value,
            requested = delta,
            exceeded_by = violation.exceeded_by,
            "Quota exceeded"
        );

        if let Err(e) = self.store.record_violation(&violation).await {
            error!(
                organization_id = %organization_id,
                resource_type = %resource_type,
                error = %e,
                "Failed to record quota violation"
            );
        }

        decision.allowed = false;
        decision.violation = Some(violation);
        Ok(decision)
    }

    /// Add `amount` consumed units for the current period.
    ///
    /// Zero is a no-op, negative amounts are rejected, and concurrency
    /// resources are never stored. Returns the usage after the call.
    pub async fn increment(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
        amount: i64,
    ) -> Result<i64, CoreError> {
        self.increment_at(organization_id, resource_type, amount, Utc::now())
            .await
    }

    /// [`Self::increment`] as of `now`.
    pub async fn increment_at(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        if amount < 0 {
            return Err(CoreError::validation(
                "amount",
                "usage increments must not be negative",
            ));
        }

        let Some(window) = QuotaWindow::containing(resource_type.period(), now) else {
            return self.store.count_active_jobs(organization_id).await;
        };

        if amount == 0 {
            return self.current_usage(organization_id, resource_type, now).await;
        }

        let usage = self
            .store
            .increment_usage(&UsageIncrement {
                organization_id: organization_id.to_string(),
                resource_type,
                window,
                amount,
                at: now,
            })
            .await?;

        self.usage_cache
            .invalidate(&(organization_id.to_string(), resource_type));

        debug!(
            organization_id = %organization_id,
            resource_type = %resource_type,
            amount = amount,
            usage = usage,
            "Quota usage incremented"
        );

        Ok(usage)
    }

    /// Limit for `resource_type`, creating it from tier defaults on first use.
    pub async fn get_limit(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
    ) -> Result<QuotaLimitRecord, CoreError> {
        self.limit_for(organization_id, resource_type, Utc::now())
            .await
    }

    /// Administrator override of a single limit.
    pub async fn set_limit(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
        limit_value: i64,
    ) -> Result<QuotaLimitRecord, CoreError> {
        if limit_value < UNLIMITED {
            return Err(CoreError::validation(
                "limit_value",
                "must be -1 (unlimited) or a non-negative ceiling",
            ));
        }

        let now = Utc::now();
        let existing = self.store.get_limit(organization_id, resource_type).await?;
        let record = QuotaLimitRecord {
            organization_id: organization_id.to_string(),
            resource_type,
            tier: match &existing {
                Some(limit) => limit.tier,
                None => self.organization_tier(organization_id).await?,
            },
            limit_value,
            overridden: true,
            created_at: existing.map(|l| l.created_at).unwrap_or(now),
            updated_at: now,
        };

        self.store.upsert_limit(&record).await?;
        self.limit_cache
            .invalidate(&(organization_id.to_string(), resource_type));

        info!(
            organization_id = %organization_id,
            resource_type = %resource_type,
            limit = limit_value,
            "Quota limit overridden"
        );

        Ok(record)
    }

    /// Move an organization to `tier`, re-deriving every limit that was not
    /// overridden by an administrator.
    pub async fn set_organization_tier(
        &self,
        organization_id: &str,
        tier: Tier,
    ) -> Result<Vec<QuotaLimitRecord>, CoreError> {
        let now = Utc::now();
        let mut records = Vec::with_capacity(ResourceType::ALL.len());

        for resource_type in ResourceType::ALL {
            let existing = self.store.get_limit(organization_id, resource_type).await?;
            let record = match existing {
                Some(limit) if limit.overridden => QuotaLimitRecord {
                    tier,
                    updated_at: now,
                    ..limit
                },
                other => QuotaLimitRecord {
                    organization_id: organization_id.to_string(),
                    resource_type,
                    tier,
                    limit_value: tier.default_limit(resource_type),
                    overridden: false,
                    created_at: other.map(|l| l.created_at).unwrap_or(now),
                    updated_at: now,
                },
            };
            self.store.upsert_limit(&record).await?;
            self.limit_cache
                .invalidate(&(organization_id.to_string(), resource_type));
            records.push(record);
        }

        info!(organization_id = %organization_id, tier = %tier, "Organization tier changed");
        Ok(records)
    }

    /// Usage against limits for every resource of an organization.
    pub async fn usage_summary(&self, organization_id: &str) -> Result<Vec<UsageSummary>, CoreError> {
        self.usage_summary_at(organization_id, Utc::now()).await
    }

    /// [`Self::usage_summary`] as of `now`.
    pub async fn usage_summary_at(
        &self,
        organization_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<UsageSummary>, CoreError> {
        let mut summaries = Vec::with_capacity(ResourceType::ALL.len());
        for resource_type in ResourceType::ALL {
            let limit = self.limit_for(organization_id, resource_type, now).await?;
            let current = self.current_usage(organization_id, resource_type, now).await?;
            let (remaining, percent_used) = if limit.limit_value == UNLIMITED {
                (None, None)
            } else if limit.limit_value == 0 {
                (Some(0), Some(if current > 0 { 100.0 } else { 0.0 }))
            } else {
                (
                    Some((limit.limit_value - current).max(0)),
                    Some(current as f64 * 100.0 / limit.limit_value as f64),
                )
            };
            summaries.push(UsageSummary {
                resource_type,
                period: resource_type.period(),
                current_usage: current,
                limit: limit.limit_value,
                tier: limit.tier,
                remaining,
                percent_used,
            });
        }
        Ok(summaries)
    }

    /// Violations recorded for an organization since `since`.
    pub async fn list_violations(
        &self,
        organization_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<QuotaViolationRecord>, CoreError> {
        self.store.list_violations(organization_id, since).await
    }

    async fn limit_for(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
        now: DateTime<Utc>,
    ) -> Result<QuotaLimitRecord, CoreError> {
        let key = (organization_id.to_string(), resource_type);
        if let Some(limit) = self.limit_cache.get_at(&key, now) {
            return Ok(limit);
        }

        let limit = match self.store.get_limit(organization_id, resource_type).await? {
            Some(limit) => limit,
            None => {
                let tier = self.organization_tier(organization_id).await?;
                let defaults = QuotaLimitRecord {
                    organization_id: organization_id.to_string(),
                    resource_type,
                    tier,
                    limit_value: tier.default_limit(resource_type),
                    overridden: false,
                    created_at: now,
                    updated_at: now,
                };
                debug!(
                    organization_id = %organization_id,
                    resource_type = %resource_type,
                    tier = %tier,
                    "Creating quota limit from tier defaults"
                );
                self.store.insert_limit_if_absent(&defaults).await?
            }
        };

        self.limit_cache.insert_at(key, limit.clone(), now);
        Ok(limit)
    }

    /// Tier of any stored limit of the organization, else the default tier.
    async fn organization_tier(&self, organization_id: &str) -> Result<Tier, CoreError> {
        let limits = self.store.list_limits(organization_id).await?;
        Ok(limits
            .first()
            .map(|l| l.tier)
            .unwrap_or(self.config.default_tier))
    }

    async fn current_usage(
        &self,
        organization_id: &str,
        resource_type: ResourceType,
        now: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        let Some(window) = QuotaWindow::containing(resource_type.period(), now) else {
            return self.store.count_active_jobs(organization_id).await;
        };

        let key = (organization_id.to_string(), resource_type);
        if let Some((start, usage)) = self.usage_cache.get_at(&key, now)
            && start == window.start
        {
            return Ok(usage);
        }

        let usage = self
            .store
            .get_usage(organization_id, resource_type, window.start)
            .await?
            .map(|u| u.current_usage)
            .unwrap_or(0);
        self.usage_cache.insert_at(key, (window.start, usage), now);
        Ok(usage)
    }
}
