// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! accessdoc-core - Bookkeeping for the Accessibility Remediation Pipeline
//!
//! This crate owns the durable state of the remediation pipeline: documents
//! uploaded by users, the processing jobs run for them, per-organization
//! quotas, and the timeout rules applied to running jobs. Pipeline workers
//! (OCR, structure tagging, alt-text, validation, notification) live
//! elsewhere and talk to this crate through its repositories.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                Upload API / Pipeline Workers                          │
//! └──────────────────────────────────────────────────────────────────────┘
//!         │ check / increment          │ create / claim / heartbeat
//!         ▼                            ▼
//! ┌──────────────────┐      ┌──────────────────────────────────────────┐
//! │  QuotaEnforcer   │      │            PersistenceManager             │
//! │  (cached, fails  │─────►│   primary store  ──mirror──►  secondary   │
//! │   open)          │      │   (reads+writes)             (writes only)│
//! └──────────────────┘      └──────────────────────────────────────────┘
//!                                  ▲                 │          │
//! ┌──────────────────┐             │                 ▼          ▼
//! │ TimeoutEnforcer  │─────────────┤          ┌──────────┐ ┌──────────┐
//! │ (periodic sweep) │             │          │PostgreSQL│ │  SQLite  │
//! └──────────────────┘             │          └──────────┘ └──────────┘
//! ┌──────────────────┐             │
//! │ RetentionWorker  │─────────────┘
//! └──────────────────┘
//! ```
//!
//! # Lifecycles
//!
//! Documents:
//!
//! ```text
//! pending ──► processing ──┬──► completed
//!                          ├──► failed
//!                          ├──► validation_failed
//!                          └──► notification_failed
//! ```
//!
//! Jobs:
//!
//! ```text
//!          ┌──────── retry ◄───┐
//!          ▼                   │
//! pending ──► running ──┬──────┘
//!                       ├──► completed
//!                       ├──► failed
//!                       └──► timeout
//! ```
//!
//! Every transition is a conditional update on the current status, so two
//! actors racing on the same row never both succeed.
//!
//! # Dual-write
//!
//! During a backend migration [`persistence::PersistenceManager`] applies
//! each mutation to the primary store first and then replays it on the
//! secondary. Secondary failures are logged and counted but never surface
//! to the caller. Reads only touch the primary.
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables.

#![deny(missing_docs)]

/// Short-lived in-memory cache with per-entry expiry.
pub mod cache;

/// Service configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Document and job states, pipeline steps, and log entries.
pub mod lifecycle;

/// Embedded schema migrations for both backends.
pub mod migrations;

/// Repository contracts, the PostgreSQL and SQLite stores, and dual-write.
pub mod persistence;

/// Per-organization quota checks and usage accounting.
pub mod quota;

/// Background deletion of expired terminal rows.
pub mod retention;

/// Detection and handling of overdue jobs.
pub mod timeout;

pub use config::{Config, ConfigError, ConfigProvider};
pub use error::CoreError;
pub use persistence::{PersistenceManager, Store};
pub use quota::{QuotaEnforcer, QuotaEnforcerConfig};
pub use retention::{RetentionWorker, RetentionWorkerConfig};
pub use timeout::{TimeoutEnforcer, TimeoutEnforcerConfig};
