// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for accessdoc-core.
//!
//! Provides a unified error type with stable codes that upstream API layers
//! can translate into user-facing responses.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors raised by the persistence layer and the enforcers.
///
/// Quota violations and timeout events are data, not errors: they are
/// returned as [`crate::quota::QuotaDecision`] and
/// [`crate::timeout::SweepReport`] respectively.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Document was not found in the store.
    DocumentNotFound {
        /// The document ID that was not found.
        document_id: String,
    },

    /// Job was not found in the store.
    JobNotFound {
        /// The job ID that was not found.
        job_id: String,
    },

    /// A record with the same key already exists (duplicate create).
    AlreadyExists {
        /// Kind of record ("document", "job", ...).
        entity: &'static str,
        /// The conflicting identifier.
        id: String,
    },

    /// Job is in a state that does not allow the requested operation.
    InvalidJobState {
        /// The job ID.
        job_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DocumentNotFound { .. } => "DOCUMENT_NOT_FOUND",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::InvalidJobState { .. } => "INVALID_JOB_STATE",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Shorthand for a [`CoreError::ValidationError`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Map an insert failure, turning unique-key violations into
    /// [`CoreError::AlreadyExists`] and dangling references into
    /// [`CoreError::ValidationError`].
    pub fn from_insert(err: sqlx::Error, entity: &'static str, id: &str) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return Self::AlreadyExists {
                    entity,
                    id: id.to_string(),
                };
            }
            if db_err.is_foreign_key_violation() {
                return Self::ValidationError {
                    field: entity.to_string(),
                    message: format!("{} '{}' references a record that does not exist", entity, id),
                };
            }
        }
        Self::DatabaseError {
            operation: format!("insert_{}", entity),
            details: err.to_string(),
        }
    }

    /// Whether the caller may safely treat this as an idempotent retry.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DocumentNotFound { document_id } => {
                write!(f, "Document '{}' not found", document_id)
            }
            Self::JobNotFound { job_id } => {
                write!(f, "Job '{}' not found", job_id)
            }
            Self::AlreadyExists { entity, id } => {
                write!(f, "{} '{}' already exists", entity, id)
            }
            Self::InvalidJobState {
                job_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Job '{}' is in invalid state: expected '{}', got '{}'",
                    job_id, expected, actual
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                CoreError::DocumentNotFound {
                    document_id: "doc-1".to_string(),
                },
                "DOCUMENT_NOT_FOUND",
            ),
            (
                CoreError::JobNotFound {
                    job_id: "job-1".to_string(),
                },
                "JOB_NOT_FOUND",
            ),
            (
                CoreError::AlreadyExists {
                    entity: "document",
                    id: "doc-1".to_string(),
                },
                "ALREADY_EXISTS",
            ),
            (
                CoreError::InvalidJobState {
                    job_id: "job-1".to_string(),
                    expected: "running".to_string(),
                    actual: "completed".to_string(),
                },
                "INVALID_JOB_STATE",
            ),
            (CoreError::validation("page_size", "too big"), "VALIDATION_ERROR"),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "connection lost".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(error.error_code(), expected_code, "wrong code for {:?}", error);
        }
    }

    #[test]
    fn test_display_messages() {
        let err = CoreError::InvalidJobState {
            job_id: "job-9".to_string(),
            expected: "running".to_string(),
            actual: "timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Job 'job-9' is in invalid state: expected 'running', got 'timeout'"
        );

        let err = CoreError::AlreadyExists {
            entity: "document",
            id: "doc-1".to_string(),
        };
        assert_eq!(err.to_string(), "document 'doc-1' already exists");
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_from_sqlx_error() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        match err {
            CoreError::DatabaseError { operation, .. } => assert_eq!(operation, "query"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_from_insert_non_unique_is_database_error() {
        let err = CoreError::from_insert(sqlx::Error::PoolTimedOut, "job", "job-1");
        assert_eq!(err.error_code(), "DATABASE_ERROR");
        assert!(!err.is_already_exists());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: CoreError = json_err.into();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
