// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for shipyard-core.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors returned by the persistence layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Context version was not found.
    ContextVersionNotFound {
        /// The query that matched nothing.
        query: String,
    },

    /// Context was not found.
    ContextNotFound {
        /// The context id.
        context_id: String,
    },

    /// Build was not found.
    BuildNotFound {
        /// The build id.
        build_id: String,
    },

    /// Instance was not found.
    InstanceNotFound {
        /// The instance id.
        instance_id: String,
    },

    /// Record already exists (duplicate insert).
    AlreadyExists {
        /// Entity kind.
        entity: &'static str,
        /// The duplicate id.
        id: String,
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
            Self::ContextVersionNotFound { .. } => "CONTEXT_VERSION_NOT_FOUND",
            Self::ContextNotFound { .. } => "CONTEXT_NOT_FOUND",
            Self::BuildNotFound { .. } => "BUILD_NOT_FOUND",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// True for lookups that matched nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ContextVersionNotFound { .. }
                | Self::ContextNotFound { .. }
                | Self::BuildNotFound { .. }
                | Self::InstanceNotFound { .. }
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextVersionNotFound { query } => {
                write!(f, "ContextVersion not found: {}", query)
            }
            Self::ContextNotFound { context_id } => {
                write!(f, "Context '{}' not found", context_id)
            }
            Self::BuildNotFound { build_id } => write!(f, "Build '{}' not found", build_id),
            Self::InstanceNotFound { instance_id } => {
                write!(f, "Instance '{}' not found", instance_id)
            }
            Self::AlreadyExists { entity, id } => {
                write!(f, "{} '{}' already exists", entity, id)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error on '{}': {}", field, message)
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
