// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for shipyard-builder.

use shipyard_core::CoreError;
use thiserror::Error;

/// Builder errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Core persistence operation failed.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Dock call failed.
    #[error("Dock error: {0}")]
    Dock(#[from] crate::dock::DockError),

    /// Network allocator call failed.
    #[error("Network error: {0}")]
    Network(#[from] crate::network::NetworkError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Event or job payload is missing required fields.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// A record the job refers to does not exist (stale job).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another holder owns the event, or the transition already happened.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for outcomes that are normal under concurrency or redelivery
    /// and must not be alerted on.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Error::MalformedEvent(_) | Error::NotFound(_) | Error::Conflict(_)
        )
    }
}

/// Result type using builder Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_classification() {
        assert!(Error::Conflict("event locked".into()).is_expected());
        assert!(Error::NotFound("cv".into()).is_expected());
        assert!(Error::MalformedEvent("uuid".into()).is_expected());
        assert!(!Error::Other("boom".into()).is_expected());
        assert!(!Error::Core(CoreError::DatabaseError {
            operation: "x".into(),
            details: "y".into()
        })
        .is_expected());
    }
}
