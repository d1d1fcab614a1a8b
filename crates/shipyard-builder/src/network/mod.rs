// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network allocator (Sauron) clients.
//!
//! Every dock runs an allocator that hands out private host addresses on a
//! per-owner network. Image builders get a host on creation and release it
//! once the container is gone.

pub mod http;
pub mod mock;

pub use http::SauronClient;
pub use mock::MockNetwork;

use async_trait::async_trait;
use shipyard_core::model::NetworkInfo;
use thiserror::Error;

/// Errors from the network allocator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NetworkError {
    /// Allocator could not be reached.
    #[error("Network allocator unavailable at {host}: {message}")]
    Unavailable {
        /// Allocator address.
        host: String,
        /// Transport error.
        message: String,
    },

    /// Allocator answered with an unexpected status.
    #[error("Network allocator returned status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// Dock address could not be turned into an allocator URL.
    #[error("Invalid dock host: {0}")]
    InvalidHost(String),

    /// Response body could not be decoded.
    #[error("Invalid network allocator response: {0}")]
    InvalidResponse(String),
}

/// Allocates and releases builder hosts on a dock's private networks.
#[async_trait]
pub trait NetworkAllocator: Send + Sync {
    /// Find the owner's network on the dock, creating it if needed, and
    /// allocate a host on it.
    async fn find_or_create_host(
        &self,
        dock_host: &str,
        owner_github: i64,
    ) -> Result<NetworkInfo, NetworkError>;

    /// Release a host. Releasing an unknown host is not an error.
    async fn delete_host(&self, dock_host: &str, network: &NetworkInfo)
    -> Result<(), NetworkError>;
}
