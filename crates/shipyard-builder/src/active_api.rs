// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Active-API lease.
//!
//! Die events are only handled by the replica holding the `active-api`
//! lease. The holder renews it on every check; when it stops renewing, the
//! lease expires and another replica takes over.

use std::sync::Arc;
use std::time::Duration;

use shipyard_core::Persistence;
use tracing::info;

use crate::error::Result;

const LEASE_KEY: &str = "active-api";

/// Renewing leadership lease.
pub struct ActiveApi {
    persistence: Arc<dyn Persistence>,
    holder: String,
    ttl: Duration,
}

impl ActiveApi {
    /// Create a lease handle for this process.
    pub fn new(persistence: Arc<dyn Persistence>, holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            persistence,
            holder: holder.into(),
            ttl,
        }
    }

    /// Holder id of this process.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// True when this process holds (and has just renewed) the lease.
    pub async fn is_me(&self) -> Result<bool> {
        Ok(self
            .persistence
            .try_acquire_lock(LEASE_KEY, &self.holder, self.ttl)
            .await?)
    }

    /// Give the lease up so another replica can take over immediately.
    pub async fn release(&self) -> Result<()> {
        if self.persistence.release_lock(LEASE_KEY, &self.holder).await? {
            info!(holder = %self.holder, "Active API lease released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_store;

    #[tokio::test]
    async fn test_only_one_replica_is_active() {
        let store = memory_store().await;
        let a = ActiveApi::new(store.clone(), "api-a", Duration::from_secs(30));
        let b = ActiveApi::new(store.clone(), "api-b", Duration::from_secs(30));

        assert!(a.is_me().await.unwrap());
        assert!(!b.is_me().await.unwrap());
        // Renewal by the holder keeps it active
        assert!(a.is_me().await.unwrap());
    }

    #[tokio::test]
    async fn test_release_hands_over() {
        let store = memory_store().await;
        let a = ActiveApi::new(store.clone(), "api-a", Duration::from_secs(30));
        let b = ActiveApi::new(store.clone(), "api-b", Duration::from_secs(30));

        assert!(a.is_me().await.unwrap());
        a.release().await.unwrap();
        assert!(b.is_me().await.unwrap());
        assert!(!a.is_me().await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let store = memory_store().await;
        let a = ActiveApi::new(store.clone(), "api-a", Duration::ZERO);
        let b = ActiveApi::new(store.clone(), "api-b", Duration::from_secs(30));

        assert!(a.is_me().await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(b.is_me().await.unwrap());
    }
}
