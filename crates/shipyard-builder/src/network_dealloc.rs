// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release an image builder's network host once the container is gone.
//!
//! Runs as a detached task next to the completion flow. Its outcome never
//! reaches the build result.

use std::sync::Arc;

use shipyard_core::Persistence;
use shipyard_core::model::NetworkInfo;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::network::NetworkAllocator;
use crate::retry::RetryPolicy;

/// Spawn the lookup and release of the network recorded for `container_id`.
/// `dock_host` is used when the context version has no dock of its own.
/// Errors are logged inside the task; the handle is only useful to tests
/// that want to wait for it.
pub fn deallocate_network(
    persistence: Arc<dyn Persistence>,
    allocator: Arc<dyn NetworkAllocator>,
    retry: RetryPolicy,
    container_id: String,
    dock_host: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let versions = match persistence
            .find_context_versions_by_container(&container_id)
            .await
        {
            Ok(versions) => versions,
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Network lookup failed, not deallocating");
                return;
            }
        };
        let Some((network, dock_host)) = versions.into_iter().find_map(|cv| {
            let host = cv.build.docker_host.unwrap_or_else(|| dock_host.clone());
            cv.build.network.map(|network| (network, host))
        }) else {
            debug!(container_id = %container_id, "Image builder had no network");
            return;
        };
        release(allocator, retry, &dock_host, &network).await;
    })
}

async fn release(
    allocator: Arc<dyn NetworkAllocator>,
    retry: RetryPolicy,
    dock_host: &str,
    network: &NetworkInfo,
) {
    let result = retry
        .run("delete_host", |_| allocator.delete_host(dock_host, network))
        .await;
    match result {
        Ok(()) => info!(
            dock_host = %dock_host,
            network_ip = %network.network_ip,
            host_ip = %network.host_ip,
            "Image builder network deallocated"
        ),
        Err(e) => error!(
            dock_host = %dock_host,
            host_ip = %network.host_ip,
            error = %e,
            "Image builder network deallocation failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MockNetwork;
    use crate::test_support::{memory_store, started_cv};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn net() -> NetworkInfo {
        NetworkInfo {
            network_ip: "10.1.0.0".into(),
            host_ip: "10.1.0.2".into(),
        }
    }

    async fn store_with_builder(network: Option<NetworkInfo>) -> Arc<dyn Persistence> {
        let persistence = memory_store().await;
        let mut cv = started_cv("cv-1", "b-1");
        cv.build.docker_container = Some("c-1".into());
        cv.build.docker_host = Some("h1".into());
        cv.build.network = network;
        persistence.insert_context_version(&cv).await.unwrap();
        persistence
    }

    #[tokio::test]
    async fn test_releases_host() {
        let persistence = store_with_builder(Some(net())).await;
        let allocator = Arc::new(MockNetwork::new());

        let handle = deallocate_network(
            persistence,
            allocator.clone(),
            RetryPolicy::once(),
            "c-1".into(),
            "fallback".into(),
        );
        // Nothing runs until the caller yields
        assert!(allocator.deleted().is_empty());

        handle.await.unwrap();
        assert_eq!(allocator.deleted(), vec![net()]);
    }

    #[tokio::test]
    async fn test_no_network_is_a_noop() {
        let persistence = store_with_builder(None).await;
        let allocator = Arc::new(MockNetwork::new());
        deallocate_network(
            persistence,
            allocator.clone(),
            RetryPolicy::once(),
            "c-1".into(),
            "h1".into(),
        )
        .await
        .unwrap();
        assert!(allocator.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_failure_stays_inside_task() {
        let persistence = store_with_builder(Some(net())).await;
        let allocator = Arc::new(MockNetwork::new());
        allocator.fail_delete.store(true, Ordering::SeqCst);
        let handle = deallocate_network(
            persistence,
            allocator.clone(),
            RetryPolicy::new(2, Duration::ZERO),
            "c-1".into(),
            "h1".into(),
        );
        // Task completes normally even though every attempt failed
        assert!(handle.await.is_ok());
        assert!(allocator.deleted().is_empty());
    }
}
