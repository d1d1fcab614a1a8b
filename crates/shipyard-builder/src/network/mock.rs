// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock network allocator for testing.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use shipyard_core::model::NetworkInfo;

use super::{NetworkAllocator, NetworkError};

/// In-memory allocator handing out sequential hosts.
#[derive(Default)]
pub struct MockNetwork {
    allocated: Mutex<Vec<NetworkInfo>>,
    deleted: Mutex<Vec<NetworkInfo>>,
    create_calls: AtomicU32,
    /// Every allocation fails
    pub fail_create: AtomicBool,
    /// Every release fails
    pub fail_delete: AtomicBool,
}

impl MockNetwork {
    /// Create a working allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator whose allocations always fail.
    pub fn failing() -> Self {
        let network = Self::default();
        network.fail_create.store(true, Ordering::SeqCst);
        network
    }

    /// Number of allocation attempts.
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Hosts released so far.
    pub fn deleted(&self) -> Vec<NetworkInfo> {
        self.deleted.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Hosts allocated so far.
    pub fn allocated(&self) -> Vec<NetworkInfo> {
        self.allocated.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NetworkAllocator for MockNetwork {
    async fn find_or_create_host(
        &self,
        dock_host: &str,
        owner_github: i64,
    ) -> Result<NetworkInfo, NetworkError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(NetworkError::Unavailable {
                host: dock_host.to_string(),
                message: "allocator down".to_string(),
            });
        }
        let info = NetworkInfo {
            network_ip: format!("10.{}.0.0", owner_github % 256),
            host_ip: format!("10.{}.0.{}", owner_github % 256, n),
        };
        if let Ok(mut allocated) = self.allocated.lock() {
            allocated.push(info.clone());
        }
        Ok(info)
    }

    async fn delete_host(
        &self,
        dock_host: &str,
        network: &NetworkInfo,
    ) -> Result<(), NetworkError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(NetworkError::Unavailable {
                host: dock_host.to_string(),
                message: "allocator down".to_string(),
            });
        }
        if let Ok(mut deleted) = self.deleted.lock() {
            deleted.push(network.clone());
        }
        Ok(())
    }
}
