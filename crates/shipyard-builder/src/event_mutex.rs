// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed mutex admitting one handler per docker event.
//!
//! Every API replica receives every die event. The first replica to insert
//! the event's lease row handles it; the others see `false` and move on.
//! Leases expire after the configured TTL so a crashed holder cannot wedge
//! an event forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shipyard_core::Persistence;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

const KEY_PREFIX: &str = "docker-event:";

/// Event mutex over the shared lease table.
pub struct DockerEventMutex {
    persistence: Arc<dyn Persistence>,
    ttl: Duration,
    // event id -> holder token of the lease this process owns
    held: Mutex<HashMap<String, String>>,
}

impl DockerEventMutex {
    /// Create a mutex whose leases expire after `ttl`.
    pub fn new(persistence: Arc<dyn Persistence>, ttl: Duration) -> Self {
        Self {
            persistence,
            ttl,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn key(event_id: &str) -> String {
        format!("{KEY_PREFIX}{event_id}")
    }

    /// Try to take the event. `Ok(false)` means another holder owns it.
    pub async fn lock(&self, event_id: &str) -> Result<bool> {
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .persistence
            .try_acquire_lock(&Self::key(event_id), &token, self.ttl)
            .await?;

        if acquired {
            if let Ok(mut held) = self.held.lock() {
                held.insert(event_id.to_string(), token);
            }
            debug!(event_id = %event_id, "Event locked");
        } else {
            debug!(event_id = %event_id, "Event already locked by another holder");
        }
        Ok(acquired)
    }

    /// Release the event. Safe to call more than once.
    pub async fn unlock(&self, event_id: &str) -> Result<()> {
        let token = self
            .held
            .lock()
            .ok()
            .and_then(|mut held| held.remove(event_id));

        let Some(token) = token else {
            return Ok(());
        };

        let released = self
            .persistence
            .release_lock(&Self::key(event_id), &token)
            .await?;
        if !released {
            warn!(event_id = %event_id, "Event lease expired before unlock");
        }
        Ok(())
    }

    /// Number of events this process currently holds.
    pub fn held_count(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_store;
    use futures::future::join_all;

    #[tokio::test]
    async fn test_concurrent_lock_admits_exactly_one() {
        let store = memory_store().await;
        // Separate mutex per simulated replica
        let replicas: Vec<_> = (0..10)
            .map(|_| DockerEventMutex::new(store.clone(), Duration::from_secs(60)))
            .collect();

        let results = join_all(replicas.iter().map(|m| m.lock("evt-1"))).await;

        let admitted = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_unlock_frees_event_and_is_idempotent() {
        let store = memory_store().await;
        let a = DockerEventMutex::new(store.clone(), Duration::from_secs(60));
        let b = DockerEventMutex::new(store.clone(), Duration::from_secs(60));

        assert!(a.lock("evt-2").await.unwrap());
        assert!(!b.lock("evt-2").await.unwrap());
        assert_eq!(a.held_count(), 1);

        a.unlock("evt-2").await.unwrap();
        a.unlock("evt-2").await.unwrap();
        assert_eq!(a.held_count(), 0);

        assert!(b.lock("evt-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_same_process_relock_conflicts() {
        let store = memory_store().await;
        let mutex = DockerEventMutex::new(store, Duration::from_secs(60));

        assert!(mutex.lock("evt-3").await.unwrap());
        assert!(!mutex.lock("evt-3").await.unwrap());
    }

    #[tokio::test]
    async fn test_unlock_of_foreign_event_leaves_lease() {
        let store = memory_store().await;
        let a = DockerEventMutex::new(store.clone(), Duration::from_secs(60));
        let b = DockerEventMutex::new(store.clone(), Duration::from_secs(60));

        assert!(a.lock("evt-4").await.unwrap());
        b.unlock("evt-4").await.unwrap();
        assert!(!b.lock("evt-4").await.unwrap());
    }
}
