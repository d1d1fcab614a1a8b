// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Isolation guard.
//!
//! A redeploy fan-out must not race an isolation group's own kill/redeploy
//! cycle. Masters of a group that redeploys on kill get a kill-isolation job
//! instead of a container create.

use std::sync::Arc;

use futures::future::join_all;
use shipyard_core::Persistence;
use shipyard_core::model::Instance;
use tracing::{debug, error, info, warn};

use crate::jobs::{Job, JobQueue, KillIsolationJob};

/// Filters fan-out candidates through their isolation groups.
pub struct IsolationGuard {
    persistence: Arc<dyn Persistence>,
    jobs: Arc<dyn JobQueue>,
}

impl IsolationGuard {
    /// Create a guard.
    pub fn new(persistence: Arc<dyn Persistence>, jobs: Arc<dyn JobQueue>) -> Self {
        Self { persistence, jobs }
    }

    /// Return the instances that should be deployed normally, in their
    /// original order. Instances are checked concurrently.
    pub async fn filter(&self, instances: Vec<Instance>) -> Vec<Instance> {
        let keep = join_all(instances.iter().map(|i| self.passes(i))).await;
        instances
            .into_iter()
            .zip(keep)
            .filter_map(|(instance, keep)| keep.then_some(instance))
            .collect()
    }

    async fn passes(&self, instance: &Instance) -> bool {
        let Some(isolation_id) = instance.isolated.as_deref() else {
            return true;
        };
        if !instance.is_isolation_group_master {
            return true;
        }

        debug!(instance_id = %instance.id, isolation_id = %isolation_id, "Searching for isolation");
        match self
            .persistence
            .find_redeployable_isolation(isolation_id)
            .await
        {
            Ok(Some(_)) => {
                let job = Job::KillIsolation(KillIsolationJob {
                    isolation_id: isolation_id.to_string(),
                    trigger_redeploy: true,
                });
                if let Err(e) = self.jobs.publish(&job).await {
                    error!(isolation_id = %isolation_id, error = %e, "Failed to publish kill-isolation");
                }
                info!(
                    instance_id = %instance.id,
                    isolation_id = %isolation_id,
                    "Isolation master redeploys via kill"
                );
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(
                    instance_id = %instance.id,
                    isolation_id = %isolation_id,
                    error = %e,
                    "Isolation lookup failed, deploying normally"
                );
                true
            }
        }
    }
}
