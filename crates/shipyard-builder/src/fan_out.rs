// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fan-out of a successful build to the instances that should run it.
//!
//! Two candidate lists exist: instances already deployed from this build
//! (the explicit list) and, for autodeploy builds, unlocked instances
//! tracking the pushed repo and branch. A non-empty explicit list wins.

use std::sync::Arc;

use shipyard_core::Persistence;
use shipyard_core::model::{ContextVersion, Instance};
use tracing::{debug, error, info, trace, warn};

use crate::events::{InstanceAction, UpdateEmitter, UpdateEvent};
use crate::isolation::IsolationGuard;
use crate::jobs::{CreateInstanceContainerJob, InstanceDeployedJob, Job, JobQueue};

/// Who the continuation jobs are issued for.
#[derive(Debug, Clone)]
pub struct Requester {
    /// Owner login.
    pub owner_username: String,
    /// GitHub id of the user that triggered the build.
    pub session_user_github_id: i64,
}

/// What a fan-out run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Instances that received a create-instance-container job.
    pub deployed: Vec<String>,
    /// Instances diverted to their isolation's kill/redeploy.
    pub isolated: usize,
}

/// Pick the update set. Log labels are kept from the historical flow, where
/// they read inverted.
pub fn select_instances(explicit: Vec<Instance>, autodeploy: Vec<Instance>) -> Vec<Instance> {
    if explicit.is_empty() {
        trace!("hook update, using manual list");
        autodeploy
    } else {
        trace!("manual update, using normal list");
        explicit
    }
}

/// Fan-out notifier.
pub struct FanOut {
    persistence: Arc<dyn Persistence>,
    jobs: Arc<dyn JobQueue>,
    emitter: Arc<dyn UpdateEmitter>,
    guard: IsolationGuard,
}

impl FanOut {
    /// Create a notifier.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        jobs: Arc<dyn JobQueue>,
        emitter: Arc<dyn UpdateEmitter>,
    ) -> Self {
        let guard = IsolationGuard::new(persistence.clone(), jobs.clone());
        Self {
            persistence,
            jobs,
            emitter,
            guard,
        }
    }

    /// Deploy the committed `versions` to the instances that should get them.
    ///
    /// Only called for successful builds. Failures on this path are logged
    /// and skipped; the committed build state is never affected.
    pub async fn run(
        &self,
        versions: &[ContextVersion],
        explicit: Vec<Instance>,
        requester: &Requester,
    ) -> FanOutReport {
        let autodeploy = self.handle_autodeploy(versions).await;
        let candidates = select_instances(explicit, autodeploy);
        let total = candidates.len();

        let survivors = self.guard.filter(candidates).await;
        let mut report = FanOutReport {
            isolated: total - survivors.len(),
            ..Default::default()
        };

        for instance in &survivors {
            let cv = &instance.context_version;
            // Forked instances whose build already existed count as deploys too
            if !cv.build.triggered_action.manual {
                self.publish(Job::InstanceDeployed(InstanceDeployedJob {
                    instance_id: instance.id.clone(),
                    cv_id: cv.id.clone(),
                }))
                .await;
            }
            let published = self
                .publish(Job::CreateInstanceContainer(CreateInstanceContainerJob {
                    instance_id: instance.id.clone(),
                    context_version_id: cv.id.clone(),
                    owner_username: requester.owner_username.clone(),
                    session_user_github_id: requester.session_user_github_id,
                }))
                .await;
            if published {
                report.deployed.push(instance.id.clone());
            }
        }

        info!(
            candidates = total,
            deployed = report.deployed.len(),
            isolated = report.isolated,
            "Build fan-out finished"
        );
        report
    }

    /// Autodeploy: move every unlocked instance tracking the pushed branch
    /// onto the new build. Returns the updated instances.
    async fn handle_autodeploy(&self, versions: &[ContextVersion]) -> Vec<Instance> {
        let Some(cv) = versions.first() else {
            return Vec::new();
        };
        if !cv.is_autodeploy() {
            return Vec::new();
        }
        let Some(acv) = cv.build.triggered_action.app_code_version.as_ref() else {
            warn!(context_version_id = %cv.id, "Autodeploy build without a triggering commit");
            return Vec::new();
        };

        let matched = match self
            .persistence
            .find_instances_by_repo_and_branch(&cv.context_id, &acv.repo, &acv.branch)
            .await
        {
            Ok(matched) => matched,
            Err(e) => {
                error!(
                    context_version_id = %cv.id,
                    repo = %acv.repo,
                    branch = %acv.branch,
                    error = %e,
                    "Autodeploy instance lookup failed"
                );
                return Vec::new();
            }
        };

        let mut updated = Vec::with_capacity(matched.len());
        for instance in matched {
            match self
                .persistence
                .replace_instance_context_version(&instance.id, cv)
                .await
            {
                Ok(Some(instance)) => {
                    debug!(instance_id = %instance.id, context_version_id = %cv.id, "Instance autodeployed");
                    self.emitter
                        .emit(UpdateEvent::instance(InstanceAction::Deploy, &instance));
                    self.publish(Job::InstanceDeployed(InstanceDeployedJob {
                        instance_id: instance.id.clone(),
                        cv_id: cv.id.clone(),
                    }))
                    .await;
                    updated.push(instance);
                }
                Ok(None) => debug!(instance_id = %instance.id, "Instance vanished during autodeploy"),
                Err(e) => error!(
                    instance_id = %instance.id,
                    error = %e,
                    "Failed to update instance with new build"
                ),
            }
        }
        updated
    }

    async fn publish(&self, job: Job) -> bool {
        match self.jobs.publish(&job).await {
            Ok(()) => true,
            Err(e) => {
                error!(queue = job.queue(), error = %e, "Failed to publish fan-out job");
                false
            }
        }
    }
}
