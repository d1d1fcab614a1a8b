// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build completion resolver.
//!
//! Runs once per image builder die (the event mutex sees to that). Resolves
//! the exit state, commits the terminal build state, then fans the result out
//! to builds, instances and subscribers.
//!
//! The commit is the only step allowed to stop the flow. Everything after it
//! is best-effort.

use std::collections::HashMap;

use shipyard_core::model::{BuildError, BuildResult, ContextVersion, Instance};
use tracing::{debug, error, info, warn};

use super::WorkerContext;
use crate::docker_events::DieEvent;
use crate::dock::{ContainerInspect, labels};
use crate::error::Result;
use crate::events::{ContextVersionAction, InstanceAction, UpdateEvent};
use crate::fan_out::{FanOut, FanOutReport, Requester};
use crate::jobs::{ClearContainerMemoryJob, Job, PushImageJob};
use crate::network_dealloc::deallocate_network;

/// Exit code the image builder uses when the build hit its time limit.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Map an exit code to `(failed, error)`.
pub fn classify_exit(exit_code: Option<i64>) -> (bool, Option<BuildError>) {
    match exit_code {
        Some(0) => (false, None),
        Some(TIMEOUT_EXIT_CODE) => (true, Some(BuildError::new("timed out"))),
        Some(code) => (
            true,
            Some(BuildError::new(format!("image builder exited with code {code}"))),
        ),
        None => (true, Some(BuildError::new("image builder exit code unknown"))),
    }
}

/// Result of handling one die event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DieOutcome {
    /// No unfinished context version referenced the container.
    AlreadyHandled,
    /// Terminal state committed.
    Completed {
        /// Whether the build failed.
        failed: bool,
        /// Context versions committed.
        context_versions: Vec<String>,
        /// Fan-out result; empty for failed builds.
        fan_out: FanOutReport,
    },
}

/// Completion resolver for image builder dies.
pub struct ImageBuilderDiedWorker {
    ctx: WorkerContext,
    fan_out: FanOut,
}

impl ImageBuilderDiedWorker {
    /// Create the worker.
    pub fn new(ctx: WorkerContext) -> Self {
        let fan_out = FanOut::new(
            ctx.persistence.clone(),
            ctx.jobs.clone(),
            ctx.emitter.clone(),
        );
        Self { ctx, fan_out }
    }

    /// Resolve and commit the build run by the dead container.
    pub async fn handle(&self, event: &DieEvent) -> Result<DieOutcome> {
        info!(
            container_id = %event.id,
            host = %event.host,
            event_uuid = %event.uuid,
            "Image builder died"
        );

        let clear = Job::ClearContainerMemory(ClearContainerMemoryJob {
            container_id: event.id.clone(),
        });
        if let Err(e) = self.ctx.jobs.publish(&clear).await {
            warn!(container_id = %event.id, error = %e, "Failed to publish clear-container-memory");
        }

        // Detached; the lookup runs in the task so the build info fetch
        // starts right away
        drop(deallocate_network(
            self.ctx.persistence.clone(),
            self.ctx.network.clone(),
            self.ctx.config.sauron_retry(),
            event.id.clone(),
            event.host.clone(),
        ));

        let (inspect, result) = self.build_result(event).await;
        if result.failed {
            report_build_failure(event, inspect.as_ref(), &result);
        }

        let versions = self
            .ctx
            .persistence
            .update_build_completed_by_container(&event.id, &result)
            .await
            .inspect_err(|e| {
                error!(container_id = %event.id, error = %e, "Failed to commit build completion");
            })?;

        if versions.is_empty() {
            info!(container_id = %event.id, "No unfinished build for container, already handled");
            return Ok(DieOutcome::AlreadyHandled);
        }
        let cv_ids: Vec<String> = versions.iter().map(|cv| cv.id.clone()).collect();
        info!(
            container_id = %event.id,
            failed = result.failed,
            context_versions = ?cv_ids,
            "Build completion committed"
        );

        self.refresh_instance_snapshots(&versions).await;
        let push = (!result.failed).then(|| PushTarget {
            docker_host_url: event.host.clone(),
            image_tag: image_tag(inspect.as_ref(), &versions[0]),
        });
        self.complete_builds(&cv_ids, push.as_ref()).await;

        for cv in &versions {
            self.ctx.emitter.emit(UpdateEvent::context_version(
                ContextVersionAction::BuildComplete,
                cv,
            ));
        }

        let build_id = inspect
            .as_ref()
            .and_then(|i| i.label(labels::CONTEXT_VERSION_BUILD_ID))
            .map(str::to_string)
            .unwrap_or_else(|| versions[0].build.id.clone());
        let patched = self.emit_instance_patches(&build_id).await;

        let fan_out = if result.failed {
            FanOutReport::default()
        } else {
            let requester = requester(inspect.as_ref(), &versions[0]);
            self.fan_out.run(&versions, patched, &requester).await
        };

        Ok(DieOutcome::Completed {
            failed: result.failed,
            context_versions: cv_ids,
            fan_out,
        })
    }

    /// Exit state and optional log tail. Dock failures become the build error
    /// so the build still reaches a terminal state.
    async fn build_result(&self, event: &DieEvent) -> (Option<ContainerInspect>, BuildResult) {
        let config = &self.ctx.config;

        let inspect = match &event.inspect_data {
            Some(inspect) if inspect.exit_code().is_some() => Ok(inspect.clone()),
            _ => self.ctx.dock.inspect_container(&event.host, &event.id).await,
        };

        let fetched = match inspect {
            Ok(inspect) if config.save_build_logs => self
                .ctx
                .dock
                .get_build_logs(&event.host, &event.id, config.build_log_tail_lines)
                .await
                .map(|log| (inspect, Some(log))),
            Ok(inspect) => Ok((inspect, None)),
            Err(e) => Err(e),
        };

        match fetched {
            Ok((inspect, log)) => {
                let exit_code = inspect.exit_code();
                let (failed, error) = classify_exit(exit_code);
                let result = BuildResult {
                    failed,
                    error,
                    log,
                    docker_host: event.host.clone(),
                    exit_code,
                };
                (Some(inspect), result)
            }
            Err(e) => {
                error!(container_id = %event.id, error = %e, "Unable to getBuildInfo for container");
                let result = BuildResult {
                    failed: true,
                    error: Some(
                        BuildError::new("Unable to getBuildInfo for container")
                            .with_stack(e.to_string()),
                    ),
                    log: None,
                    docker_host: event.host.clone(),
                    exit_code: None,
                };
                (event.inspect_data.clone(), result)
            }
        }
    }

    async fn refresh_instance_snapshots(&self, versions: &[ContextVersion]) {
        let cv_ids: Vec<String> = versions.iter().map(|cv| cv.id.clone()).collect();
        let instances = match self
            .ctx
            .persistence
            .find_instances_by_context_version_ids(&cv_ids)
            .await
        {
            Ok(instances) => instances,
            Err(e) => {
                error!(error = %e, "Failed to find instances to refresh");
                return;
            }
        };

        let by_id: HashMap<&str, &ContextVersion> =
            versions.iter().map(|cv| (cv.id.as_str(), cv)).collect();
        for instance in instances {
            let Some(cv) = by_id.get(instance.context_version.id.as_str()) else {
                continue;
            };
            if let Err(e) = self
                .ctx
                .persistence
                .replace_instance_context_version(&instance.id, cv)
                .await
            {
                error!(
                    instance_id = %instance.id,
                    context_version_id = %cv.id,
                    error = %e,
                    "Instance failed to update context version"
                );
            }
        }
    }

    /// Mark every build containing the committed versions terminal and, for
    /// a successful build, queue its image push. One failing build does not
    /// stop the others.
    async fn complete_builds(&self, cv_ids: &[String], push: Option<&PushTarget>) {
        let failed = push.is_none();
        let builds = match self
            .ctx
            .persistence
            .find_builds_by_context_version_ids(cv_ids)
            .await
        {
            Ok(builds) => builds,
            Err(e) => {
                error!(error = %e, "Failed to find builds for completed context versions");
                return;
            }
        };

        for build in &builds {
            match self
                .ctx
                .persistence
                .modify_build_completed(&build.id, failed)
                .await
            {
                Ok(true) => debug!(build_id = %build.id, failed = failed, "Build completed"),
                Ok(false) => {
                    debug!(build_id = %build.id, "Build already completed");
                    continue;
                }
                Err(e) => {
                    error!(build_id = %build.id, error = %e, "Failed to complete build");
                    continue;
                }
            }

            if let Some(target) = push {
                let job = Job::PushImage(PushImageJob {
                    build_id: build.id.clone(),
                    docker_host_url: target.docker_host_url.clone(),
                    image_tag: target.image_tag.clone(),
                });
                if let Err(e) = self.ctx.jobs.publish(&job).await {
                    error!(build_id = %build.id, error = %e, "Failed to publish push-image");
                }
            }
        }
    }

    /// Emit a patch for every instance on this build. Lookup failures yield
    /// an empty list.
    async fn emit_instance_patches(&self, build_id: &str) -> Vec<Instance> {
        match self
            .ctx
            .persistence
            .find_instances_by_cv_build_id(build_id)
            .await
        {
            Ok(instances) => {
                for instance in &instances {
                    self.ctx
                        .emitter
                        .emit(UpdateEvent::instance(InstanceAction::Patch, instance));
                }
                instances
            }
            Err(e) => {
                error!(build_id = %build_id, error = %e, "Failed to emit instance updates");
                Vec::new()
            }
        }
    }
}

/// Where a successful build's image is pushed from.
struct PushTarget {
    docker_host_url: String,
    image_tag: Option<String>,
}

/// Tag from the container labels, falling back to the one recorded on the
/// context version when it was created.
fn image_tag(inspect: Option<&ContainerInspect>, cv: &ContextVersion) -> Option<String> {
    let tag = inspect
        .and_then(|i| i.label(labels::DOCKER_TAG))
        .map(str::to_string)
        .or_else(|| cv.build.docker_tag.clone());
    if tag.is_none() {
        warn!(context_version_id = %cv.id, "No docker tag for built image");
    }
    tag
}

fn requester(inspect: Option<&ContainerInspect>, cv: &ContextVersion) -> Requester {
    let label = |key| inspect.and_then(|i| i.label(key));
    Requester {
        owner_username: label(labels::OWNER_USERNAME)
            .map(str::to_string)
            .or_else(|| cv.owner.username.clone())
            .unwrap_or_default(),
        session_user_github_id: label(labels::SESSION_USER_GITHUB_ID)
            .and_then(|v| v.parse().ok())
            .unwrap_or(cv.owner.github),
    }
}

fn report_build_failure(event: &DieEvent, inspect: Option<&ContainerInspect>, result: &BuildResult) {
    warn!(
        container_id = %event.id,
        host = %event.host,
        exit_code = ?result.exit_code,
        error = ?result.error.as_ref().map(|e| e.message.as_str()),
        labels = ?inspect.map(|i| &i.config.labels),
        "Building dockerfile failed"
    );
}
