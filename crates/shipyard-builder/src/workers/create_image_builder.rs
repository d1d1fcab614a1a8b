// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provision an image builder for a requested build.
//!
//! ```text
//! find context + guarded context version
//!   -> allocate network host (retry)
//!   -> resolve infra code version
//!   -> create container on dock (retry)
//!   -> record container on every cv sharing build._id
//!   -> emit build_started
//! ```
//!
//! Any failure after the context version was found releases the network
//! host and records the error on the build.

use shipyard_core::model::{BuildError, Context, ContextVersion, NetworkInfo};
use shipyard_core::persistence::ContainerAssignment;
use tracing::{debug, error, info, warn};

use super::WorkerContext;
use crate::dock::ImageBuilderSpec;
use crate::error::{Error, Result};
use crate::events::{ContextVersionAction, UpdateEvent};
use crate::jobs::CreateImageBuilderJob;

/// Tag the built image is pushed as: `{registry}/{owner}/{context}:{cv}`.
pub fn docker_tag(registry: &str, cv: &ContextVersion) -> String {
    format!(
        "{}/{}/{}:{}",
        registry, cv.owner.github, cv.context_id, cv.id
    )
}

/// Handles `create-image-builder-container` jobs.
pub struct CreateImageBuilderWorker {
    ctx: WorkerContext,
}

impl CreateImageBuilderWorker {
    /// Create the worker.
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Provision the image builder described by `job`.
    ///
    /// Returns [`Error::NotFound`] without touching anything when the
    /// context version is gone or already has a container (stale job).
    pub async fn handle(&self, job: &CreateImageBuilderJob) -> Result<()> {
        info!(
            context_id = %job.context_id,
            context_version_id = %job.context_version_id,
            docker_host = %job.docker_host,
            manual_build = job.manual_build,
            "Creating image builder"
        );

        let context = self.ctx.persistence.get_context(&job.context_id).await?;
        let Some(cv) = self
            .ctx
            .persistence
            .find_context_version_for_provisioning(&job.context_version_id)
            .await?
        else {
            debug!(
                context_version_id = %job.context_version_id,
                "Context version not found or already provisioned, dropping job"
            );
            return Err(Error::NotFound(format!(
                "context version {} ready for provisioning",
                job.context_version_id
            )));
        };

        let mut network = None;
        let result = match context {
            Some(context) => self.provision(job, &context, &cv, &mut network).await,
            None => Err(Error::NotFound(format!("context {}", job.context_id))),
        };

        if let Err(e) = &result {
            error!(
                context_version_id = %cv.id,
                build_id = %cv.build.id,
                error = %e,
                "Image builder provisioning failed"
            );
            self.on_error(job, &cv, network.as_ref(), e).await;
        }
        result
    }

    async fn provision(
        &self,
        job: &CreateImageBuilderJob,
        context: &Context,
        cv: &ContextVersion,
        network: &mut Option<NetworkInfo>,
    ) -> Result<()> {
        let config = &self.ctx.config;

        let allocated = config
            .sauron_retry()
            .run("find_or_create_host", |_| {
                self.ctx
                    .network
                    .find_or_create_host(&job.docker_host, context.owner.github)
            })
            .await?;
        *network = Some(allocated.clone());

        let dockerfile = match &cv.infra_code_version_id {
            Some(icv_id) => self
                .ctx
                .persistence
                .get_infra_code_version(icv_id)
                .await?
                .and_then(|icv| icv.dockerfile),
            None => None,
        };

        let spec = ImageBuilderSpec {
            image: config.image_builder_name.clone(),
            context_id: context.id.clone(),
            context_version_id: cv.id.clone(),
            build_id: cv.build.id.clone(),
            docker_tag: docker_tag(&config.registry_domain, cv),
            owner_username: job.owner_username.clone(),
            session_user_github_id: job.session_user_github_id,
            manual_build: job.manual_build,
            no_cache: job.no_cache,
            dockerfile,
            repos: cv
                .app_code_versions
                .iter()
                .map(|acv| match &acv.commit {
                    Some(commit) => format!("{}#{}@{}", acv.repo, acv.branch, commit),
                    None => format!("{}#{}", acv.repo, acv.branch),
                })
                .collect(),
            network: Some(allocated.clone()),
            sauron_host: job.docker_host.clone(),
        };

        let container_id = config
            .create_retry()
            .run("create_image_builder", |attempt| {
                debug!(
                    context_version_id = %cv.id,
                    attempt_count = attempt,
                    "Creating image builder container"
                );
                self.ctx.dock.create_image_builder(&job.docker_host, &spec)
            })
            .await?;

        let assignment = ContainerAssignment {
            container_id: container_id.clone(),
            docker_host: job.docker_host.clone(),
            docker_tag: spec.docker_tag.clone(),
            network: Some(allocated),
        };
        let updated = self
            .ctx
            .persistence
            .update_container_by_build_id(&cv.build.id, &assignment)
            .await?;

        info!(
            context_version_id = %cv.id,
            build_id = %cv.build.id,
            container_id = %container_id,
            updated = updated,
            "Image builder recorded"
        );

        match self.ctx.persistence.get_context_version(&cv.id).await? {
            Some(fresh) => self.ctx.emitter.emit(UpdateEvent::context_version(
                ContextVersionAction::BuildStarted,
                &fresh,
            )),
            None => warn!(context_version_id = %cv.id, "Context version vanished after update"),
        }
        Ok(())
    }

    async fn on_error(
        &self,
        job: &CreateImageBuilderJob,
        cv: &ContextVersion,
        network: Option<&NetworkInfo>,
        err: &Error,
    ) {
        // Host is only released if it was allocated
        if let Some(network) = network {
            self.ctx.release_host(&job.docker_host, network).await;
        }
        self.ctx
            .fail_build(&cv.build.id, &BuildError::new(err.to_string()))
            .await;
    }
}
