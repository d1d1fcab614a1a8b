// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Start an image builder once the dock reports it created.

use chrono::Utc;
use shipyard_core::model::{BuildError, ContextVersion, NetworkInfo};
use tracing::{debug, error, info, warn};

use super::WorkerContext;
use crate::dock::{DockError, labels};
use crate::error::{Error, Result};
use crate::events::{ContextVersionAction, UpdateEvent};
use crate::jobs::ImageBuilderCreatedJob;

/// Handles `on-image-builder-container-create` jobs.
pub struct StartImageBuilderWorker {
    ctx: WorkerContext,
}

impl StartImageBuilderWorker {
    /// Create the worker.
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Start the created container and mark its builds running.
    pub async fn handle(&self, job: &ImageBuilderCreatedJob) -> Result<()> {
        let inspect = &job.inspect_data;
        let cv_id = inspect
            .label(labels::CONTEXT_VERSION_ID)
            .ok_or_else(|| Error::MalformedEvent(format!("{} label", labels::CONTEXT_VERSION_ID)))?;

        info!(
            container_id = %job.id,
            host = %job.host,
            context_version_id = %cv_id,
            "Starting image builder"
        );

        let Some(cv) = self
            .ctx
            .persistence
            .find_context_version_for_start(cv_id)
            .await?
        else {
            debug!(
                context_version_id = %cv_id,
                "Context version not found or already started, dropping job"
            );
            return Err(Error::NotFound(format!(
                "context version {cv_id} ready to start"
            )));
        };

        let result = self.start(job, &cv).await;
        if let Err(e) = &result {
            error!(
                container_id = %job.id,
                context_version_id = %cv.id,
                error = %e,
                "Image builder start failed"
            );
            let network = match (
                inspect.label(labels::NETWORK_IP),
                inspect.label(labels::HOST_IP),
            ) {
                (Some(network_ip), Some(host_ip)) => Some(NetworkInfo {
                    network_ip: network_ip.to_string(),
                    host_ip: host_ip.to_string(),
                }),
                _ => None,
            };
            if let Some(network) = network {
                let sauron_host = inspect.label(labels::SAURON_HOST).unwrap_or(&job.host);
                self.ctx.release_host(sauron_host, &network).await;
            }
            self.ctx
                .fail_build(&cv.build.id, &BuildError::new(e.to_string()))
                .await;
        }
        result
    }

    async fn start(&self, job: &ImageBuilderCreatedJob, cv: &ContextVersion) -> Result<()> {
        self.ctx
            .config
            .start_retry()
            .run("start_container", |_| async move {
                match self.ctx.dock.start_container(&job.host, &job.id).await {
                    Err(DockError::AlreadyStarted(_)) => {
                        debug!(container_id = %job.id, "Container already started");
                        Ok(())
                    }
                    other => other,
                }
            })
            .await?;

        let marked = self
            .ctx
            .persistence
            .mark_container_started_by_build_id(&cv.build.id, Utc::now())
            .await?;
        info!(
            container_id = %job.id,
            build_id = %cv.build.id,
            updated = marked,
            "Image builder running"
        );

        match self.ctx.persistence.get_context_version(&cv.id).await? {
            Some(fresh) => self.ctx.emitter.emit(UpdateEvent::context_version(
                ContextVersionAction::BuildRunning,
                &fresh,
            )),
            None => warn!(context_version_id = %cv.id, "Context version vanished after start"),
        }
        Ok(())
    }
}
