// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image builder lifecycle workers.
//!
//! Each worker is a linear async pipeline over a [`WorkerContext`] holding
//! every collaborator it talks to. Workers never retry themselves beyond the
//! per-call retry policies: a failed job is acknowledged and its error is
//! recorded on the build.

mod create_image_builder;
mod image_builder_died;
mod start_image_builder;

pub use create_image_builder::{CreateImageBuilderWorker, docker_tag};
pub use image_builder_died::{DieOutcome, ImageBuilderDiedWorker, TIMEOUT_EXIT_CODE, classify_exit};
pub use start_image_builder::StartImageBuilderWorker;

use std::sync::Arc;

use shipyard_core::Persistence;
use shipyard_core::model::{BuildError, NetworkInfo};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dock::Dock;
use crate::events::{ContextVersionAction, UpdateEmitter, UpdateEvent};
use crate::jobs::JobQueue;
use crate::network::NetworkAllocator;

/// Collaborators shared by all workers.
#[derive(Clone)]
pub struct WorkerContext {
    /// Document store.
    pub persistence: Arc<dyn Persistence>,
    /// Dock client.
    pub dock: Arc<dyn Dock>,
    /// Network allocator client.
    pub network: Arc<dyn NetworkAllocator>,
    /// Continuation job publisher.
    pub jobs: Arc<dyn JobQueue>,
    /// Real-time update sink.
    pub emitter: Arc<dyn UpdateEmitter>,
    /// Builder settings.
    pub config: Arc<Config>,
}

impl WorkerContext {
    /// Release a builder's network host, retrying per the allocator policy.
    /// Failures are logged, never returned.
    pub(crate) async fn release_host(&self, dock_host: &str, network: &NetworkInfo) {
        let result = self
            .config
            .sauron_retry()
            .run("delete_host", |_| self.network.delete_host(dock_host, network))
            .await;
        match result {
            Ok(()) => info!(
                dock_host = %dock_host,
                network_ip = %network.network_ip,
                host_ip = %network.host_ip,
                "Network host released"
            ),
            Err(e) => error!(
                dock_host = %dock_host,
                host_ip = %network.host_ip,
                error = %e,
                "Failed to release network host"
            ),
        }
    }

    /// Compensating write: mark every unfinished context version of the build
    /// as failed and record them as errored on their builds.
    ///
    /// Best-effort throughout; a failure here is logged and swallowed so the
    /// original error stays the one reported.
    pub(crate) async fn fail_build(&self, build_id: &str, build_error: &BuildError) {
        let updated = match self
            .persistence
            .update_build_error_by_build_id(build_id, build_error)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                error!(build_id = %build_id, error = %e, "Failed to record build error");
                return;
            }
        };

        if updated.is_empty() {
            info!(build_id = %build_id, "Build already completed, error not recorded");
            return;
        }

        for cv in &updated {
            self.emitter.emit(UpdateEvent::context_version(
                ContextVersionAction::BuildComplete,
                cv,
            ));
        }

        let cv_ids: Vec<String> = updated.iter().map(|cv| cv.id.clone()).collect();
        let builds = match self
            .persistence
            .find_builds_by_context_version_ids(&cv_ids)
            .await
        {
            Ok(builds) => builds,
            Err(e) => {
                error!(build_id = %build_id, error = %e, "Failed to look up builds to error");
                return;
            }
        };

        for build in &builds {
            for cv_id in cv_ids.iter().filter(|id| build.context_versions.contains(id)) {
                if let Err(e) = self.persistence.modify_build_errored(&build.id, cv_id).await {
                    warn!(
                        build_id = %build.id,
                        context_version_id = %cv_id,
                        error = %e,
                        "Failed to mark build errored"
                    );
                }
            }
        }
    }
}
