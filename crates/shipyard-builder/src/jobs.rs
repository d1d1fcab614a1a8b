// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue jobs produced and consumed by the builder.
//!
//! Jobs are durable rows in the outbox table. Two queues are consumed here
//! (container creation and start); the rest are continuations for other
//! services.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipyard_core::Persistence;
use shipyard_core::persistence::JobRecord;
use tracing::debug;

use crate::dock::ContainerInspect;
use crate::error::{Error, Result};

/// Queue names.
pub mod queues {
    /// Provision an image builder for a context version.
    pub const CREATE_IMAGE_BUILDER_CONTAINER: &str = "create-image-builder-container";
    /// Dock reported that an image builder was created.
    pub const ON_IMAGE_BUILDER_CONTAINER_CREATE: &str = "on-image-builder-container-create";
    /// Push the built image to the registry.
    pub const PUSH_IMAGE: &str = "push-image";
    /// Free the memory reserved for a dead container.
    pub const CLEAR_CONTAINER_MEMORY: &str = "clear-container-memory";
    /// Create the application container of an instance.
    pub const CREATE_INSTANCE_CONTAINER: &str = "create-instance-container";
    /// An instance received a new build.
    pub const INSTANCE_DEPLOYED: &str = "instance-deployed";
    /// Kill an isolation group.
    pub const KILL_ISOLATION: &str = "kill-isolation";
}

/// `create-image-builder-container` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateImageBuilderJob {
    /// Context id.
    pub context_id: String,
    /// Context version id.
    pub context_version_id: String,
    /// Dock to build on.
    pub docker_host: String,
    /// Build requested by a user.
    #[serde(default)]
    pub manual_build: bool,
    /// Disable the docker layer cache.
    #[serde(default)]
    pub no_cache: bool,
    /// GitHub id of the requesting user.
    pub session_user_github_id: i64,
    /// Owner login.
    pub owner_username: String,
}

/// `on-image-builder-container-create` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuilderCreatedJob {
    /// Container id.
    pub id: String,
    /// Dock the container was created on.
    pub host: String,
    /// Inspection taken when the container was created.
    pub inspect_data: ContainerInspect,
}

/// `push-image` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushImageJob {
    /// Build whose image is pushed.
    pub build_id: String,
    /// Dock holding the built image.
    pub docker_host_url: String,
    /// Tag to push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
}

/// `clear-container-memory` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearContainerMemoryJob {
    /// Container id.
    pub container_id: String,
}

/// `create-instance-container` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceContainerJob {
    /// Instance to deploy.
    pub instance_id: String,
    /// Context version to deploy.
    pub context_version_id: String,
    /// Owner login.
    pub owner_username: String,
    /// GitHub id of the requesting user.
    pub session_user_github_id: i64,
}

/// `instance-deployed` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDeployedJob {
    /// Instance id.
    pub instance_id: String,
    /// Context version id.
    pub cv_id: String,
}

/// `kill-isolation` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillIsolationJob {
    /// Isolation group.
    pub isolation_id: String,
    /// Redeploy the group after the kill.
    pub trigger_redeploy: bool,
}

/// A job for one of the known queues.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// See [`CreateImageBuilderJob`].
    CreateImageBuilder(CreateImageBuilderJob),
    /// See [`ImageBuilderCreatedJob`].
    ImageBuilderCreated(ImageBuilderCreatedJob),
    /// See [`PushImageJob`].
    PushImage(PushImageJob),
    /// See [`ClearContainerMemoryJob`].
    ClearContainerMemory(ClearContainerMemoryJob),
    /// See [`CreateInstanceContainerJob`].
    CreateInstanceContainer(CreateInstanceContainerJob),
    /// See [`InstanceDeployedJob`].
    InstanceDeployed(InstanceDeployedJob),
    /// See [`KillIsolationJob`].
    KillIsolation(KillIsolationJob),
}

impl Job {
    /// Queue this job is published to.
    pub fn queue(&self) -> &'static str {
        match self {
            Job::CreateImageBuilder(_) => queues::CREATE_IMAGE_BUILDER_CONTAINER,
            Job::ImageBuilderCreated(_) => queues::ON_IMAGE_BUILDER_CONTAINER_CREATE,
            Job::PushImage(_) => queues::PUSH_IMAGE,
            Job::ClearContainerMemory(_) => queues::CLEAR_CONTAINER_MEMORY,
            Job::CreateInstanceContainer(_) => queues::CREATE_INSTANCE_CONTAINER,
            Job::InstanceDeployed(_) => queues::INSTANCE_DEPLOYED,
            Job::KillIsolation(_) => queues::KILL_ISOLATION,
        }
    }

    /// JSON payload.
    pub fn payload(&self) -> Result<serde_json::Value> {
        let value = match self {
            Job::CreateImageBuilder(j) => serde_json::to_value(j)?,
            Job::ImageBuilderCreated(j) => serde_json::to_value(j)?,
            Job::PushImage(j) => serde_json::to_value(j)?,
            Job::ClearContainerMemory(j) => serde_json::to_value(j)?,
            Job::CreateInstanceContainer(j) => serde_json::to_value(j)?,
            Job::InstanceDeployed(j) => serde_json::to_value(j)?,
            Job::KillIsolation(j) => serde_json::to_value(j)?,
        };
        Ok(value)
    }

    /// Decode an outbox row.
    pub fn from_record(record: &JobRecord) -> Result<Self> {
        let payload = record.payload.0.clone();
        let job = match record.queue.as_str() {
            queues::CREATE_IMAGE_BUILDER_CONTAINER => {
                Job::CreateImageBuilder(serde_json::from_value(payload)?)
            }
            queues::ON_IMAGE_BUILDER_CONTAINER_CREATE => {
                Job::ImageBuilderCreated(serde_json::from_value(payload)?)
            }
            queues::PUSH_IMAGE => Job::PushImage(serde_json::from_value(payload)?),
            queues::CLEAR_CONTAINER_MEMORY => {
                Job::ClearContainerMemory(serde_json::from_value(payload)?)
            }
            queues::CREATE_INSTANCE_CONTAINER => {
                Job::CreateInstanceContainer(serde_json::from_value(payload)?)
            }
            queues::INSTANCE_DEPLOYED => Job::InstanceDeployed(serde_json::from_value(payload)?),
            queues::KILL_ISOLATION => Job::KillIsolation(serde_json::from_value(payload)?),
            other => return Err(Error::MalformedEvent(format!("unknown queue {other}"))),
        };
        Ok(job)
    }
}

/// Publishes jobs for downstream workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publish a job. Returns once the job is durable.
    async fn publish(&self, job: &Job) -> Result<()>;
}

/// Job queue backed by the outbox table.
pub struct OutboxQueue {
    persistence: Arc<dyn Persistence>,
}

impl OutboxQueue {
    /// Create a queue over the given persistence.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl JobQueue for OutboxQueue {
    async fn publish(&self, job: &Job) -> Result<()> {
        let payload = job.payload()?;
        let id = self.persistence.enqueue_job(job.queue(), &payload).await?;
        debug!(queue = job.queue(), job_id = id, "Job published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shipyard_core::persistence::SqlitePersistence;

    async fn queue() -> (OutboxQueue, Arc<dyn Persistence>) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        shipyard_core::migrations::run_sqlite(&pool).await.unwrap();
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(pool));
        (OutboxQueue::new(persistence.clone()), persistence)
    }

    #[test]
    fn test_payloads_use_camel_case() {
        let job = Job::KillIsolation(KillIsolationJob {
            isolation_id: "iso-1".into(),
            trigger_redeploy: true,
        });
        assert_eq!(job.queue(), "kill-isolation");
        assert_eq!(
            job.payload().unwrap(),
            json!({"isolationId": "iso-1", "triggerRedeploy": true})
        );
    }

    #[tokio::test]
    async fn test_publish_lands_in_outbox() {
        let (queue, persistence) = queue().await;
        let job = Job::CreateInstanceContainer(CreateInstanceContainerJob {
            instance_id: "inst-1".into(),
            context_version_id: "cv-1".into(),
            owner_username: "acme".into(),
            session_user_github_id: 42,
        });

        queue.publish(&job).await.unwrap();

        let rows = persistence
            .list_jobs(queues::CREATE_INSTANCE_CONTAINER)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload.0["sessionUserGithubId"], 42);
        assert_eq!(Job::from_record(&rows[0]).unwrap(), job);
    }

    #[tokio::test]
    async fn test_unknown_queue_is_malformed() {
        let (_, persistence) = queue().await;
        persistence
            .enqueue_job("mystery", &json!({}))
            .await
            .unwrap();
        let rows = persistence.list_jobs("mystery").await.unwrap();
        let err = Job::from_record(&rows[0]).unwrap_err();
        assert!(err.is_expected());
    }
}
