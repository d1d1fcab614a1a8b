// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for shipyard.
//!
//! Every state transition of a build is a conditional write: the guard lives
//! in the `WHERE` clause of a single statement, so concurrent handlers in
//! different processes can race freely and at most one of them changes the
//! row. A guard that matches nothing is reported as an empty result, not an
//! error.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use crate::config::Config;
use crate::error::CoreError;
use crate::model::{
    AppCodeVersion, Build, BuildError, BuildInfo, Context, ContextVersion, ContextVersionState,
    InfraCodeVersion, Instance, Isolation, NetworkInfo, Owner, TriggeredAction,
};

/// Column list shared by every context version query.
pub(crate) const CONTEXT_VERSION_COLUMNS: &str = "id, context_id, owner_github, owner_username, \
     infra_code_version_id, app_code_versions, state, created_at, build_id, build_hash, \
     build_message, build_triggered_action, build_started, build_container_started, \
     build_completed, build_failed, build_error_message, build_error_stack, build_log, \
     build_docker_container, build_docker_host, build_docker_tag, build_network_ip, build_host_ip";

pub(crate) const BUILD_COLUMNS: &str = "id, owner_github, owner_username, context_versions, \
     started, completed, failed, errored_context_versions";

pub(crate) const INSTANCE_COLUMNS: &str = "id, name, owner_github, owner_username, master_pod, \
     auto_forked, locked, isolated, is_isolation_group_master, context_version, created_at";

pub(crate) const JOB_COLUMNS: &str = "id, queue, payload, created_at, claimed_at, claimed_by";

/// Flat context version row as stored in `context_versions`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ContextVersionRecord {
    /// Context version id.
    pub id: String,
    /// Owning context.
    pub context_id: String,
    /// Owner GitHub id.
    pub owner_github: i64,
    /// Owner GitHub login.
    pub owner_username: Option<String>,
    /// Infra code version reference.
    pub infra_code_version_id: Option<String>,
    /// Attached repositories.
    pub app_code_versions: Json<Vec<AppCodeVersion>>,
    /// Coarse state string.
    pub state: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Build id.
    pub build_id: String,
    /// Build dedup hash.
    pub build_hash: Option<String>,
    /// Build message.
    pub build_message: Option<String>,
    /// Trigger of the build.
    pub build_triggered_action: Json<TriggeredAction>,
    /// Build requested at.
    pub build_started: Option<DateTime<Utc>>,
    /// Image builder started at.
    pub build_container_started: Option<DateTime<Utc>>,
    /// Build finished at.
    pub build_completed: Option<DateTime<Utc>>,
    /// Build failed flag.
    pub build_failed: bool,
    /// Failure message.
    pub build_error_message: Option<String>,
    /// Failure detail.
    pub build_error_stack: Option<String>,
    /// Captured build output.
    pub build_log: Option<String>,
    /// Image builder container id.
    pub build_docker_container: Option<String>,
    /// Dock running the builder.
    pub build_docker_host: Option<String>,
    /// Image tag.
    pub build_docker_tag: Option<String>,
    /// Allocated network.
    pub build_network_ip: Option<String>,
    /// Allocated host.
    pub build_host_ip: Option<String>,
}

impl From<ContextVersionRecord> for ContextVersion {
    fn from(r: ContextVersionRecord) -> Self {
        let error = r.build_error_message.map(|message| BuildError {
            message,
            stack: r.build_error_stack,
        });
        let network = match (r.build_network_ip, r.build_host_ip) {
            (Some(network_ip), Some(host_ip)) => Some(NetworkInfo {
                network_ip,
                host_ip,
            }),
            _ => None,
        };
        ContextVersion {
            id: r.id,
            context_id: r.context_id,
            owner: Owner {
                github: r.owner_github,
                username: r.owner_username,
            },
            infra_code_version_id: r.infra_code_version_id,
            app_code_versions: r.app_code_versions.0,
            state: r.state.as_deref().and_then(ContextVersionState::parse),
            build: BuildInfo {
                id: r.build_id,
                hash: r.build_hash,
                message: r.build_message,
                triggered_action: r.build_triggered_action.0,
                started: r.build_started,
                container_started: r.build_container_started,
                completed: r.build_completed,
                failed: r.build_failed,
                error,
                log: r.build_log,
                docker_container: r.build_docker_container,
                docker_host: r.build_docker_host,
                docker_tag: r.build_docker_tag,
                network,
            },
            created_at: r.created_at,
        }
    }
}

/// Build row as stored in `builds`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRecord {
    /// Build id.
    pub id: String,
    /// Owner GitHub id.
    pub owner_github: i64,
    /// Owner GitHub login.
    pub owner_username: Option<String>,
    /// Context version ids.
    pub context_versions: Json<Vec<String>>,
    /// Requested at.
    pub started: Option<DateTime<Utc>>,
    /// Finished at.
    pub completed: Option<DateTime<Utc>>,
    /// Failed flag.
    pub failed: bool,
    /// Context versions that errored.
    pub errored_context_versions: Json<Vec<String>>,
}

impl From<BuildRecord> for Build {
    fn from(r: BuildRecord) -> Self {
        Build {
            id: r.id,
            owner: Owner {
                github: r.owner_github,
                username: r.owner_username,
            },
            context_versions: r.context_versions.0,
            started: r.started,
            completed: r.completed,
            failed: r.failed,
            errored_context_versions: r.errored_context_versions.0,
        }
    }
}

/// Instance row as stored in `instances`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRecord {
    /// Instance id.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Owner GitHub id.
    pub owner_github: i64,
    /// Owner GitHub login.
    pub owner_username: Option<String>,
    /// Master pod flag.
    pub master_pod: bool,
    /// Auto-forked flag.
    pub auto_forked: bool,
    /// Locked instances skip autodeploy.
    pub locked: bool,
    /// Isolation group id.
    pub isolated: Option<String>,
    /// Isolation master flag.
    pub is_isolation_group_master: bool,
    /// Flattened context version snapshot.
    pub context_version: Json<ContextVersion>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl From<InstanceRecord> for Instance {
    fn from(r: InstanceRecord) -> Self {
        Instance {
            id: r.id,
            name: r.name,
            owner: Owner {
                github: r.owner_github,
                username: r.owner_username,
            },
            master_pod: r.master_pod,
            auto_forked: r.auto_forked,
            locked: r.locked,
            isolated: r.isolated,
            is_isolation_group_master: r.is_isolation_group_master,
            context_version: r.context_version.0,
            created_at: r.created_at,
        }
    }
}

/// Job outbox row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    /// Outbox sequence id.
    pub id: i64,
    /// Queue name.
    pub queue: String,
    /// Job payload.
    pub payload: Json<serde_json::Value>,
    /// Enqueued at.
    pub created_at: DateTime<Utc>,
    /// Claimed at, if a worker picked it up.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Worker that claimed it.
    pub claimed_by: Option<String>,
}

/// Container identity recorded on every context version sharing a build id.
#[derive(Debug, Clone)]
pub struct ContainerAssignment {
    /// Image builder container id.
    pub container_id: String,
    /// Dock the container was created on.
    pub docker_host: String,
    /// Tag of the image being built.
    pub docker_tag: String,
    /// Network allocation, if one was made.
    pub network: Option<NetworkInfo>,
}

/// Split an instance snapshot into the denormalised lookup columns.
pub(crate) struct InstanceLookup {
    pub context_id: String,
    pub context_version_id: String,
    pub context_version_build_id: String,
    pub repo: Option<String>,
    pub branch: Option<String>,
}

impl InstanceLookup {
    pub(crate) fn of(cv: &ContextVersion) -> Self {
        let main = cv.main_app_code_version();
        Self {
            context_id: cv.context_id.clone(),
            context_version_id: cv.id.clone(),
            context_version_build_id: cv.build.id.clone(),
            repo: main.map(|acv| acv.lower_repo()),
            branch: main.map(|acv| acv.branch.clone()),
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Persistence interface used by the builder workers.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // --- contexts -----------------------------------------------------------

    async fn insert_context(&self, context: &Context) -> Result<(), CoreError>;

    async fn get_context(&self, context_id: &str) -> Result<Option<Context>, CoreError>;

    async fn insert_infra_code_version(&self, icv: &InfraCodeVersion) -> Result<(), CoreError>;

    async fn get_infra_code_version(
        &self,
        icv_id: &str,
    ) -> Result<Option<InfraCodeVersion>, CoreError>;

    // --- context versions ---------------------------------------------------

    async fn insert_context_version(&self, cv: &ContextVersion) -> Result<(), CoreError>;

    async fn get_context_version(&self, cv_id: &str)
    -> Result<Option<ContextVersion>, CoreError>;

    /// Find a context version that is ready for an image builder:
    /// `build.started` set, `build.dockerContainer` unset, not completed.
    async fn find_context_version_for_provisioning(
        &self,
        cv_id: &str,
    ) -> Result<Option<ContextVersion>, CoreError>;

    /// Find a context version whose image builder may be started:
    /// `build.started` set, `build.containerStarted` unset, not completed.
    async fn find_context_version_for_start(
        &self,
        cv_id: &str,
    ) -> Result<Option<ContextVersion>, CoreError>;

    /// All context versions whose build references the container.
    async fn find_context_versions_by_container(
        &self,
        container_id: &str,
    ) -> Result<Vec<ContextVersion>, CoreError>;

    /// Record the image builder on every not-completed context version that
    /// shares `build_id`. Returns the number of rows updated.
    async fn update_container_by_build_id(
        &self,
        build_id: &str,
        assignment: &ContainerAssignment,
    ) -> Result<u64, CoreError>;

    /// Set `build.containerStarted` on every started, not-completed context
    /// version sharing `build_id` that has not been marked yet.
    async fn mark_container_started_by_build_id(
        &self,
        build_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, CoreError>;

    /// Mark every not-completed context version sharing `build_id` as failed
    /// with `error`. Returns the updated documents.
    async fn update_build_error_by_build_id(
        &self,
        build_id: &str,
        error: &BuildError,
    ) -> Result<Vec<ContextVersion>, CoreError>;

    /// Commit the terminal state of the build run by `container_id`.
    ///
    /// Only context versions that are not yet completed are touched, so a
    /// second call for the same container returns an empty list.
    async fn update_build_completed_by_container(
        &self,
        container_id: &str,
        result: &crate::model::BuildResult,
    ) -> Result<Vec<ContextVersion>, CoreError>;

    // --- builds -------------------------------------------------------------

    async fn insert_build(&self, build: &Build) -> Result<(), CoreError>;

    async fn get_build(&self, build_id: &str) -> Result<Option<Build>, CoreError>;

    /// Builds whose `contextVersions` contain any of `cv_ids`.
    async fn find_builds_by_context_version_ids(
        &self,
        cv_ids: &[String],
    ) -> Result<Vec<Build>, CoreError>;

    /// Terminal: set `completed` and `failed` unless already completed.
    async fn modify_build_completed(&self, build_id: &str, failed: bool)
    -> Result<bool, CoreError>;

    /// Terminal: mark failed and record `cv_id` as errored unless already completed.
    async fn modify_build_errored(&self, build_id: &str, cv_id: &str) -> Result<bool, CoreError>;

    // --- instances ----------------------------------------------------------

    async fn insert_instance(&self, instance: &Instance) -> Result<(), CoreError>;

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>, CoreError>;

    /// Instances deployed from a context version with this build id.
    async fn find_instances_by_cv_build_id(
        &self,
        build_id: &str,
    ) -> Result<Vec<Instance>, CoreError>;

    async fn find_instances_by_context_version_ids(
        &self,
        cv_ids: &[String],
    ) -> Result<Vec<Instance>, CoreError>;

    /// Unlocked instances of `context_id` tracking `repo`/`branch`.
    async fn find_instances_by_repo_and_branch(
        &self,
        context_id: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<Instance>, CoreError>;

    /// Replace the instance's context version snapshot wholesale.
    async fn replace_instance_context_version(
        &self,
        instance_id: &str,
        cv: &ContextVersion,
    ) -> Result<Option<Instance>, CoreError>;

    // --- isolations ---------------------------------------------------------

    async fn insert_isolation(&self, isolation: &Isolation) -> Result<(), CoreError>;

    /// The isolation with this id, only if it redeploys on kill.
    async fn find_redeployable_isolation(
        &self,
        isolation_id: &str,
    ) -> Result<Option<Isolation>, CoreError>;

    // --- leases -------------------------------------------------------------

    /// Set-if-not-exists with expiry. Succeeds when the key is free, expired,
    /// or already held by `holder` (which renews it).
    async fn try_acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    /// Delete the key if `holder` owns it. Idempotent.
    async fn release_lock(&self, key: &str, holder: &str) -> Result<bool, CoreError>;

    // --- job outbox ---------------------------------------------------------

    async fn enqueue_job(&self, queue: &str, payload: &serde_json::Value)
    -> Result<i64, CoreError>;

    /// Claim up to `limit` unclaimed jobs from `queues`, oldest first.
    async fn claim_jobs(
        &self,
        queues: &[String],
        claimer: &str,
        limit: i64,
    ) -> Result<Vec<JobRecord>, CoreError>;

    /// Remove a processed job.
    async fn ack_job(&self, job_id: i64) -> Result<(), CoreError>;

    /// All jobs on a queue, oldest first.
    async fn list_jobs(&self, queue: &str) -> Result<Vec<JobRecord>, CoreError>;
}

/// Connect to the configured database, run migrations, and return the
/// matching backend.
pub async fn connect(config: &Config) -> Result<Arc<dyn Persistence>, CoreError> {
    tracing::info!(
        backend = if config.is_sqlite() { "sqlite" } else { "postgres" },
        max_connections = config.max_connections,
        "Connecting to database"
    );

    if config.is_sqlite() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        crate::migrations::run_sqlite(&pool).await?;
        Ok(Arc::new(SqlitePersistence::new(pool)))
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        crate::migrations::run_postgres(&pool).await?;
        Ok(Arc::new(PostgresPersistence::new(pool)))
    }
}
