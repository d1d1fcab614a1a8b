// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Array membership on JSON columns goes through `json_each`. Id lists are
//! bound as a single JSON text parameter.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;

use crate::error::CoreError;
use crate::model::{
    Build, BuildError, BuildResult, Context, ContextVersion, ContextVersionState, InfraCodeVersion,
    Instance, Isolation,
};

use super::{
    BUILD_COLUMNS, BuildRecord, CONTEXT_VERSION_COLUMNS, ContainerAssignment,
    ContextVersionRecord, INSTANCE_COLUMNS, InstanceLookup, InstanceRecord, JOB_COLUMNS,
    JobRecord, Persistence, now_ms, ttl_ms,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database file, run migrations and return the provider.
    ///
    /// Parent directories are created when missing.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }
}

fn insert_error(entity: &'static str, id: &str, err: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db) = &err
        && db.is_unique_violation()
    {
        return CoreError::AlreadyExists {
            entity,
            id: id.to_string(),
        };
    }
    err.into()
}

fn id_list(ids: &[String]) -> Result<String, CoreError> {
    Ok(serde_json::to_string(ids)?)
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_context(&self, context: &Context) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO contexts (id, name, owner_github, owner_username, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&context.id)
        .bind(&context.name)
        .bind(context.owner.github)
        .bind(&context.owner.username)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("Context", &context.id, e))?;

        Ok(())
    }

    async fn get_context(&self, context_id: &str) -> Result<Option<Context>, CoreError> {
        let row = sqlx::query_as::<_, (String, String, i64, Option<String>)>(
            "SELECT id, name, owner_github, owner_username FROM contexts WHERE id = ?",
        )
        .bind(context_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, name, github, username)| Context {
            id,
            name,
            owner: crate::model::Owner { github, username },
        }))
    }

    async fn insert_infra_code_version(&self, icv: &InfraCodeVersion) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO infra_code_versions (id, context_id, dockerfile, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&icv.id)
        .bind(&icv.context_id)
        .bind(&icv.dockerfile)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("InfraCodeVersion", &icv.id, e))?;

        Ok(())
    }

    async fn get_infra_code_version(
        &self,
        icv_id: &str,
    ) -> Result<Option<InfraCodeVersion>, CoreError> {
        let row = sqlx::query_as::<_, (String, String, Option<String>)>(
            "SELECT id, context_id, dockerfile FROM infra_code_versions WHERE id = ?",
        )
        .bind(icv_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, context_id, dockerfile)| InfraCodeVersion {
            id,
            context_id,
            dockerfile,
        }))
    }

    async fn insert_context_version(&self, cv: &ContextVersion) -> Result<(), CoreError> {
        let b = &cv.build;
        sqlx::query(&format!(
            "INSERT INTO context_versions ({CONTEXT_VERSION_COLUMNS}) VALUES \
             (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&cv.id)
        .bind(&cv.context_id)
        .bind(cv.owner.github)
        .bind(&cv.owner.username)
        .bind(&cv.infra_code_version_id)
        .bind(Json(&cv.app_code_versions))
        .bind(cv.state.map(|s| s.as_str()))
        .bind(cv.created_at)
        .bind(&b.id)
        .bind(&b.hash)
        .bind(&b.message)
        .bind(Json(&b.triggered_action))
        .bind(b.started)
        .bind(b.container_started)
        .bind(b.completed)
        .bind(b.failed)
        .bind(b.error.as_ref().map(|e| e.message.as_str()))
        .bind(b.error.as_ref().and_then(|e| e.stack.as_deref()))
        .bind(&b.log)
        .bind(&b.docker_container)
        .bind(&b.docker_host)
        .bind(&b.docker_tag)
        .bind(b.network.as_ref().map(|n| n.network_ip.as_str()))
        .bind(b.network.as_ref().map(|n| n.host_ip.as_str()))
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("ContextVersion", &cv.id, e))?;

        Ok(())
    }

    async fn get_context_version(
        &self,
        cv_id: &str,
    ) -> Result<Option<ContextVersion>, CoreError> {
        let record = sqlx::query_as::<_, ContextVersionRecord>(&format!(
            "SELECT {CONTEXT_VERSION_COLUMNS} FROM context_versions WHERE id = ?"
        ))
        .bind(cv_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(Into::into))
    }

    async fn find_context_version_for_provisioning(
        &self,
        cv_id: &str,
    ) -> Result<Option<ContextVersion>, CoreError> {
        let record = sqlx::query_as::<_, ContextVersionRecord>(&format!(
            r#"
            SELECT {CONTEXT_VERSION_COLUMNS} FROM context_versions
            WHERE id = ?
              AND build_started IS NOT NULL
              AND build_docker_container IS NULL
              AND build_completed IS NULL
            "#
        ))
        .bind(cv_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(Into::into))
    }

    async fn find_context_version_for_start(
        &self,
        cv_id: &str,
    ) -> Result<Option<ContextVersion>, CoreError> {
        let record = sqlx::query_as::<_, ContextVersionRecord>(&format!(
            r#"
            SELECT {CONTEXT_VERSION_COLUMNS} FROM context_versions
            WHERE id = ?
              AND build_started IS NOT NULL
              AND build_container_started IS NULL
              AND build_completed IS NULL
            "#
        ))
        .bind(cv_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(Into::into))
    }

    async fn find_context_versions_by_container(
        &self,
        container_id: &str,
    ) -> Result<Vec<ContextVersion>, CoreError> {
        let records = sqlx::query_as::<_, ContextVersionRecord>(&format!(
            "SELECT {CONTEXT_VERSION_COLUMNS} FROM context_versions \
             WHERE build_docker_container = ? ORDER BY created_at, id"
        ))
        .bind(container_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn update_container_by_build_id(
        &self,
        build_id: &str,
        assignment: &ContainerAssignment,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE context_versions
            SET build_docker_container = ?,
                build_docker_host = ?,
                build_docker_tag = ?,
                build_network_ip = ?,
                build_host_ip = ?,
                state = ?
            WHERE build_id = ? AND build_completed IS NULL
            "#,
        )
        .bind(&assignment.container_id)
        .bind(&assignment.docker_host)
        .bind(&assignment.docker_tag)
        .bind(assignment.network.as_ref().map(|n| n.network_ip.as_str()))
        .bind(assignment.network.as_ref().map(|n| n.host_ip.as_str()))
        .bind(ContextVersionState::BuildStarted.as_str())
        .bind(build_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_container_started_by_build_id(
        &self,
        build_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE context_versions
            SET build_container_started = ?
            WHERE build_id = ?
              AND build_started IS NOT NULL
              AND build_container_started IS NULL
              AND build_completed IS NULL
            "#,
        )
        .bind(at)
        .bind(build_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn update_build_error_by_build_id(
        &self,
        build_id: &str,
        error: &BuildError,
    ) -> Result<Vec<ContextVersion>, CoreError> {
        let records = sqlx::query_as::<_, ContextVersionRecord>(&format!(
            r#"
            UPDATE context_versions
            SET build_completed = ?,
                build_failed = TRUE,
                build_error_message = ?,
                build_error_stack = ?,
                state = ?
            WHERE build_id = ? AND build_completed IS NULL
            RETURNING {CONTEXT_VERSION_COLUMNS}
            "#
        ))
        .bind(Utc::now())
        .bind(&error.message)
        .bind(&error.stack)
        .bind(ContextVersionState::BuildErrored.as_str())
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn update_build_completed_by_container(
        &self,
        container_id: &str,
        result: &BuildResult,
    ) -> Result<Vec<ContextVersion>, CoreError> {
        let state = if result.failed {
            ContextVersionState::BuildErrored
        } else {
            ContextVersionState::BuildSucceeded
        };

        let records = sqlx::query_as::<_, ContextVersionRecord>(&format!(
            r#"
            UPDATE context_versions
            SET build_completed = ?,
                build_failed = ?,
                build_error_message = ?,
                build_error_stack = ?,
                build_log = ?,
                build_docker_host = ?,
                state = ?
            WHERE build_docker_container = ? AND build_completed IS NULL
            RETURNING {CONTEXT_VERSION_COLUMNS}
            "#
        ))
        .bind(Utc::now())
        .bind(result.failed)
        .bind(result.error.as_ref().map(|e| e.message.as_str()))
        .bind(result.error.as_ref().and_then(|e| e.stack.as_deref()))
        .bind(&result.log)
        .bind(&result.docker_host)
        .bind(state.as_str())
        .bind(container_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn insert_build(&self, build: &Build) -> Result<(), CoreError> {
        sqlx::query(&format!(
            "INSERT INTO builds ({BUILD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&build.id)
        .bind(build.owner.github)
        .bind(&build.owner.username)
        .bind(Json(&build.context_versions))
        .bind(build.started)
        .bind(build.completed)
        .bind(build.failed)
        .bind(Json(&build.errored_context_versions))
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("Build", &build.id, e))?;

        Ok(())
    }

    async fn get_build(&self, build_id: &str) -> Result<Option<Build>, CoreError> {
        let record = sqlx::query_as::<_, BuildRecord>(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE id = ?"
        ))
        .bind(build_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(Into::into))
    }

    async fn find_builds_by_context_version_ids(
        &self,
        cv_ids: &[String],
    ) -> Result<Vec<Build>, CoreError> {
        if cv_ids.is_empty() {
            return Ok(Vec::new());
        }

        let records = sqlx::query_as::<_, BuildRecord>(&format!(
            r#"
            SELECT {BUILD_COLUMNS} FROM builds
            WHERE EXISTS (
                SELECT 1 FROM json_each(builds.context_versions) AS cv
                WHERE cv.value IN (SELECT value FROM json_each(?))
            )
            ORDER BY id
            "#
        ))
        .bind(id_list(cv_ids)?)
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn modify_build_completed(
        &self,
        build_id: &str,
        failed: bool,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE builds SET completed = ?, failed = ? WHERE id = ? AND completed IS NULL",
        )
        .bind(Utc::now())
        .bind(failed)
        .bind(build_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn modify_build_errored(&self, build_id: &str, cv_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE builds
            SET completed = ?,
                failed = TRUE,
                errored_context_versions = json_insert(errored_context_versions, '$[#]', ?)
            WHERE id = ? AND completed IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(cv_id)
        .bind(build_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_instance(&self, instance: &Instance) -> Result<(), CoreError> {
        let lookup = InstanceLookup::of(&instance.context_version);
        sqlx::query(
            r#"
            INSERT INTO instances (
                id, name, owner_github, owner_username, master_pod, auto_forked, locked,
                isolated, is_isolation_group_master, context_id, context_version_id,
                context_version_build_id, repo, branch, context_version, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.name)
        .bind(instance.owner.github)
        .bind(&instance.owner.username)
        .bind(instance.master_pod)
        .bind(instance.auto_forked)
        .bind(instance.locked)
        .bind(&instance.isolated)
        .bind(instance.is_isolation_group_master)
        .bind(&lookup.context_id)
        .bind(&lookup.context_version_id)
        .bind(&lookup.context_version_build_id)
        .bind(&lookup.repo)
        .bind(&lookup.branch)
        .bind(Json(&instance.context_version))
        .bind(instance.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("Instance", &instance.id, e))?;

        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>, CoreError> {
        let record = sqlx::query_as::<_, InstanceRecord>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(Into::into))
    }

    async fn find_instances_by_cv_build_id(
        &self,
        build_id: &str,
    ) -> Result<Vec<Instance>, CoreError> {
        let records = sqlx::query_as::<_, InstanceRecord>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances \
             WHERE context_version_build_id = ? ORDER BY created_at, id"
        ))
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn find_instances_by_context_version_ids(
        &self,
        cv_ids: &[String],
    ) -> Result<Vec<Instance>, CoreError> {
        if cv_ids.is_empty() {
            return Ok(Vec::new());
        }

        let records = sqlx::query_as::<_, InstanceRecord>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances \
             WHERE context_version_id IN (SELECT value FROM json_each(?)) \
             ORDER BY created_at, id"
        ))
        .bind(id_list(cv_ids)?)
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn find_instances_by_repo_and_branch(
        &self,
        context_id: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<Instance>, CoreError> {
        let records = sqlx::query_as::<_, InstanceRecord>(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS} FROM instances
            WHERE context_id = ? AND repo = ? AND branch = ? AND locked = FALSE
            ORDER BY created_at, id
            "#
        ))
        .bind(context_id)
        .bind(repo.to_lowercase())
        .bind(branch)
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn replace_instance_context_version(
        &self,
        instance_id: &str,
        cv: &ContextVersion,
    ) -> Result<Option<Instance>, CoreError> {
        let lookup = InstanceLookup::of(cv);
        let record = sqlx::query_as::<_, InstanceRecord>(&format!(
            r#"
            UPDATE instances
            SET context_version = ?,
                context_id = ?,
                context_version_id = ?,
                context_version_build_id = ?,
                repo = ?,
                branch = ?
            WHERE id = ?
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(Json(cv))
        .bind(&lookup.context_id)
        .bind(&lookup.context_version_id)
        .bind(&lookup.context_version_build_id)
        .bind(&lookup.repo)
        .bind(&lookup.branch)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(Into::into))
    }

    async fn insert_isolation(&self, isolation: &Isolation) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO isolations (id, owner_github, owner_username, group_master, redeploy_on_killed)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&isolation.id)
        .bind(isolation.owner.github)
        .bind(&isolation.owner.username)
        .bind(&isolation.group_master)
        .bind(isolation.redeploy_on_killed)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("Isolation", &isolation.id, e))?;

        Ok(())
    }

    async fn find_redeployable_isolation(
        &self,
        isolation_id: &str,
    ) -> Result<Option<Isolation>, CoreError> {
        let row = sqlx::query_as::<_, (String, i64, Option<String>, String, bool)>(
            r#"
            SELECT id, owner_github, owner_username, group_master, redeploy_on_killed
            FROM isolations
            WHERE id = ? AND redeploy_on_killed = TRUE
            "#,
        )
        .bind(isolation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(
            row.map(|(id, github, username, group_master, redeploy_on_killed)| Isolation {
                id,
                owner: crate::model::Owner { github, username },
                group_master,
                redeploy_on_killed,
            }),
        )
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO locks (lock_key, holder, expires_at_ms)
            VALUES (?, ?, ?)
            ON CONFLICT (lock_key) DO UPDATE
            SET holder = excluded.holder, expires_at_ms = excluded.expires_at_ms
            WHERE locks.expires_at_ms <= ? OR locks.holder = excluded.holder
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(now.saturating_add(ttl_ms(ttl)))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM locks WHERE lock_key = ? AND holder = ?")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn enqueue_job(
        &self,
        queue: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, CoreError> {
        let result = sqlx::query("INSERT INTO jobs (queue, payload, created_at) VALUES (?, ?, ?)")
            .bind(queue)
            .bind(Json(payload))
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    async fn claim_jobs(
        &self,
        queues: &[String],
        claimer: &str,
        limit: i64,
    ) -> Result<Vec<JobRecord>, CoreError> {
        if queues.is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }

        let mut records = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            UPDATE jobs
            SET claimed_at = ?, claimed_by = ?
            WHERE id IN (
                SELECT id FROM jobs
                WHERE claimed_at IS NULL
                  AND queue IN (SELECT value FROM json_each(?))
                ORDER BY id
                LIMIT ?
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Utc::now())
        .bind(claimer)
        .bind(id_list(queues)?)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn ack_job(&self, job_id: i64) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_jobs(&self, queue: &str) -> Result<Vec<JobRecord>, CoreError> {
        let records = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE queue = ? ORDER BY id"
        ))
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
