// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common harness for shipyard-builder integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use shipyard_builder::config::Config;
use shipyard_builder::dock::{MockDock, labels};
use shipyard_builder::events::{BroadcastEmitter, UpdateEvent};
use shipyard_builder::jobs::{CreateImageBuilderJob, OutboxQueue};
use shipyard_builder::network::MockNetwork;
use shipyard_builder::workers::WorkerContext;
use shipyard_core::model::{
    AppCodeVersion, Build, BuildInfo, Context, ContextVersion, ContextVersionState,
    InfraCodeVersion, Instance, Owner,
};
use shipyard_core::persistence::{Persistence, SqlitePersistence};
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const DOCK_HOST: &str = "http://10.0.1.10:4242";
pub const IMAGE_BUILDER: &str = "runnable/image-builder";
pub const REGISTRY: &str = "registry.runnable.com";

/// Tag the create worker gives `cv_id`'s image.
pub fn image_tag(cv_id: &str) -> String {
    format!("{REGISTRY}/1001/ctx-1:{cv_id}")
}

/// Config with no pauses between retries.
pub fn test_config() -> Config {
    Config {
        docker_retry_interval: Duration::ZERO,
        sauron_retry_interval: Duration::ZERO,
        image_builder_name: IMAGE_BUILDER.to_string(),
        ..Config::default()
    }
}

/// Workers wired to a file-backed SQLite store and in-memory collaborators.
pub struct Harness {
    pub persistence: Arc<dyn Persistence>,
    pub dock: Arc<MockDock>,
    pub network: Arc<MockNetwork>,
    pub emitter: Arc<BroadcastEmitter>,
    pub updates: broadcast::Receiver<UpdateEvent>,
    pub ctx: WorkerContext,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::with_network(config, MockNetwork::new()).await
    }

    pub async fn with_network(config: Config, network: MockNetwork) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::from_path(dir.path().join("shipyard.db"))
                .await
                .expect("Failed to open SQLite store"),
        );
        let dock = Arc::new(MockDock::new());
        let network = Arc::new(network);
        let emitter = Arc::new(BroadcastEmitter::new(256));
        let updates = emitter.subscribe();

        let ctx = WorkerContext {
            persistence: persistence.clone(),
            dock: dock.clone(),
            network: network.clone(),
            jobs: Arc::new(OutboxQueue::new(persistence.clone())),
            emitter: emitter.clone(),
            config: Arc::new(config),
        };

        Self {
            persistence,
            dock,
            network,
            emitter,
            updates,
            ctx,
            _dir: dir,
        }
    }

    /// Every update emitted so far.
    pub fn drain_updates(&mut self) -> Vec<UpdateEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.updates.try_recv() {
            events.push(event);
        }
        events
    }

    /// Payloads queued on `queue`.
    pub async fn jobs(&self, queue: &str) -> Vec<serde_json::Value> {
        self.persistence
            .list_jobs(queue)
            .await
            .expect("Failed to list jobs")
            .into_iter()
            .map(|record| record.payload.0)
            .collect()
    }

    /// Context, infra code and a started context version with its build.
    pub async fn seed_build(&self, cv_id: &str, build_id: &str) -> ContextVersion {
        let context = Context {
            id: "ctx-1".into(),
            name: "api".into(),
            owner: owner(),
        };
        // Several cvs may share one context
        let _ = self.persistence.insert_context(&context).await;
        let _ = self
            .persistence
            .insert_infra_code_version(&InfraCodeVersion {
                id: "icv-1".into(),
                context_id: "ctx-1".into(),
                dockerfile: Some("FROM node:20\n".into()),
            })
            .await;

        let mut cv = started_cv(cv_id, build_id);
        cv.infra_code_version_id = Some("icv-1".into());
        self.persistence
            .insert_context_version(&cv)
            .await
            .expect("Failed to insert context version");
        self.insert_build(build_id, &[cv_id]).await;
        cv
    }

    pub async fn insert_build(&self, build_id: &str, cv_ids: &[&str]) {
        let build = Build {
            id: build_id.into(),
            owner: owner(),
            context_versions: cv_ids.iter().map(|s| s.to_string()).collect(),
            started: Some(Utc::now()),
            completed: None,
            failed: false,
            errored_context_versions: vec![],
        };
        if self.persistence.get_build(build_id).await.ok().flatten().is_none() {
            self.persistence
                .insert_build(&build)
                .await
                .expect("Failed to insert build");
        }
    }

    /// A context version whose image builder is running in `container_id`,
    /// with the matching exited container registered on the mock dock.
    pub async fn seed_running_build(
        &self,
        cv: ContextVersion,
        container_id: &str,
        exit_code: i64,
        logs: &str,
    ) -> ContextVersion {
        let mut cv = cv;
        cv.state = Some(ContextVersionState::BuildStarted);
        cv.build.docker_container = Some(container_id.into());
        cv.build.docker_host = Some(DOCK_HOST.into());
        cv.build.container_started = Some(Utc::now());
        cv.build.docker_tag.get_or_insert_with(|| image_tag(&cv.id));
        self.persistence
            .insert_context_version(&cv)
            .await
            .expect("Failed to insert context version");
        self.insert_build(&cv.build.id, &[cv.id.as_str()]).await;
        self.dock.add_exited_container(
            container_id,
            builder_labels(&cv.id, &cv.build.id),
            exit_code,
            logs,
        );
        cv
    }

    pub async fn seed_instance(&self, instance: &Instance) {
        self.persistence
            .insert_instance(instance)
            .await
            .expect("Failed to insert instance");
    }
}

pub fn owner() -> Owner {
    Owner {
        github: 1001,
        username: Some("runnable".into()),
    }
}

pub fn started_cv(id: &str, build_id: &str) -> ContextVersion {
    let mut build = BuildInfo::new(build_id);
    build.started = Some(Utc::now());
    ContextVersion {
        id: id.into(),
        context_id: "ctx-1".into(),
        owner: owner(),
        infra_code_version_id: None,
        app_code_versions: vec![AppCodeVersion {
            repo: "Runnable/API".into(),
            branch: "master".into(),
            commit: Some("deadbeef".into()),
            additional_repo: false,
        }],
        state: Some(ContextVersionState::BuildStarting),
        build,
        created_at: Utc::now(),
    }
}

pub fn instance(id: &str, cv: &ContextVersion) -> Instance {
    Instance {
        id: id.into(),
        name: format!("{id}-name"),
        owner: owner(),
        master_pod: true,
        auto_forked: false,
        locked: false,
        isolated: None,
        is_isolation_group_master: false,
        context_version: cv.clone(),
        created_at: Utc::now(),
    }
}

pub fn builder_labels(cv_id: &str, build_id: &str) -> HashMap<String, String> {
    HashMap::from([
        (labels::CONTEXT_VERSION_ID.to_string(), cv_id.to_string()),
        (labels::CONTEXT_VERSION_BUILD_ID.to_string(), build_id.to_string()),
        (labels::OWNER_USERNAME.to_string(), "runnable".to_string()),
        (labels::SESSION_USER_GITHUB_ID.to_string(), "2002".to_string()),
        (labels::DOCKER_TAG.to_string(), image_tag(cv_id)),
    ])
}

pub fn create_job(cv_id: &str) -> CreateImageBuilderJob {
    CreateImageBuilderJob {
        context_id: "ctx-1".into(),
        context_version_id: cv_id.into(),
        docker_host: DOCK_HOST.into(),
        manual_build: true,
        no_cache: false,
        session_user_github_id: 2002,
        owner_username: "runnable".into(),
    }
}

pub fn die_event(uuid: &str, container_id: &str) -> serde_json::Value {
    json!({
        "uuid": uuid,
        "id": container_id,
        "host": DOCK_HOST,
        "time": Utc::now().timestamp(),
        "from": format!("{IMAGE_BUILDER}:latest"),
    })
}
