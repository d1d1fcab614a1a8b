// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixtures for unit tests.

use std::sync::Arc;

use chrono::Utc;
use shipyard_core::Persistence;
use shipyard_core::model::{
    AppCodeVersion, BuildInfo, ContextVersion, ContextVersionState, Instance, Owner,
};
use shipyard_core::persistence::SqlitePersistence;

/// Create an in-memory SQLite store with migrations applied.
pub async fn memory_store() -> Arc<dyn Persistence> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    shipyard_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(SqlitePersistence::new(pool))
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

pub fn instance(id: &str, cv_id: &str) -> Instance {
    Instance {
        id: id.into(),
        name: format!("{id}-name"),
        owner: owner(),
        master_pod: true,
        auto_forked: false,
        locked: false,
        isolated: None,
        is_isolation_group_master: false,
        context_version: started_cv(cv_id, "b-1"),
        created_at: Utc::now(),
    }
}
