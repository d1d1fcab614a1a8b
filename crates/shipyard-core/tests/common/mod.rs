// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common fixtures for shipyard-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use shipyard_core::model::{
    AppCodeVersion, Build, BuildInfo, ContextVersion, ContextVersionState, Owner,
};
use shipyard_core::persistence::{Persistence, SqlitePersistence};
use tempfile::TempDir;

/// Skip the test when no PostgreSQL database is configured.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_SHIPYARD_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_SHIPYARD_DATABASE_URL not set");
            return;
        }
    };
}

/// File-backed SQLite store. Keep the `TempDir` alive for the test duration.
pub async fn sqlite_store() -> (Arc<dyn Persistence>, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let persistence = SqlitePersistence::from_path(dir.path().join("shipyard.db"))
        .await
        .expect("Failed to open SQLite store");
    (Arc::new(persistence), dir)
}

pub fn owner() -> Owner {
    Owner {
        github: 1001,
        username: Some("runnable".into()),
    }
}

/// A context version whose build was requested but has no image builder yet.
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

pub fn build(id: &str, cv_ids: &[&str]) -> Build {
    Build {
        id: id.into(),
        owner: owner(),
        context_versions: cv_ids.iter().map(|s| s.to_string()).collect(),
        started: Some(Utc::now()),
        completed: None,
        failed: false,
        errored_context_versions: vec![],
    }
}
