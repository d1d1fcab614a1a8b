// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image builder creation and start.

mod common;

use common::*;
use shipyard_builder::Error;
use shipyard_builder::dock::{Dock, labels};
use shipyard_builder::events::{ContextVersionAction, UpdateEvent};
use shipyard_builder::jobs::ImageBuilderCreatedJob;
use shipyard_builder::network::MockNetwork;
use shipyard_builder::workers::{CreateImageBuilderWorker, StartImageBuilderWorker};
use shipyard_core::model::{BuildPhase, ContextVersionState};

fn cv_actions(events: &[UpdateEvent]) -> Vec<ContextVersionAction> {
    events
        .iter()
        .filter_map(|e| match e {
            UpdateEvent::ContextVersion { action, .. } => Some(*action),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_create_records_container_and_emits_build_started() {
    let mut h = Harness::new().await;
    h.seed_build("cv-1", "b-1").await;

    CreateImageBuilderWorker::new(h.ctx.clone())
        .handle(&create_job("cv-1"))
        .await
        .unwrap();

    assert_eq!(h.dock.create_calls(), 1);
    let created = h.dock.created();
    assert_eq!(created.len(), 1);
    let (host, spec) = &created[0];
    assert_eq!(host, DOCK_HOST);
    assert_eq!(spec.image, IMAGE_BUILDER);
    assert_eq!(spec.dockerfile.as_deref(), Some("FROM node:20\n"));
    assert_eq!(spec.repos, vec!["Runnable/API#master@deadbeef".to_string()]);

    let cv = h
        .persistence
        .get_context_version("cv-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cv.build.docker_container.as_deref(), Some("container-1"));
    assert_eq!(cv.build.docker_host.as_deref(), Some(DOCK_HOST));
    assert_eq!(
        cv.build.docker_tag.as_deref(),
        Some("registry.runnable.com/1001/ctx-1:cv-1")
    );
    assert_eq!(cv.build.network, h.network.allocated().first().cloned());
    assert_eq!(cv.build.phase(), BuildPhase::Started);

    assert_eq!(
        cv_actions(&h.drain_updates()),
        vec![ContextVersionAction::BuildStarted]
    );
}

#[tokio::test]
async fn test_create_retries_until_success() {
    let h = Harness::new().await;
    h.seed_build("cv-1", "b-1").await;
    h.dock.fail_creates(2);

    CreateImageBuilderWorker::new(h.ctx.clone())
        .handle(&create_job("cv-1"))
        .await
        .unwrap();

    assert_eq!(h.dock.create_calls(), 3);
    assert!(h.network.deleted().is_empty());
}

#[tokio::test]
async fn test_create_gives_up_after_attempt_budget() {
    let config = shipyard_builder::Config {
        create_container_attempts: 3,
        ..test_config()
    };
    let mut h = Harness::with_config(config).await;
    h.seed_build("cv-1", "b-1").await;
    h.dock.fail_creates(100);

    let err = CreateImageBuilderWorker::new(h.ctx.clone())
        .handle(&create_job("cv-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Dock(_)));
    assert_eq!(h.dock.create_calls(), 3);

    // Host released and build errored
    assert_eq!(h.network.deleted(), h.network.allocated());
    let cv = h
        .persistence
        .get_context_version("cv-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cv.build.phase(), BuildPhase::CompletedFailure);
    assert_eq!(cv.state, Some(ContextVersionState::BuildErrored));
    assert!(cv.build.error.is_some());

    let build = h.persistence.get_build("b-1").await.unwrap().unwrap();
    assert!(build.failed);
    assert!(build.completed.is_some());
    assert_eq!(build.errored_context_versions, vec!["cv-1".to_string()]);

    assert_eq!(
        cv_actions(&h.drain_updates()),
        vec![ContextVersionAction::BuildComplete]
    );
}

#[tokio::test]
async fn test_create_network_failure_never_touches_dock() {
    let config = shipyard_builder::Config {
        sauron_attempts: 2,
        ..test_config()
    };
    let h = Harness::with_network(config, MockNetwork::failing()).await;
    h.seed_build("cv-1", "b-1").await;

    let err = CreateImageBuilderWorker::new(h.ctx.clone())
        .handle(&create_job("cv-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Network(_)));
    assert_eq!(h.network.create_calls(), 2);
    assert_eq!(h.dock.create_calls(), 0);
    // Nothing was allocated, nothing to release
    assert!(h.network.deleted().is_empty());

    let cv = h
        .persistence
        .get_context_version("cv-1")
        .await
        .unwrap()
        .unwrap();
    assert!(cv.build.failed);
}

#[tokio::test]
async fn test_create_stale_job_is_dropped() {
    let h = Harness::new().await;
    let worker = CreateImageBuilderWorker::new(h.ctx.clone());

    let err = worker.handle(&create_job("missing")).await.unwrap_err();
    assert!(err.is_expected());
    assert_eq!(h.network.create_calls(), 0);

    // Second job for an already provisioned version is stale too
    h.seed_build("cv-1", "b-1").await;
    worker.handle(&create_job("cv-1")).await.unwrap();
    let err = worker.handle(&create_job("cv-1")).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(h.dock.create_calls(), 1);
}

async fn created_job(h: &Harness) -> ImageBuilderCreatedJob {
    h.seed_build("cv-1", "b-1").await;
    CreateImageBuilderWorker::new(h.ctx.clone())
        .handle(&create_job("cv-1"))
        .await
        .unwrap();
    let inspect = h
        .dock
        .inspect_container(DOCK_HOST, "container-1")
        .await
        .unwrap();
    ImageBuilderCreatedJob {
        id: "container-1".into(),
        host: DOCK_HOST.into(),
        inspect_data: inspect,
    }
}

#[tokio::test]
async fn test_start_marks_container_started() {
    let mut h = Harness::new().await;
    let job = created_job(&h).await;
    h.drain_updates();

    StartImageBuilderWorker::new(h.ctx.clone())
        .handle(&job)
        .await
        .unwrap();

    assert!(h.dock.is_started("container-1"));
    let cv = h
        .persistence
        .get_context_version("cv-1")
        .await
        .unwrap()
        .unwrap();
    assert!(cv.build.container_started.is_some());
    assert_eq!(
        cv_actions(&h.drain_updates()),
        vec![ContextVersionAction::BuildRunning]
    );
}

#[tokio::test]
async fn test_start_treats_already_started_as_success() {
    let h = Harness::new().await;
    let job = created_job(&h).await;
    h.dock.report_already_started();

    StartImageBuilderWorker::new(h.ctx.clone())
        .handle(&job)
        .await
        .unwrap();

    assert_eq!(h.dock.start_calls(), 1);
    let cv = h
        .persistence
        .get_context_version("cv-1")
        .await
        .unwrap()
        .unwrap();
    assert!(cv.build.container_started.is_some());
    assert!(!cv.build.is_completed());
}

#[tokio::test]
async fn test_start_failure_releases_host_and_errors_build() {
    let config = shipyard_builder::Config {
        start_container_attempts: 2,
        ..test_config()
    };
    let h = Harness::with_config(config).await;
    let job = created_job(&h).await;
    h.dock.fail_starts(100);

    let err = StartImageBuilderWorker::new(h.ctx.clone())
        .handle(&job)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Dock(_)));
    assert_eq!(h.dock.start_calls(), 2);
    assert_eq!(h.network.deleted().len(), 1);
    assert_eq!(
        h.network.deleted()[0].host_ip,
        job.inspect_data.label(labels::HOST_IP).unwrap()
    );

    let build = h.persistence.get_build("b-1").await.unwrap().unwrap();
    assert!(build.failed);
}

#[tokio::test]
async fn test_start_requires_context_version_label() {
    let h = Harness::new().await;
    let mut job = created_job(&h).await;
    job.inspect_data.config.labels.remove(labels::CONTEXT_VERSION_ID);

    let err = StartImageBuilderWorker::new(h.ctx.clone())
        .handle(&job)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MalformedEvent(_)));
    assert_eq!(h.dock.start_calls(), 0);
}

#[tokio::test]
async fn test_start_is_stale_once_started() {
    let h = Harness::new().await;
    let job = created_job(&h).await;
    let worker = StartImageBuilderWorker::new(h.ctx.clone());

    worker.handle(&job).await.unwrap();
    let err = worker.handle(&job).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(h.dock.start_calls(), 1);
}
