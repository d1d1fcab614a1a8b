// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job dispatch and the embedded runtime, end to end.

mod common;

use std::future::Future;
use std::time::Duration;

use common::*;
use serde_json::json;
use shipyard_builder::dispatcher::{JobDispatcher, JobDispatcherConfig};
use shipyard_builder::dock::Dock;
use shipyard_builder::jobs::{ImageBuilderCreatedJob, Job, JobQueue, OutboxQueue, queues};
use shipyard_builder::runtime::BuilderRuntime;

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_dispatcher_runs_and_acks_jobs() {
    let h = Harness::new().await;
    h.seed_build("cv-1", "b-1").await;
    let queue = OutboxQueue::new(h.persistence.clone());

    queue
        .publish(&Job::CreateImageBuilder(create_job("cv-1")))
        .await
        .unwrap();
    // Stale and undecodable jobs are acknowledged too
    queue
        .publish(&Job::CreateImageBuilder(create_job("cv-missing")))
        .await
        .unwrap();
    h.persistence
        .enqueue_job(queues::CREATE_IMAGE_BUILDER_CONTAINER, &json!({"bogus": 1}))
        .await
        .unwrap();
    // Not ours
    h.persistence
        .enqueue_job(queues::PUSH_IMAGE, &json!({"buildId": "b-9"}))
        .await
        .unwrap();

    let dispatcher = JobDispatcher::new(h.ctx.clone(), JobDispatcherConfig::default());
    assert_eq!(dispatcher.process_batch().await.unwrap(), 3);
    assert_eq!(dispatcher.process_batch().await.unwrap(), 0);

    assert!(h.jobs(queues::CREATE_IMAGE_BUILDER_CONTAINER).await.is_empty());
    assert_eq!(h.jobs(queues::PUSH_IMAGE).await.len(), 1);
    assert_eq!(h.dock.create_calls(), 1);

    let cv = h
        .persistence
        .get_context_version("cv-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cv.build.docker_container.as_deref(), Some("container-1"));
}

#[test]
fn test_builder_requires_collaborators() {
    let err = BuilderRuntime::builder().build().err().unwrap();
    assert!(err.to_string().contains("persistence"));
}

#[tokio::test]
async fn test_runtime_drives_build_to_deploy() {
    let h = Harness::new().await;
    let cv = h.seed_build("cv-1", "b-1").await;
    h.seed_instance(&instance("i-1", &cv)).await;

    let config = shipyard_builder::Config {
        job_poll_interval: Duration::from_millis(10),
        events_drain_timeout: Some(Duration::from_secs(5)),
        ..test_config()
    };
    let runtime = BuilderRuntime::builder()
        .persistence(h.persistence.clone())
        .dock(h.dock.clone())
        .network(h.network.clone())
        .emitter(h.emitter.clone())
        .config(config)
        .holder("api-1")
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.is_running());

    let queue = OutboxQueue::new(h.persistence.clone());
    queue
        .publish(&Job::CreateImageBuilder(create_job("cv-1")))
        .await
        .unwrap();

    let persistence = h.persistence.clone();
    eventually("container assignment", || {
        let persistence = persistence.clone();
        async move {
            persistence
                .get_context_version("cv-1")
                .await
                .unwrap()
                .is_some_and(|cv| cv.build.docker_container.is_some())
        }
    })
    .await;

    let inspect = h
        .dock
        .inspect_container(DOCK_HOST, "container-1")
        .await
        .unwrap();
    queue
        .publish(&Job::ImageBuilderCreated(ImageBuilderCreatedJob {
            id: "container-1".into(),
            host: DOCK_HOST.into(),
            inspect_data: inspect,
        }))
        .await
        .unwrap();

    eventually("container start", || {
        let persistence = persistence.clone();
        async move {
            persistence
                .get_context_version("cv-1")
                .await
                .unwrap()
                .is_some_and(|cv| cv.build.container_started.is_some())
        }
    })
    .await;
    assert!(h.dock.is_started("container-1"));

    // The mock records the container as created but never exited; give it an exit code
    h.dock.add_exited_container(
        "container-1",
        builder_labels("cv-1", "b-1"),
        0,
        "done\n",
    );
    runtime
        .events_sender()
        .send(die_event("u-1", "container-1"))
        .await
        .unwrap();

    eventually("build completion", || {
        let persistence = persistence.clone();
        async move {
            persistence
                .get_context_version("cv-1")
                .await
                .unwrap()
                .is_some_and(|cv| cv.build.is_completed())
        }
    })
    .await;

    runtime.shutdown().await.unwrap();

    let cv = h
        .persistence
        .get_context_version("cv-1")
        .await
        .unwrap()
        .unwrap();
    assert!(!cv.build.failed);
    assert!(cv.build.container_started.is_some());
    assert_eq!(h.jobs(queues::CREATE_INSTANCE_CONTAINER).await.len(), 1);
    assert!(h.jobs(queues::ON_IMAGE_BUILDER_CONTAINER_CREATE).await.is_empty());

    // Lease given up on shutdown
    assert!(
        h.persistence
            .try_acquire_lock("active-api", "api-2", Duration::from_secs(30))
            .await
            .unwrap()
    );
}
