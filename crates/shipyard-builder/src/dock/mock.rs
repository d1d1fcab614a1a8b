// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock dock for testing.
//!
//! Keeps containers in memory and lets tests script failures per operation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use super::traits::*;

#[derive(Debug, Clone, Default)]
struct MockContainer {
    inspect: ContainerInspect,
    logs: String,
    started: bool,
}

/// In-memory dock.
#[derive(Default)]
pub struct MockDock {
    containers: Mutex<HashMap<String, MockContainer>>,
    created: Mutex<Vec<(String, ImageBuilderSpec)>>,
    create_calls: AtomicU32,
    start_calls: AtomicU32,
    inspect_calls: AtomicU32,
    /// Number of leading create calls that fail
    create_failures: AtomicU32,
    /// Number of leading start calls that fail
    start_failures: AtomicU32,
    /// Inspect and log calls fail as if the dock were down
    unreachable: AtomicBool,
    /// Start reports "already started"
    already_started: AtomicBool,
}

impl MockDock {
    /// Create an empty mock dock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` create calls.
    pub fn fail_creates(&self, n: u32) {
        self.create_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the first `n` start calls.
    pub fn fail_starts(&self, n: u32) {
        self.start_failures.store(n, Ordering::SeqCst);
    }

    /// Make start report that the container is already running.
    pub fn report_already_started(&self) {
        self.already_started.store(true, Ordering::SeqCst);
    }

    /// Make inspect and log fetches fail with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Register an exited container with labels, exit code and log output.
    pub fn add_exited_container(
        &self,
        container_id: &str,
        labels: HashMap<String, String>,
        exit_code: i64,
        logs: &str,
    ) {
        let inspect = ContainerInspect {
            id: Some(container_id.to_string()),
            state: ContainerState {
                exit_code: Some(exit_code),
                running: false,
            },
            config: ContainerConfig {
                labels,
                image: None,
            },
        };
        self.lock_containers().insert(
            container_id.to_string(),
            MockContainer {
                inspect,
                logs: logs.to_string(),
                started: true,
            },
        );
    }

    /// Number of create calls made.
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of start calls made.
    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// Number of inspect calls made.
    pub fn inspect_calls(&self) -> u32 {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    /// Successful creates as `(host, spec)`.
    pub fn created(&self) -> Vec<(String, ImageBuilderSpec)> {
        self.created
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Whether the container was started.
    pub fn is_started(&self, container_id: &str) -> bool {
        self.lock_containers()
            .get(container_id)
            .is_some_and(|c| c.started)
    }

    fn lock_containers(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockContainer>> {
        self.containers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn unavailable(host: &str) -> DockError {
        DockError::Unavailable {
            host: host.to_string(),
            message: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl Dock for MockDock {
    async fn create_image_builder(&self, host: &str, spec: &ImageBuilderSpec) -> Result<String> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if Self::take_failure(&self.create_failures) {
            return Err(Self::unavailable(host));
        }

        let container_id = format!("container-{n}");
        let inspect = ContainerInspect {
            id: Some(container_id.clone()),
            state: ContainerState::default(),
            config: ContainerConfig {
                labels: spec.labels(),
                image: Some(spec.image.clone()),
            },
        };
        self.lock_containers().insert(
            container_id.clone(),
            MockContainer {
                inspect,
                ..Default::default()
            },
        );
        if let Ok(mut created) = self.created.lock() {
            created.push((host.to_string(), spec.clone()));
        }
        Ok(container_id)
    }

    async fn start_container(&self, host: &str, container_id: &str) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.start_failures) {
            return Err(Self::unavailable(host));
        }
        if self.already_started.load(Ordering::SeqCst) {
            return Err(DockError::AlreadyStarted(container_id.to_string()));
        }
        match self.lock_containers().get_mut(container_id) {
            Some(container) => {
                container.started = true;
                Ok(())
            }
            None => Err(DockError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn inspect_container(&self, host: &str, container_id: &str) -> Result<ContainerInspect> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Self::unavailable(host));
        }
        self.lock_containers()
            .get(container_id)
            .map(|c| c.inspect.clone())
            .ok_or_else(|| DockError::ContainerNotFound(container_id.to_string()))
    }

    async fn get_build_logs(&self, host: &str, container_id: &str, tail: u32) -> Result<String> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Self::unavailable(host));
        }
        let containers = self.lock_containers();
        let container = containers
            .get(container_id)
            .ok_or_else(|| DockError::ContainerNotFound(container_id.to_string()))?;
        let lines: Vec<&str> = container.logs.lines().collect();
        let skip = lines.len().saturating_sub(tail as usize);
        Ok(lines[skip..].join("\n"))
    }
}
