// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Real-time update events for context versions and instances.
//!
//! The socket transport is someone else's concern; the builder only emits
//! snapshots onto a broadcast channel that transports subscribe to.

use serde::Serialize;
use shipyard_core::model::{ContextVersion, Instance};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Context version update actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextVersionAction {
    /// Image builder created.
    BuildStarted,
    /// Image builder running.
    BuildRunning,
    /// Build reached a terminal state.
    BuildComplete,
}

/// Instance update actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceAction {
    /// Instance document changed.
    Patch,
    /// Instance is being redeployed with a new build.
    Deploy,
}

/// An update pushed to real-time subscribers, carrying the mutated snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UpdateEvent {
    /// Context version changed.
    ContextVersion {
        /// What happened.
        action: ContextVersionAction,
        /// Snapshot after the change.
        data: Box<ContextVersion>,
    },
    /// Instance changed.
    Instance {
        /// What happened.
        action: InstanceAction,
        /// Snapshot after the change.
        data: Box<Instance>,
    },
}

impl UpdateEvent {
    /// Context version update.
    pub fn context_version(action: ContextVersionAction, cv: &ContextVersion) -> Self {
        UpdateEvent::ContextVersion {
            action,
            data: Box::new(cv.clone()),
        }
    }

    /// Instance update.
    pub fn instance(action: InstanceAction, instance: &Instance) -> Self {
        UpdateEvent::Instance {
            action,
            data: Box::new(instance.clone()),
        }
    }
}

/// Sink for real-time updates. Emission never fails the caller.
pub trait UpdateEmitter: Send + Sync {
    /// Emit an update.
    fn emit(&self, event: UpdateEvent);
}

/// Emitter backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastEmitter {
    sender: broadcast::Sender<UpdateEvent>,
}

impl BroadcastEmitter {
    /// Create an emitter buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future updates.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl UpdateEmitter for BroadcastEmitter {
    fn emit(&self, event: UpdateEvent) {
        match &event {
            UpdateEvent::ContextVersion { action, data } => {
                debug!(context_version_id = %data.id, action = ?action, "Context version update");
            }
            UpdateEvent::Instance { action, data } => {
                debug!(instance_id = %data.id, action = ?action, "Instance update");
            }
        }
        // No subscribers is fine
        if self.sender.send(event).is_err() {
            trace!("No update subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shipyard_core::model::{BuildInfo, Owner};

    fn cv() -> ContextVersion {
        ContextVersion {
            id: "cv-1".into(),
            context_id: "ctx-1".into(),
            owner: Owner {
                github: 1,
                username: None,
            },
            infra_code_version_id: None,
            app_code_versions: vec![],
            state: None,
            build: BuildInfo::new("b-1"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_snapshots() {
        let emitter = BroadcastEmitter::default();
        let mut rx = emitter.subscribe();

        emitter.emit(UpdateEvent::context_version(
            ContextVersionAction::BuildComplete,
            &cv(),
        ));

        match rx.recv().await.unwrap() {
            UpdateEvent::ContextVersion { action, data } => {
                assert_eq!(action, ContextVersionAction::BuildComplete);
                assert_eq!(data.id, "cv-1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        BroadcastEmitter::new(4).emit(UpdateEvent::context_version(
            ContextVersionAction::BuildStarted,
            &cv(),
        ));
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(UpdateEvent::context_version(
            ContextVersionAction::BuildRunning,
            &cv(),
        ))
        .unwrap();
        assert_eq!(json["kind"], "contextVersion");
        assert_eq!(json["action"], "build_running");
        assert_eq!(json["data"]["id"], "cv-1");
    }
}
