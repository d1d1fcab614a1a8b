// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shipyard Builder - image builder container lifecycle
//!
//! Drives the container that builds a context version's image from request
//! to terminal state:
//!
//! ```text
//!  create-image-builder-container job
//!        │  allocate network host, create container (retried)
//!        ▼
//!  on-image-builder-container-create job
//!        │  start container (retried), mark containerStarted
//!        ▼
//!  docker die event
//!        │  active-API check, image-builder filter, event mutex
//!        ▼
//!  completion resolver
//!        │  commit completed/failed, complete builds, emit updates
//!        ▼
//!  fan-out (successful builds only)
//!           autodeploy, isolation kill, create-instance-container jobs
//! ```
//!
//! Every step after the commit is best-effort: a build that reached a
//! terminal state stays there whatever happens downstream.
//!
//! # Collaborators
//!
//! | Trait | Production | Tests |
//! |-------|------------|-------|
//! | [`dock::Dock`] | [`dock::HttpDock`] | [`dock::MockDock`] |
//! | [`network::NetworkAllocator`] | [`network::SauronClient`] | [`network::MockNetwork`] |
//! | [`jobs::JobQueue`] | [`jobs::OutboxQueue`] | [`jobs::OutboxQueue`] |
//! | [`events::UpdateEmitter`] | [`events::BroadcastEmitter`] | [`events::BroadcastEmitter`] |

#![deny(missing_docs)]

/// Active-API lease.
pub mod active_api;

/// Configuration loaded from environment variables.
pub mod config;

/// Outbox job dispatcher.
pub mod dispatcher;

/// Dock (container host) client.
pub mod dock;

/// Die-event subscriber.
pub mod docker_events;

/// Error types.
pub mod error;

/// Per-event distributed mutex.
pub mod event_mutex;

/// Real-time update events.
pub mod events;

/// Fan-out of successful builds to instances.
pub mod fan_out;

/// Isolation guard for fan-out.
pub mod isolation;

/// Job queues and payloads.
pub mod jobs;

/// Network allocator client.
pub mod network;

/// Background network host release.
pub mod network_dealloc;

/// Bounded retry.
pub mod retry;

/// Embeddable runtime.
pub mod runtime;

/// Lifecycle workers.
pub mod workers;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{Error, Result};
