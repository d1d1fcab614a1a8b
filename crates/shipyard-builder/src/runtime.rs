// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for shipyard-builder.
//!
//! [`BuilderRuntime`] wires the workers together and runs them inside an
//! existing tokio application: the job dispatcher polls the outbox for
//! provisioning and start jobs, and the die-event subscriber consumes
//! container events pushed through [`BuilderRuntime::events_sender`].
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use shipyard_builder::dock::HttpDock;
//! use shipyard_builder::events::BroadcastEmitter;
//! use shipyard_builder::network::SauronClient;
//! use shipyard_builder::runtime::BuilderRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = shipyard_core::persistence::connect(&db_config).await?;
//!
//!     let runtime = BuilderRuntime::builder()
//!         .persistence(persistence)
//!         .dock(Arc::new(HttpDock::new(timeout)?))
//!         .network(Arc::new(SauronClient::new(3200, timeout)?))
//!         .emitter(Arc::new(BroadcastEmitter::default()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.events_sender().send(die_event).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use shipyard_core::Persistence;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::active_api::ActiveApi;
use crate::config::Config;
use crate::dispatcher::{JobDispatcher, JobDispatcherConfig};
use crate::dock::Dock;
use crate::docker_events::DockerEvents;
use crate::event_mutex::DockerEventMutex;
use crate::events::UpdateEmitter;
use crate::jobs::OutboxQueue;
use crate::network::NetworkAllocator;
use crate::workers::{ImageBuilderDiedWorker, WorkerContext};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Builder for creating a [`BuilderRuntime`].
#[derive(Default)]
pub struct BuilderRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    dock: Option<Arc<dyn Dock>>,
    network: Option<Arc<dyn NetworkAllocator>>,
    emitter: Option<Arc<dyn UpdateEmitter>>,
    config: Config,
    holder: Option<String>,
}

impl BuilderRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the dock client (required).
    pub fn dock(mut self, dock: Arc<dyn Dock>) -> Self {
        self.dock = Some(dock);
        self
    }

    /// Set the network allocator client (required).
    pub fn network(mut self, network: Arc<dyn NetworkAllocator>) -> Self {
        self.network = Some(network);
        self
    }

    /// Set the real-time update sink (required).
    pub fn emitter(mut self, emitter: Arc<dyn UpdateEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Set the builder configuration.
    ///
    /// Default: [`Config::default()`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the id this process uses for the active-API lease and job claims.
    ///
    /// Default: `shipyard-builder-<uuid>`
    pub fn holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = Some(holder.into());
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<BuilderRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let dock = self
            .dock
            .ok_or_else(|| anyhow::anyhow!("dock is required"))?;
        let network = self
            .network
            .ok_or_else(|| anyhow::anyhow!("network is required"))?;
        let emitter = self
            .emitter
            .ok_or_else(|| anyhow::anyhow!("emitter is required"))?;

        Ok(BuilderRuntimeConfig {
            persistence,
            dock,
            network,
            emitter,
            config: self.config,
            holder: self
                .holder
                .unwrap_or_else(|| format!("shipyard-builder-{}", uuid::Uuid::new_v4())),
        })
    }
}

/// Configuration for a [`BuilderRuntime`].
pub struct BuilderRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    dock: Arc<dyn Dock>,
    network: Arc<dyn NetworkAllocator>,
    emitter: Arc<dyn UpdateEmitter>,
    config: Config,
    holder: String,
}

impl BuilderRuntimeConfig {
    /// Start the runtime, spawning the dispatcher and die-event listener.
    pub async fn start(self) -> Result<BuilderRuntime> {
        let config = Arc::new(self.config);

        let ctx = WorkerContext {
            persistence: self.persistence.clone(),
            dock: self.dock,
            network: self.network,
            jobs: Arc::new(OutboxQueue::new(self.persistence.clone())),
            emitter: self.emitter,
            config: config.clone(),
        };

        // Die-event subscriber
        let events = Arc::new(DockerEvents::new(
            DockerEventMutex::new(self.persistence.clone(), config.event_lock_ttl),
            ActiveApi::new(self.persistence.clone(), &self.holder, config.active_api_ttl),
            ImageBuilderDiedWorker::new(ctx.clone()),
            config.image_builder_name.clone(),
        ));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let listener_handle = events.listen(events_rx);

        // Job dispatcher
        let dispatcher = JobDispatcher::new(
            ctx,
            JobDispatcherConfig {
                poll_interval: config.job_poll_interval,
                batch_size: config.job_batch_size,
                claimer: self.holder.clone(),
            },
        );
        let dispatcher_shutdown = dispatcher.shutdown_handle();
        let dispatcher_handle = tokio::spawn(async move {
            dispatcher.run().await;
        });

        info!(
            holder = %self.holder,
            image_builder = %config.image_builder_name,
            "BuilderRuntime started"
        );

        Ok(BuilderRuntime {
            dispatcher_handle,
            listener_handle,
            dispatcher_shutdown,
            events,
            events_tx,
            active_api: ActiveApi::new(self.persistence, &self.holder, config.active_api_ttl),
            config,
        })
    }
}

/// A running shipyard-builder instance.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct BuilderRuntime {
    dispatcher_handle: JoinHandle<()>,
    listener_handle: JoinHandle<()>,
    dispatcher_shutdown: Arc<Notify>,
    events: Arc<DockerEvents>,
    events_tx: mpsc::Sender<serde_json::Value>,
    active_api: ActiveApi,
    config: Arc<Config>,
}

impl BuilderRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> BuilderRuntimeBuilder {
        BuilderRuntimeBuilder::new()
    }

    /// Sender for raw die events.
    pub fn events_sender(&self) -> mpsc::Sender<serde_json::Value> {
        self.events_tx.clone()
    }

    /// The die-event subscriber.
    pub fn events(&self) -> &Arc<DockerEvents> {
        &self.events
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.dispatcher_handle.is_finished() && !self.listener_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the dispatcher, stops accepting die events and waits for admitted
    /// handlers to finish (bounded by `events_drain_timeout` when set), then
    /// gives up the active-API lease.
    pub async fn shutdown(self) -> Result<()> {
        info!("BuilderRuntime shutting down...");

        self.dispatcher_shutdown.notify_one();

        match self.config.events_drain_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, self.events.close()).await.is_err() {
                    warn!(
                        in_flight = self.events.in_flight(),
                        timeout_ms = limit.as_millis() as u64,
                        "Die event drain timed out"
                    );
                }
            }
            None => self.events.close().await,
        }

        // Our own sender must not keep the listener's channel open
        drop(self.events_tx);

        if let Err(e) = self.dispatcher_handle.await {
            error!("Job dispatcher task panicked: {}", e);
        }
        if let Err(e) = self.listener_handle.await {
            error!("Docker event listener task panicked: {}", e);
        }

        if let Err(e) = self.active_api.release().await {
            warn!(error = %e, "Failed to release active API lease");
        }

        info!("BuilderRuntime shutdown complete");
        Ok(())
    }
}
