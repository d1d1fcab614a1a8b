// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker die-event subscriber.
//!
//! Each event goes through: validation, the active-API check, the
//! image-builder filter, then the event mutex. Only the holder of the
//! event's lock runs the completion resolver, and it always unlocks
//! afterwards whatever the outcome.
//!
//! `close()` stops accepting events and waits until every handler that
//! got past admission has finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::Deserialize;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::active_api::ActiveApi;
use crate::dock::ContainerInspect;
use crate::error::{Error, Result};
use crate::event_mutex::DockerEventMutex;
use crate::workers::{DieOutcome, ImageBuilderDiedWorker};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDieEvent {
    uuid: Option<String>,
    id: Option<String>,
    host: Option<String>,
    time: Option<i64>,
    from: Option<String>,
    inspect_data: Option<ContainerInspect>,
}

/// A validated container die event.
#[derive(Debug, Clone, PartialEq)]
pub struct DieEvent {
    /// Unique event id, used as the lock key.
    pub uuid: String,
    /// Container id.
    pub id: String,
    /// Dock the container ran on.
    pub host: String,
    /// Event time.
    pub time: i64,
    /// Image the container was created from.
    pub from: String,
    /// Inspection captured with the event, if the transport attached one.
    pub inspect_data: Option<ContainerInspect>,
}

impl DieEvent {
    /// Parse and validate a raw event. `uuid`, `id`, `host`, `from` must be
    /// non-empty and `time` present.
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let raw: RawDieEvent = serde_json::from_value(value.clone())
            .map_err(|e| Error::MalformedEvent(e.to_string()))?;

        fn required(field: &str, value: Option<String>) -> Result<String> {
            match value {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(Error::MalformedEvent(format!("missing {field}"))),
            }
        }

        Ok(DieEvent {
            uuid: required("uuid", raw.uuid)?,
            id: required("id", raw.id)?,
            host: required("host", raw.host)?,
            time: raw
                .time
                .ok_or_else(|| Error::MalformedEvent("missing time".to_string()))?,
            from: required("from", raw.from)?,
            inspect_data: raw.inspect_data,
        })
    }
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDisposition {
    /// Missing required fields; dropped.
    Malformed,
    /// Another replica holds the active-API lease.
    NotActive,
    /// Not an image builder; another path handles it.
    NotImageBuilder,
    /// Another handler owns the event.
    Locked,
    /// Subscriber is closing; event not accepted.
    Closing,
    /// The resolver ran.
    Handled(DieOutcome),
}

/// Decrements the in-flight count on drop and wakes `close()` at zero.
struct InFlight<'a> {
    events: &'a DockerEvents,
}

impl<'a> InFlight<'a> {
    fn enter(events: &'a DockerEvents) -> Self {
        events.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { events }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.events.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.events.drained.notify_waiters();
        }
    }
}

/// Die-event subscriber.
pub struct DockerEvents {
    mutex: DockerEventMutex,
    active_api: ActiveApi,
    worker: ImageBuilderDiedWorker,
    image_builder_name: String,
    in_flight: AtomicUsize,
    closing: AtomicBool,
    stop: Notify,
    drained: Notify,
}

impl DockerEvents {
    /// Create a subscriber.
    pub fn new(
        mutex: DockerEventMutex,
        active_api: ActiveApi,
        worker: ImageBuilderDiedWorker,
        image_builder_name: impl Into<String>,
    ) -> Self {
        Self {
            mutex,
            active_api,
            worker,
            image_builder_name: image_builder_name.into(),
            in_flight: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            stop: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Handlers currently admitted.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether `close()` has been called.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Consume events from `rx`, handling each on its own task, until the
    /// channel closes or `close()` is called.
    pub fn listen(self: &Arc<Self>, mut rx: mpsc::Receiver<serde_json::Value>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!("Docker event listener started");
            loop {
                // Registered before the closing check so a concurrent close()
                // cannot slip between the two
                let stop = this.stop.notified();
                tokio::pin!(stop);
                stop.as_mut().enable();
                if this.is_closing() {
                    break;
                }
                tokio::select! {
                    _ = &mut stop => break,
                    msg = rx.recv() => match msg {
                        Some(value) => {
                            let handler = this.clone();
                            tokio::spawn(async move {
                                match handler.handle_die(&value).await {
                                    Ok(disposition) => trace!(disposition = ?disposition, "Event processed"),
                                    Err(e) if e.is_expected() => debug!(error = %e, "Event dropped"),
                                    Err(e) => error!(error = %e, "Die event handling failed"),
                                }
                            });
                        }
                        None => break,
                    },
                }
            }
            info!("Docker event listener stopped");
        })
    }

    /// Stop accepting events and wait for admitted handlers to unlock.
    ///
    /// Has no timeout of its own; a handler that never finishes keeps this
    /// pending.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();

        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            let remaining = self.in_flight();
            if remaining == 0 {
                break;
            }
            info!(in_flight = remaining, "Waiting for in-flight die events");
            drained.await;
        }
        info!("Docker event listener closed");
    }

    /// Handle one raw die event.
    pub async fn handle_die(&self, value: &serde_json::Value) -> Result<EventDisposition> {
        // Count first so close() cannot miss a handler that is being admitted
        let _in_flight = InFlight::enter(self);
        if self.is_closing() {
            return Ok(EventDisposition::Closing);
        }

        let event = match DieEvent::parse(value) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Malformed die event dropped");
                return Ok(EventDisposition::Malformed);
            }
        };

        if !self.active_api.is_me().await? {
            trace!(event_uuid = %event.uuid, "Not the active API, ignoring die event");
            return Ok(EventDisposition::NotActive);
        }

        if !event.from.contains(&self.image_builder_name) {
            trace!(container_id = %event.id, from = %event.from, "Not an image builder");
            return Ok(EventDisposition::NotImageBuilder);
        }

        if !self.mutex.lock(&event.uuid).await? {
            debug!(event_uuid = %event.uuid, container_id = %event.id, "Die event handled elsewhere");
            return Ok(EventDisposition::Locked);
        }

        let outcome = self.worker.handle(&event).await;

        if let Err(e) = self.mutex.unlock(&event.uuid).await {
            error!(event_uuid = %event.uuid, error = %e, "Failed to unlock die event");
        }

        outcome.map(EventDisposition::Handled)
    }
}
