// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job dispatcher.
//!
//! Polls the outbox for the queues this service owns and runs the matching
//! worker. Jobs are acknowledged whether the worker succeeds or fails: a
//! failed provisioning has already been recorded on the build, and
//! re-running it would only loop.

use std::sync::Arc;
use std::time::Duration;

use shipyard_core::Persistence;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::jobs::{Job, queues};
use crate::workers::{CreateImageBuilderWorker, StartImageBuilderWorker, WorkerContext};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct JobDispatcherConfig {
    /// How often to poll for jobs
    pub poll_interval: Duration,
    /// Maximum jobs claimed per poll
    pub batch_size: i64,
    /// Claimer id recorded on claimed jobs
    pub claimer: String,
}

impl Default for JobDispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            claimer: "shipyard-builder".to_string(),
        }
    }
}

/// Runs provisioning and start jobs from the outbox.
pub struct JobDispatcher {
    persistence: Arc<dyn Persistence>,
    create: CreateImageBuilderWorker,
    start: StartImageBuilderWorker,
    config: JobDispatcherConfig,
    shutdown: Arc<Notify>,
}

impl JobDispatcher {
    /// Create a dispatcher over the given workers' context.
    pub fn new(ctx: WorkerContext, config: JobDispatcherConfig) -> Self {
        Self {
            persistence: ctx.persistence.clone(),
            create: CreateImageBuilderWorker::new(ctx.clone()),
            start: StartImageBuilderWorker::new(ctx),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the poll loop until shutdown is signalled.
    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Job dispatcher started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Job dispatcher shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_batch().await {
                        error!(error = %e, "Failed to process job batch");
                    }
                }
            }
        }
    }

    /// Claim and run one batch. Returns the number of jobs processed.
    pub async fn process_batch(&self) -> Result<usize> {
        let owned = [
            queues::CREATE_IMAGE_BUILDER_CONTAINER.to_string(),
            queues::ON_IMAGE_BUILDER_CONTAINER_CREATE.to_string(),
        ];
        let records = self
            .persistence
            .claim_jobs(&owned, &self.config.claimer, self.config.batch_size)
            .await?;

        if records.is_empty() {
            return Ok(0);
        }
        debug!(count = records.len(), "Claimed jobs");

        for record in &records {
            let outcome = match Job::from_record(record) {
                Ok(Job::CreateImageBuilder(job)) => self.create.handle(&job).await,
                Ok(Job::ImageBuilderCreated(job)) => self.start.handle(&job).await,
                Ok(other) => {
                    warn!(queue = other.queue(), job_id = record.id, "Job on a queue this service does not run");
                    Ok(())
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => debug!(job_id = record.id, queue = %record.queue, "Job completed"),
                Err(e) if e.is_expected() => {
                    info!(job_id = record.id, queue = %record.queue, reason = %e, "Job skipped")
                }
                Err(e) => error!(job_id = record.id, queue = %record.queue, error = %e, "Job failed"),
            }

            if let Err(e) = self.persistence.ack_job(record.id).await {
                error!(job_id = record.id, error = %e, "Failed to ack job");
            }
        }

        Ok(records.len())
    }
}
