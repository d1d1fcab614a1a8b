// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shipyard Builder - image builder lifecycle service
//!
//! Runs the provisioning and start workers against the job outbox and
//! consumes docker die events as JSON lines on stdin.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use shipyard_builder::config::Config;
use shipyard_builder::dock::HttpDock;
use shipyard_builder::events::BroadcastEmitter;
use shipyard_builder::network::SauronClient;
use shipyard_builder::runtime::BuilderRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shipyard_builder=info,shipyard_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let db_config = shipyard_core::config::Config::from_env()?;
    let config = Config::from_env()?;

    info!(
        image_builder = %config.image_builder_name,
        registry = %config.registry_domain,
        save_build_logs = config.save_build_logs,
        "Starting Shipyard Builder"
    );

    let persistence = shipyard_core::persistence::connect(&db_config).await?;
    info!("Connected to database");

    let dock = Arc::new(HttpDock::new(config.http_timeout)?);
    let network = Arc::new(SauronClient::new(config.sauron_port, config.http_timeout)?);
    let emitter = Arc::new(BroadcastEmitter::default());

    let runtime = BuilderRuntime::builder()
        .persistence(persistence)
        .dock(dock)
        .network(network)
        .emitter(emitter)
        .config(config)
        .build()?
        .start()
        .await?;

    // Feed die events from stdin
    let events = runtime.events_sender();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => {
                        if events.send(value).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring non-JSON event line"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Event input closed");
                    break;
                }
            }
        }
    });

    info!("Shipyard Builder ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    reader.abort();
    runtime.shutdown().await?;

    info!("Shipyard Builder shut down");

    Ok(())
}
