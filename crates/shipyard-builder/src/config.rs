// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for shipyard-builder.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Builder configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Image name of the image builder. A die event is an image-builder die
    /// when its `from` contains this name.
    pub image_builder_name: String,
    /// Attempts for creating the image builder container
    pub create_container_attempts: u32,
    /// Attempts for starting the image builder container
    pub start_container_attempts: u32,
    /// Pause between dock attempts
    pub docker_retry_interval: Duration,
    /// Attempts for network allocator calls
    pub sauron_attempts: u32,
    /// Pause between network allocator attempts
    pub sauron_retry_interval: Duration,
    /// Fetch the build log tail from the dock on completion
    pub save_build_logs: bool,
    /// Number of log lines kept
    pub build_log_tail_lines: u32,
    /// Registry prefix of docker tags
    pub registry_domain: String,
    /// Network allocator port on each dock
    pub sauron_port: u16,
    /// Expiry of a die-event lock
    pub event_lock_ttl: Duration,
    /// Expiry of the active-api lease
    pub active_api_ttl: Duration,
    /// Upper bound on the shutdown drain. `None` waits for every in-flight handler.
    pub events_drain_timeout: Option<Duration>,
    /// Job outbox poll interval
    pub job_poll_interval: Duration,
    /// Jobs claimed per poll
    pub job_batch_size: i64,
    /// Request timeout for dock and network allocator calls
    pub http_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_builder_name: "runnable/image-builder".to_string(),
            create_container_attempts: 5,
            start_container_attempts: 5,
            docker_retry_interval: Duration::from_millis(1000),
            sauron_attempts: 3,
            sauron_retry_interval: Duration::from_millis(1000),
            save_build_logs: false,
            build_log_tail_lines: 1000,
            registry_domain: "registry.runnable.com".to_string(),
            sauron_port: 3200,
            event_lock_ttl: Duration::from_millis(60_000),
            active_api_ttl: Duration::from_millis(30_000),
            events_drain_timeout: None,
            job_poll_interval: Duration::from_millis(1000),
            job_batch_size: 10,
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            image_builder_name: std::env::var("DOCKER_IMAGE_BUILDER_NAME")
                .unwrap_or(defaults.image_builder_name),
            create_container_attempts: parse_attempts(
                "WORKER_CREATE_CONTAINER_NUMBER_RETRY_ATTEMPTS",
                defaults.create_container_attempts,
            )?,
            start_container_attempts: parse_attempts(
                "WORKER_START_CONTAINER_NUMBER_RETRY_ATTEMPTS",
                defaults.start_container_attempts,
            )?,
            docker_retry_interval: parse_millis(
                "WORKER_DOCKER_RETRY_INTERVAL",
                defaults.docker_retry_interval,
            )?,
            sauron_attempts: parse_attempts("WORKER_SAURON_RETRY_ATTEMPTS", defaults.sauron_attempts)?,
            sauron_retry_interval: parse_millis(
                "WORKER_SAURON_RETRY_INTERVAL",
                defaults.sauron_retry_interval,
            )?,
            save_build_logs: parse_flag("SAVE_BUILD_LOGS"),
            build_log_tail_lines: parse_num("BUILD_LOG_TAIL_LINES", defaults.build_log_tail_lines)?,
            registry_domain: std::env::var("REGISTRY_DOMAIN").unwrap_or(defaults.registry_domain),
            sauron_port: parse_num("SAURON_PORT", defaults.sauron_port)?,
            event_lock_ttl: parse_millis("DOCKER_EVENT_LOCK_TTL_MS", defaults.event_lock_ttl)?,
            active_api_ttl: parse_millis("ACTIVE_API_TTL_MS", defaults.active_api_ttl)?,
            events_drain_timeout: match std::env::var("EVENTS_DRAIN_TIMEOUT_MS") {
                Ok(v) => Some(Duration::from_millis(
                    v.parse()
                        .map_err(|_| ConfigError::Invalid("EVENTS_DRAIN_TIMEOUT_MS"))?,
                )),
                Err(_) => None,
            },
            job_poll_interval: parse_millis("JOB_POLL_INTERVAL_MS", defaults.job_poll_interval)?,
            job_batch_size: parse_num("JOB_BATCH_SIZE", defaults.job_batch_size)?,
            http_timeout: parse_millis("HTTP_TIMEOUT_MS", defaults.http_timeout)?,
        })
    }

    /// Retry policy for creating the image builder.
    pub fn create_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.create_container_attempts, self.docker_retry_interval)
    }

    /// Retry policy for starting the image builder.
    pub fn start_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.start_container_attempts, self.docker_retry_interval)
    }

    /// Retry policy for network allocator calls.
    pub fn sauron_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.sauron_attempts, self.sauron_retry_interval)
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

fn parse_attempts(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    let attempts = parse_num(key, default)?;
    if attempts == 0 {
        return Err(ConfigError::Invalid(key));
    }
    Ok(attempts)
}

fn parse_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

fn parse_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A numeric environment variable could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}
