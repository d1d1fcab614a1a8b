// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dock trait definitions.
//!
//! A dock is a host running a Docker-compatible remote API. Every call names
//! the dock it targets, so a single client serves the whole fleet.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipyard_core::model::NetworkInfo;
use thiserror::Error;

/// Label keys written onto image builder containers and read back from
/// create and die events.
pub mod labels {
    /// Context version id.
    pub const CONTEXT_VERSION_ID: &str = "contextVersion.id";
    /// Build id shared by deduplicated context versions.
    pub const CONTEXT_VERSION_BUILD_ID: &str = "contextVersion.build._id";
    /// Context id.
    pub const CONTEXT_ID: &str = "contextVersion.context";
    /// Owner login.
    pub const OWNER_USERNAME: &str = "ownerUsername";
    /// GitHub id of the user that requested the build.
    pub const SESSION_USER_GITHUB_ID: &str = "sessionUserGithubId";
    /// Tag of the image being built.
    pub const DOCKER_TAG: &str = "dockerTag";
    /// Manual build flag.
    pub const MANUAL_BUILD: &str = "manualBuild";
    /// No-cache flag.
    pub const NO_CACHE: &str = "noCache";
    /// Network of the allocated host.
    pub const NETWORK_IP: &str = "networkIp";
    /// Allocated host.
    pub const HOST_IP: &str = "hostIp";
    /// Dock whose network allocator owns the host.
    pub const SAURON_HOST: &str = "sauronHost";
    /// Container role marker.
    pub const TYPE: &str = "type";
}

/// Errors from dock operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DockError {
    /// Dock could not be reached.
    #[error("Dock unavailable at {host}: {message}")]
    Unavailable {
        /// Dock address.
        host: String,
        /// Transport error.
        message: String,
    },

    /// Container does not exist on the dock.
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Start requested for a container that is already running (HTTP 304).
    #[error("Container already started: {0}")]
    AlreadyStarted(String),

    /// Dock answered with an unexpected status.
    #[error("Dock returned status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Response body could not be decoded.
    #[error("Invalid dock response: {0}")]
    InvalidResponse(String),
}

/// Result type for dock operations.
pub type Result<T> = std::result::Result<T, DockError>;

/// `State` section of a container inspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    /// Exit code of the main process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Whether the container is running.
    #[serde(default)]
    pub running: bool,
}

/// `Config` section of a container inspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    /// Container labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Image the container was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Subset of a Docker container inspection the builder reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    /// Container id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Process state.
    #[serde(default)]
    pub state: ContainerState,
    /// Creation config.
    #[serde(default)]
    pub config: ContainerConfig,
}

impl ContainerInspect {
    /// Label value, if set.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.labels.get(key).map(String::as_str)
    }

    /// Exit code recorded by the dock.
    pub fn exit_code(&self) -> Option<i64> {
        self.state.exit_code
    }
}

/// Everything the dock needs to create an image builder container.
#[derive(Debug, Clone)]
pub struct ImageBuilderSpec {
    /// Image builder image name.
    pub image: String,
    /// Context id.
    pub context_id: String,
    /// Context version id.
    pub context_version_id: String,
    /// Build id of the context version.
    pub build_id: String,
    /// Tag the built image is pushed as.
    pub docker_tag: String,
    /// Owner login.
    pub owner_username: String,
    /// GitHub id of the requesting user.
    pub session_user_github_id: i64,
    /// Manual build flag.
    pub manual_build: bool,
    /// Disable the docker layer cache.
    pub no_cache: bool,
    /// Dockerfile of the infra code version, if stored inline.
    pub dockerfile: Option<String>,
    /// Repositories to check out, as `repo#branch@commit`.
    pub repos: Vec<String>,
    /// Network allocation of the builder.
    pub network: Option<NetworkInfo>,
    /// Dock whose network allocator owns the host.
    pub sauron_host: String,
}

impl ImageBuilderSpec {
    /// Labels written onto the container.
    pub fn labels(&self) -> HashMap<String, String> {
        let mut map = HashMap::from([
            (labels::CONTEXT_VERSION_ID.to_string(), self.context_version_id.clone()),
            (labels::CONTEXT_VERSION_BUILD_ID.to_string(), self.build_id.clone()),
            (labels::CONTEXT_ID.to_string(), self.context_id.clone()),
            (labels::OWNER_USERNAME.to_string(), self.owner_username.clone()),
            (
                labels::SESSION_USER_GITHUB_ID.to_string(),
                self.session_user_github_id.to_string(),
            ),
            (labels::DOCKER_TAG.to_string(), self.docker_tag.clone()),
            (labels::MANUAL_BUILD.to_string(), self.manual_build.to_string()),
            (labels::NO_CACHE.to_string(), self.no_cache.to_string()),
            (labels::SAURON_HOST.to_string(), self.sauron_host.clone()),
            (labels::TYPE.to_string(), "image-builder-container".to_string()),
        ]);
        if let Some(network) = &self.network {
            map.insert(labels::NETWORK_IP.to_string(), network.network_ip.clone());
            map.insert(labels::HOST_IP.to_string(), network.host_ip.clone());
        }
        map
    }

    /// Environment passed to the image builder process.
    pub fn env(&self) -> Vec<String> {
        let mut env = vec![
            format!("RUNNABLE_DOCKERTAG={}", self.docker_tag),
            format!("RUNNABLE_DOCKER_NO_CACHE={}", self.no_cache),
            format!("RUNNABLE_REPO={}", self.repos.join(";")),
        ];
        if let Some(network) = &self.network {
            env.push(format!("RUNNABLE_NETWORK_IP={}", network.network_ip));
            env.push(format!("RUNNABLE_HOST_IP={}", network.host_ip));
        }
        if let Some(dockerfile) = &self.dockerfile {
            env.push(format!("RUNNABLE_DOCKERFILE={dockerfile}"));
        }
        env
    }
}

/// Client for the docks' container API.
///
/// Implementations are pure transport: they never touch the database.
#[async_trait]
pub trait Dock: Send + Sync {
    /// Create (but do not start) an image builder. Returns the container id.
    async fn create_image_builder(&self, host: &str, spec: &ImageBuilderSpec) -> Result<String>;

    /// Start a created container. Returns [`DockError::AlreadyStarted`] when
    /// the container is already running.
    async fn start_container(&self, host: &str, container_id: &str) -> Result<()>;

    /// Inspect a container.
    async fn inspect_container(&self, host: &str, container_id: &str) -> Result<ContainerInspect>;

    /// Last `tail` lines of the container's combined output.
    async fn get_build_logs(&self, host: &str, container_id: &str, tail: u32) -> Result<String>;
}
