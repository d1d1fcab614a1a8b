// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model for the image-builder lifecycle.
//!
//! Only the state-relevant subset of each entity is modelled here. The
//! [`ContextVersion`] carries its build sub-document inline, and an
//! [`Instance`] holds its own flattened copy of the context version it runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Owner of a context, context version, or instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    /// GitHub account id of the owning user or org.
    pub github: i64,
    /// GitHub login, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Repository checkout attached to a context version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppCodeVersion {
    /// Full repository name (`owner/name`).
    pub repo: String,
    /// Branch checked out.
    pub branch: String,
    /// Commit sha, when pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Additional repositories are attached with `additional_repo = true`.
    #[serde(default)]
    pub additional_repo: bool,
}

impl AppCodeVersion {
    /// Repository name normalised for matching.
    pub fn lower_repo(&self) -> String {
        self.repo.to_lowercase()
    }
}

/// What caused a build to start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggeredAction {
    /// Build was requested by a user.
    #[serde(default)]
    pub manual: bool,
    /// Build is a rebuild of an existing context version.
    #[serde(default)]
    pub rebuild: bool,
    /// Commit that triggered a hook build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_code_version: Option<AppCodeVersion>,
}

/// Error recorded on a failed build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    /// Human readable failure reason.
    pub message: String,
    /// Optional stack or transport detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl BuildError {
    /// Create an error with a message and no stack.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack/detail string.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Private network allocation for a build container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    /// Network the host was allocated on.
    pub network_ip: String,
    /// Host address allocated to the container.
    pub host_ip: String,
}

/// Coarse state of a context version, stored alongside the build fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextVersionState {
    /// Build requested, image builder not created yet.
    BuildStarting,
    /// Image builder container created on a dock.
    BuildStarted,
    /// Image builder exited with code 0.
    BuildSucceeded,
    /// Image builder failed or could not be provisioned.
    BuildErrored,
}

impl ContextVersionState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildStarting => "build_starting",
            Self::BuildStarted => "build_started",
            Self::BuildSucceeded => "build_succeeded",
            Self::BuildErrored => "build_errored",
        }
    }

    /// Parse a stored state. Unknown values map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "build_starting" => Some(Self::BuildStarting),
            "build_started" => Some(Self::BuildStarted),
            "build_succeeded" => Some(Self::BuildSucceeded),
            "build_errored" => Some(Self::BuildErrored),
            _ => None,
        }
    }
}

/// Position of a build in its lifecycle.
///
/// ```text
/// Pending ──started──► Started ──die event──► CompletedSuccess
///                                     └─────► CompletedFailure
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    /// No `started` timestamp.
    Pending,
    /// Started, not completed.
    Started,
    /// Completed with `failed = false`.
    CompletedSuccess,
    /// Completed with `failed = true`.
    CompletedFailure,
}

/// The build sub-document of a context version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    /// Build id. Shared by deduplicated copies of the same build.
    pub id: String,
    /// Dedup hash of the build inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Build message (`autodeploy`, `manual`, commit message, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// What caused the build.
    #[serde(default)]
    pub triggered_action: TriggeredAction,
    /// When the build was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// When the image builder container started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_started: Option<DateTime<Utc>>,
    /// When the build reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    /// Whether the build failed.
    #[serde(default)]
    pub failed: bool,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BuildError>,
    /// Captured build output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    /// Image builder container id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_container: Option<String>,
    /// Dock the image builder runs on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_host: Option<String>,
    /// Tag of the image being built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_tag: Option<String>,
    /// Network allocation of the image builder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkInfo>,
}

impl BuildInfo {
    /// New, not yet started build.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hash: None,
            message: None,
            triggered_action: TriggeredAction::default(),
            started: None,
            container_started: None,
            completed: None,
            failed: false,
            error: None,
            log: None,
            docker_container: None,
            docker_host: None,
            docker_tag: None,
            network: None,
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> BuildPhase {
        match (self.started, self.completed) {
            (_, Some(_)) if self.failed => BuildPhase::CompletedFailure,
            (_, Some(_)) => BuildPhase::CompletedSuccess,
            (Some(_), None) => BuildPhase::Started,
            (None, None) => BuildPhase::Pending,
        }
    }

    /// True once `completed` is set.
    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }
}

/// One buildable snapshot of a code context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextVersion {
    /// Context version id.
    pub id: String,
    /// Owning context.
    pub context_id: String,
    /// Owner of the context.
    pub owner: Owner,
    /// Infra code version (Dockerfile and files), resolved lazily.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infra_code_version_id: Option<String>,
    /// Repositories checked out into the build.
    #[serde(default)]
    pub app_code_versions: Vec<AppCodeVersion>,
    /// Coarse build state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ContextVersionState>,
    /// Build sub-document.
    pub build: BuildInfo,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ContextVersion {
    /// The primary (non-additional) repository, if any.
    pub fn main_app_code_version(&self) -> Option<&AppCodeVersion> {
        self.app_code_versions.iter().find(|acv| !acv.additional_repo)
    }

    /// True when the build was started by a repository hook with the
    /// `autodeploy` message rather than by a user.
    pub fn is_autodeploy(&self) -> bool {
        !self.build.triggered_action.manual && self.build.message.as_deref() == Some("autodeploy")
    }
}

/// A code context (project/service definition).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    /// Context id.
    pub id: String,
    /// Context name.
    pub name: String,
    /// Owner.
    pub owner: Owner,
}

/// Infrastructure code (Dockerfile and build files) of a context version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraCodeVersion {
    /// Infra code version id.
    pub id: String,
    /// Context this infra code belongs to.
    pub context_id: String,
    /// Dockerfile contents, if stored inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
}

/// A logical build request grouping one or more context versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    /// Build id.
    pub id: String,
    /// Owner.
    pub owner: Owner,
    /// Context versions built by this build.
    pub context_versions: Vec<String>,
    /// When the build was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// When the build reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    /// Whether the build failed.
    #[serde(default)]
    pub failed: bool,
    /// Context versions that errored before producing a result.
    #[serde(default)]
    pub errored_context_versions: Vec<String>,
}

/// A deployment of a context version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Instance id.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Owner.
    pub owner: Owner,
    /// Whether this is the master pod of its environment.
    #[serde(default)]
    pub master_pod: bool,
    /// Whether the instance was created by auto-fork.
    #[serde(default)]
    pub auto_forked: bool,
    /// Locked instances do not receive autodeploys.
    #[serde(default)]
    pub locked: bool,
    /// Isolation group this instance belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolated: Option<String>,
    /// Whether this instance is its isolation group's master.
    #[serde(default)]
    pub is_isolation_group_master: bool,
    /// Flattened copy of the deployed context version. Replaced wholesale on redeploy.
    pub context_version: ContextVersion,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A group of instances deployed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Isolation {
    /// Isolation id.
    pub id: String,
    /// Owner.
    pub owner: Owner,
    /// Instance that is the group master.
    pub group_master: String,
    /// Whether killing the group redeploys it.
    pub redeploy_on_killed: bool,
}

/// Terminal result of an image builder run, committed onto every
/// not-yet-completed context version that references the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    /// Whether the build failed.
    pub failed: bool,
    /// Failure reason, when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BuildError>,
    /// Captured build output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    /// Dock the builder ran on.
    pub docker_host: String,
    /// Exit code of the builder, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> BuildInfo {
        BuildInfo::new("build-1")
    }

    #[test]
    fn test_build_phase_transitions() {
        let mut b = build();
        assert_eq!(b.phase(), BuildPhase::Pending);

        b.started = Some(Utc::now());
        assert_eq!(b.phase(), BuildPhase::Started);

        b.completed = Some(Utc::now());
        assert_eq!(b.phase(), BuildPhase::CompletedSuccess);

        b.failed = true;
        assert_eq!(b.phase(), BuildPhase::CompletedFailure);
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ContextVersionState::BuildStarting,
            ContextVersionState::BuildStarted,
            ContextVersionState::BuildSucceeded,
            ContextVersionState::BuildErrored,
        ] {
            assert_eq!(ContextVersionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ContextVersionState::parse("bogus"), None);
    }

    #[test]
    fn test_is_autodeploy_requires_message_and_non_manual() {
        let mut cv = ContextVersion {
            id: "cv".into(),
            context_id: "ctx".into(),
            owner: Owner {
                github: 1,
                username: None,
            },
            infra_code_version_id: None,
            app_code_versions: vec![],
            state: None,
            build: build(),
            created_at: Utc::now(),
        };
        assert!(!cv.is_autodeploy());

        cv.build.message = Some("autodeploy".into());
        assert!(cv.is_autodeploy());

        cv.build.triggered_action.manual = true;
        assert!(!cv.is_autodeploy());
    }

    #[test]
    fn test_main_app_code_version_skips_additional_repos() {
        let acvs = vec![
            AppCodeVersion {
                repo: "Org/Lib".into(),
                branch: "main".into(),
                commit: None,
                additional_repo: true,
            },
            AppCodeVersion {
                repo: "Org/App".into(),
                branch: "dev".into(),
                commit: Some("abc".into()),
                additional_repo: false,
            },
        ];
        let cv = ContextVersion {
            id: "cv".into(),
            context_id: "ctx".into(),
            owner: Owner {
                github: 1,
                username: None,
            },
            infra_code_version_id: None,
            app_code_versions: acvs,
            state: None,
            build: build(),
            created_at: Utc::now(),
        };
        let main = cv.main_app_code_version().unwrap();
        assert_eq!(main.repo, "Org/App");
        assert_eq!(main.lower_repo(), "org/app");
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let mut b = build();
        b.docker_container = Some("c1".into());
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["dockerContainer"], "c1");
        assert!(json.get("completed").is_none());
    }
}
