// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker remote API client.
//!
//! The dock host string is the base URL of the dock's API
//! (`http://10.0.1.4:4242`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::traits::*;

/// Dock client over the Docker remote API.
#[derive(Clone)]
pub struct HttpDock {
    client: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

impl HttpDock {
    /// Create a client with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DockError::Unavailable {
                host: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    fn url(host: &str, path: &str) -> String {
        format!("{}{}", host.trim_end_matches('/'), path)
    }

    async fn send(
        &self,
        host: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        request.send().await.map_err(|e| DockError::Unavailable {
            host: host.to_string(),
            message: e.to_string(),
        })
    }

    async fn status_error(response: reqwest::Response) -> DockError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        DockError::Status { status, message }
    }
}

#[async_trait]
impl Dock for HttpDock {
    async fn create_image_builder(&self, host: &str, spec: &ImageBuilderSpec) -> Result<String> {
        let body = json!({
            "Image": spec.image,
            "Env": spec.env(),
            "Labels": spec.labels(),
            "HostConfig": {
                "Privileged": true,
            },
        });

        let response = self
            .send(
                host,
                self.client
                    .post(Self::url(host, "/containers/create"))
                    .json(&body),
            )
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let created: CreateResponse = response
            .json()
            .await
            .map_err(|e| DockError::InvalidResponse(e.to_string()))?;

        debug!(
            host = %host,
            container_id = %created.id,
            context_version_id = %spec.context_version_id,
            "Image builder created"
        );
        Ok(created.id)
    }

    async fn start_container(&self, host: &str, container_id: &str) -> Result<()> {
        let response = self
            .send(
                host,
                self.client
                    .post(Self::url(host, &format!("/containers/{container_id}/start"))),
            )
            .await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_MODIFIED => Err(DockError::AlreadyStarted(container_id.to_string())),
            StatusCode::NOT_FOUND => Err(DockError::ContainerNotFound(container_id.to_string())),
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn inspect_container(&self, host: &str, container_id: &str) -> Result<ContainerInspect> {
        let response = self
            .send(
                host,
                self.client
                    .get(Self::url(host, &format!("/containers/{container_id}/json"))),
            )
            .await?;

        match response.status() {
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| DockError::InvalidResponse(e.to_string())),
            StatusCode::NOT_FOUND => Err(DockError::ContainerNotFound(container_id.to_string())),
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn get_build_logs(&self, host: &str, container_id: &str, tail: u32) -> Result<String> {
        let response = self
            .send(
                host,
                self.client
                    .get(Self::url(host, &format!("/containers/{container_id}/logs")))
                    .query(&[
                        ("stdout", "1".to_string()),
                        ("stderr", "1".to_string()),
                        ("tail", tail.to_string()),
                    ]),
            )
            .await?;

        match response.status() {
            s if s.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| DockError::InvalidResponse(e.to_string()))?;
                Ok(demux_log_stream(&body))
            }
            StatusCode::NOT_FOUND => Err(DockError::ContainerNotFound(container_id.to_string())),
            _ => Err(Self::status_error(response).await),
        }
    }
}

/// Strip Docker's multiplexed stream framing.
///
/// Each frame is an 8-byte header (`[stream, 0, 0, 0, len_be32]`) followed by
/// `len` bytes of payload. Containers started with a TTY return raw output,
/// which is passed through unchanged.
pub fn demux_log_stream(raw: &[u8]) -> String {
    let framed = raw.len() >= 8 && raw[0] <= 2 && raw[1..4] == [0, 0, 0];
    if !framed {
        return String::from_utf8_lossy(raw).into_owned();
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while rest.len() >= 8 {
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + len).min(rest.len());
        out.extend_from_slice(&rest[8..end]);
        rest = &rest[end..];
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn frame(stream: u8, payload: &str) -> Vec<u8> {
        let mut f = vec![stream, 0, 0, 0];
        f.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        f.extend_from_slice(payload.as_bytes());
        f
    }

    fn spec() -> ImageBuilderSpec {
        ImageBuilderSpec {
            image: "runnable/image-builder:v4".into(),
            context_id: "ctx-1".into(),
            context_version_id: "cv-1".into(),
            build_id: "b-1".into(),
            docker_tag: "registry.runnable.com/1/ctx-1:cv-1".into(),
            owner_username: "acme".into(),
            session_user_github_id: 42,
            manual_build: true,
            no_cache: false,
            dockerfile: None,
            repos: vec![],
            network: None,
            sauron_host: "10.0.0.1".into(),
        }
    }

    fn dock() -> HttpDock {
        HttpDock::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_demux_frames() {
        let mut raw = frame(1, "step 1\n");
        raw.extend(frame(2, "warning\n"));
        raw.extend(frame(1, "done\n"));
        assert_eq!(demux_log_stream(&raw), "step 1\nwarning\ndone\n");
    }

    #[test]
    fn test_demux_passes_tty_output_through() {
        assert_eq!(demux_log_stream(b"plain tty output\n"), "plain tty output\n");
    }

    #[tokio::test]
    async fn test_create_posts_labels_and_returns_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/containers/create"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"Id": "c1", "Warnings": []})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = dock()
            .create_image_builder(&server.uri(), &spec())
            .await
            .unwrap();
        assert_eq!(id, "c1");

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["Labels"]["contextVersion.build._id"], "b-1");
        assert_eq!(body["Labels"]["sessionUserGithubId"], "42");
        assert_eq!(body["Image"], "runnable/image-builder:v4");
    }

    #[tokio::test]
    async fn test_start_maps_304_to_already_started() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/containers/c1/start"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let err = dock().start_container(&server.uri(), "c1").await.unwrap_err();
        assert!(matches!(err, DockError::AlreadyStarted(id) if id == "c1"));
    }

    #[tokio::test]
    async fn test_inspect_reads_exit_code_and_labels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/containers/c1/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Id": "c1",
                "State": {"ExitCode": 124, "Running": false},
                "Config": {"Labels": {"ownerUsername": "acme"}}
            })))
            .mount(&server)
            .await;

        let inspect = dock().inspect_container(&server.uri(), "c1").await.unwrap();
        assert_eq!(inspect.exit_code(), Some(124));
        assert_eq!(inspect.label(labels::OWNER_USERNAME), Some("acme"));
    }

    #[tokio::test]
    async fn test_inspect_missing_container() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/containers/gone/json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = dock()
            .inspect_container(&server.uri(), "gone")
            .await
            .unwrap_err();
        assert!(matches!(err, DockError::ContainerNotFound(_)));
    }

    #[tokio::test]
    async fn test_logs_are_demultiplexed() {
        let server = MockServer::start().await;
        let mut body = frame(1, "Step 1/2\n");
        body.extend(frame(1, "Successfully built\n"));
        Mock::given(method("GET"))
            .and(path("/containers/c1/logs"))
            .and(query_param("tail", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let log = dock().get_build_logs(&server.uri(), "c1", 50).await.unwrap();
        assert_eq!(log, "Step 1/2\nSuccessfully built\n");
    }

    #[tokio::test]
    async fn test_unreachable_dock() {
        let err = dock()
            .inspect_container("http://127.0.0.1:1", "c1")
            .await
            .unwrap_err();
        assert!(matches!(err, DockError::Unavailable { .. }));
    }
}
