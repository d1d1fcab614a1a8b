// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP client for the per-dock network allocator.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use shipyard_core::model::NetworkInfo;
use tracing::{debug, info};

use super::{NetworkAllocator, NetworkError};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateNetworkResponse {
    network_ip: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateHostResponse {
    host_ip: String,
}

/// Network allocator client.
///
/// The allocator listens on `port` on the same machine as the dock. Owner
/// networks are cached per allocator so only the first build of an owner on
/// a dock creates a network.
pub struct SauronClient {
    client: reqwest::Client,
    port: u16,
    networks: Mutex<HashMap<(String, i64), String>>,
}

impl SauronClient {
    /// Create a client for allocators listening on `port`.
    pub fn new(port: u16, timeout: Duration) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NetworkError::Unavailable {
                host: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            port,
            networks: Mutex::new(HashMap::new()),
        })
    }

    /// Allocator base URL for a dock: the dock's hostname on the allocator port.
    pub fn base_url(&self, dock_host: &str) -> Result<String, NetworkError> {
        let with_scheme = if dock_host.contains("://") {
            dock_host.to_string()
        } else {
            format!("http://{dock_host}")
        };
        let url =
            Url::parse(&with_scheme).map_err(|_| NetworkError::InvalidHost(dock_host.to_string()))?;
        let hostname = url
            .host_str()
            .ok_or_else(|| NetworkError::InvalidHost(dock_host.to_string()))?;
        Ok(format!("{}://{}:{}", url.scheme(), hostname, self.port))
    }

    fn cached_network(&self, base: &str, owner_github: i64) -> Option<String> {
        self.networks
            .lock()
            .ok()
            .and_then(|n| n.get(&(base.to_string(), owner_github)).cloned())
    }

    fn cache_network(&self, base: &str, owner_github: i64, network_ip: &str) {
        if let Ok(mut networks) = self.networks.lock() {
            networks.insert((base.to_string(), owner_github), network_ip.to_string());
        }
    }

    async fn send(
        &self,
        base: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, NetworkError> {
        let response = request.send().await.map_err(|e| NetworkError::Unavailable {
            host: base.to_string(),
            message: e.to_string(),
        })?;
        if response.status().as_u16() >= 300 {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(NetworkError::Status { status, message });
        }
        Ok(response)
    }

    async fn create_network(&self, base: &str) -> Result<String, NetworkError> {
        let response = self
            .send(base, self.client.post(format!("{base}/networks")))
            .await?;
        let body: CreateNetworkResponse = response
            .json()
            .await
            .map_err(|e| NetworkError::InvalidResponse(e.to_string()))?;
        Ok(body.network_ip)
    }

    async fn create_host(&self, base: &str, network_ip: &str) -> Result<String, NetworkError> {
        let response = self
            .send(
                base,
                self.client
                    .post(format!("{base}/networks/{network_ip}/hosts")),
            )
            .await?;
        let body: CreateHostResponse = response
            .json()
            .await
            .map_err(|e| NetworkError::InvalidResponse(e.to_string()))?;
        Ok(body.host_ip)
    }
}

#[async_trait]
impl NetworkAllocator for SauronClient {
    async fn find_or_create_host(
        &self,
        dock_host: &str,
        owner_github: i64,
    ) -> Result<NetworkInfo, NetworkError> {
        let base = self.base_url(dock_host)?;

        let network_ip = match self.cached_network(&base, owner_github) {
            Some(ip) => ip,
            None => {
                let ip = self.create_network(&base).await?;
                info!(
                    allocator = %base,
                    owner_github = owner_github,
                    network_ip = %ip,
                    "Network created"
                );
                self.cache_network(&base, owner_github, &ip);
                ip
            }
        };

        let host_ip = self.create_host(&base, &network_ip).await?;
        debug!(network_ip = %network_ip, host_ip = %host_ip, "Host allocated");
        Ok(NetworkInfo {
            network_ip,
            host_ip,
        })
    }

    async fn delete_host(
        &self,
        dock_host: &str,
        network: &NetworkInfo,
    ) -> Result<(), NetworkError> {
        let base = self.base_url(dock_host)?;
        let url = format!(
            "{base}/networks/{}/hosts/{}",
            network.network_ip, network.host_ip
        );
        match self.send(&base, self.client.delete(url)).await {
            Err(NetworkError::Status { status: 404, .. }) => Ok(()),
            other => other.map(|_| ()),
        }
    }
}
