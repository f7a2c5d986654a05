//! Docker Engine API client.
//!
//! Speaks HTTP over the local Unix socket. Only the handful of endpoints the
//! control plane needs are covered: listing networks and containers for
//! topology, and signal/start/inspect for restarting a containerised
//! tunnel daemon.
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::HashMap;
use std::path::Path;

use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error};

/// Errors from the Docker Engine API.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Docker API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("container runtime call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl crate::retry::Transient for DockerError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Request(_) | Self::Json(_) => false,
        }
    }

    fn timed_out(after: std::time::Duration) -> Self {
        Self::Timeout(after)
    }
}

/// Entry from `GET /networks`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
}

/// Entry from `GET /containers/json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortEntry>,
    #[serde(default)]
    pub network_settings: Option<ContainerNetworks>,
}

impl ContainerSummary {
    /// Primary name without Docker's leading slash.
    pub fn name(&self) -> String {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| self.id.chars().take(12).collect())
    }

    /// IDs of every network the container is attached to.
    pub fn network_ids(&self) -> Vec<String> {
        self.network_settings
            .as_ref()
            .map(|s| s.networks.values().map(|n| n.network_id.clone()).collect())
            .unwrap_or_default()
    }
}

/// A container port, optionally published on the host.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortEntry {
    pub private_port: u16,
    #[serde(default)]
    pub public_port: Option<u16>,
    #[serde(rename = "Type", default)]
    pub protocol: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerNetworks {
    #[serde(default)]
    pub networks: HashMap<String, EndpointSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSettings {
    #[serde(rename = "NetworkID", default)]
    pub network_id: String,
}

/// Subset of `GET /containers/{name}/json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub state: ContainerState,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub running: bool,
}

/// Docker Engine API client over a Unix socket.
pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerClient {
    /// Create a client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        Self {
            socket_path,
            client: Client::unix(),
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    pub async fn list_networks(&self) -> Result<Vec<NetworkSummary>, DockerError> {
        self.get("/networks").await
    }

    /// Running containers.
    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        self.get("/containers/json").await
    }

    pub async fn inspect_container(&self, name: &str) -> Result<ContainerInspect, DockerError> {
        self.get(&format!("/containers/{name}/json")).await
    }

    /// Send a signal to the container's main process.
    ///
    /// A container that is not running is not an error.
    pub async fn signal_container(&self, name: &str, signal: &str) -> Result<(), DockerError> {
        self.post(
            &format!("/containers/{name}/kill?signal={signal}"),
            &[StatusCode::CONFLICT],
        )
        .await
    }

    pub async fn start_container(&self, name: &str) -> Result<(), DockerError> {
        self.post(&format!("/containers/{name}/start"), &[StatusCode::NOT_MODIFIED])
            .await
    }

    /// POST with an empty body, accepting 2xx and any of `also_ok`.
    async fn post(&self, path: &str, also_ok: &[StatusCode]) -> Result<(), DockerError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(path = path, "POST request to Docker API");

        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())?;

        let response = self.client.request(request).await?;
        let status = response.status();

        if status.is_success() || also_ok.contains(&status) {
            Ok(())
        } else {
            let body = hyper::body::to_bytes(response.into_body()).await?;
            let message = String::from_utf8_lossy(&body).to_string();
            error!(status = %status, message = %message, "Docker API error");
            Err(DockerError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, DockerError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(path = path, "GET request to Docker API");

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;

        if status.is_success() {
            Ok(serde_json::from_slice(&body)?)
        } else {
            Err(DockerError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).to_string(),
            })
        }
    }
}
