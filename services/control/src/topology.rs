//! Topology Inspector.
//!
//! Decides how the tunnel daemon reaches a target port. Resolution is
//! fixed-priority and recomputed from a fresh snapshot on every call:
//!
//! 1. a container on one of the daemon's networks exposing the port
//!    (`container:<name>:<port>`)
//! 2. a container publishing the port to the host (`host:localhost:<port>`)
//! 3. a host process listening on the port (`host:localhost:<port>`)
//!
//! If nothing matches, [`TopologyError::Unreachable`] lists what was checked.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::docker::{DockerClient, DockerError};
use crate::retry::{self, RetryPolicy};
use crate::state::{StateStore, TargetKind};

/// Errors from topology resolution.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("port {port} is not reachable from the tunnel")]
    Unreachable {
        port: u16,
        checks: Vec<String>,
        hint: String,
    },

    #[error("container runtime error: {0}")]
    Runtime(#[from] DockerError),
}

/// A network in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
}

/// A container port, optionally published on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishedPort {
    pub container_port: u16,
    pub host_port: Option<u16>,
}

/// A running container in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub name: String,
    pub network_ids: Vec<String>,
    pub published_ports: Vec<PublishedPort>,
}

/// Point-in-time view of the container topology.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    pub captured_at: DateTime<Utc>,
    pub networks: Vec<NetworkInfo>,
    pub containers: Vec<ContainerInfo>,
}

/// Which check produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPath {
    SharedNetwork,
    PublishedPort,
    HostProcess,
}

/// Where the tunnel should send traffic for a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub kind: TargetKind,
    pub address: String,
    pub path: ResolutionPath,
}

impl Resolution {
    fn container(name: &str, port: u16) -> Self {
        Self {
            kind: TargetKind::Container,
            address: format!("{name}:{port}"),
            path: ResolutionPath::SharedNetwork,
        }
    }

    fn host(port: u16, path: ResolutionPath) -> Self {
        Self {
            kind: TargetKind::Host,
            address: format!("localhost:{port}"),
            path,
        }
    }

    /// `kind:address`, e.g. `container:web:5073`.
    pub fn target(&self) -> String {
        format!("{}:{}", self.kind, self.address)
    }
}

/// Source of network and container listings.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, DockerError>;
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, DockerError>;
}

/// Checks whether something on the host accepts connections on a port.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn is_listening(&self, port: u16) -> bool;
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, DockerError> {
        Ok(DockerClient::list_networks(self)
            .await?
            .into_iter()
            .map(|n| NetworkInfo {
                id: n.id,
                name: n.name,
            })
            .collect())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, DockerError> {
        Ok(DockerClient::list_containers(self)
            .await?
            .into_iter()
            .map(|c| ContainerInfo {
                name: c.name(),
                network_ids: c.network_ids(),
                published_ports: c
                    .ports
                    .iter()
                    .filter(|p| p.protocol.is_empty() || p.protocol == "tcp")
                    .map(|p| PublishedPort {
                        container_port: p.private_port,
                        host_port: p.public_port,
                    })
                    .collect(),
            })
            .collect())
    }
}

/// Fixed topology, used when no container runtime is available and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRuntime {
    pub networks: Vec<NetworkInfo>,
    pub containers: Vec<ContainerInfo>,
}

#[async_trait]
impl ContainerRuntime for StaticRuntime {
    async fn list_networks(&self) -> Result<Vec<NetworkInfo>, DockerError> {
        Ok(self.networks.clone())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, DockerError> {
        Ok(self.containers.clone())
    }
}

/// Probes the host with a bounded TCP connect to `127.0.0.1:<port>`.
pub struct TcpHostProbe {
    timeout: Duration,
}

impl TcpHostProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HostProbe for TcpHostProbe {
    async fn is_listening(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }
}

/// Host probe answering from a fixed port set.
#[derive(Debug, Clone, Default)]
pub struct StaticHostProbe {
    pub listening: HashSet<u16>,
}

#[async_trait]
impl HostProbe for StaticHostProbe {
    async fn is_listening(&self, port: u16) -> bool {
        self.listening.contains(&port)
    }
}

/// Resolve via the container paths only (checks 1 and 2).
pub fn resolve_in_snapshot(
    snapshot: &TopologySnapshot,
    daemon_container: Option<&str>,
    port: u16,
) -> Option<Resolution> {
    let mut candidates: Vec<&ContainerInfo> = snapshot
        .containers
        .iter()
        .filter(|c| Some(c.name.as_str()) != daemon_container)
        .collect();
    candidates.sort_by(|a, b| a.name.cmp(&b.name));

    let daemon_networks: HashSet<&str> = daemon_container
        .and_then(|name| snapshot.containers.iter().find(|c| c.name == name))
        .map(|c| c.network_ids.iter().map(String::as_str).collect())
        .unwrap_or_default();

    if !daemon_networks.is_empty() {
        let shared = candidates.iter().find(|c| {
            c.network_ids
                .iter()
                .any(|id| daemon_networks.contains(id.as_str()))
                && c.published_ports.iter().any(|p| p.container_port == port)
        });
        if let Some(container) = shared {
            return Some(Resolution::container(&container.name, port));
        }
    }

    candidates
        .iter()
        .any(|c| c.published_ports.iter().any(|p| p.host_port == Some(port)))
        .then(|| Resolution::host(port, ResolutionPath::PublishedPort))
}

/// Topology Inspector.
pub struct TopologyInspector {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HostProbe>,
    daemon_container: Option<String>,
    timeout: Duration,
    retry: RetryPolicy,
    store: Option<Arc<StateStore>>,
}

impl TopologyInspector {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HostProbe>,
        daemon_container: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            probe,
            daemon_container,
            timeout,
            retry: RetryPolicy::default(),
            store: None,
        }
    }

    /// Keep a diagnostic copy of each snapshot in the state store.
    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Take a fresh snapshot of networks and containers.
    pub async fn snapshot(&self) -> Result<TopologySnapshot, DockerError> {
        let networks = retry::call(&self.retry, self.timeout, "list_networks", || {
            self.runtime.list_networks()
        })
        .await?;
        let containers = retry::call(&self.retry, self.timeout, "list_containers", || {
            self.runtime.list_containers()
        })
        .await?;

        let snapshot = TopologySnapshot {
            captured_at: Utc::now(),
            networks,
            containers,
        };

        if let Some(store) = &self.store {
            match serde_json::to_string(&snapshot) {
                Ok(json) => {
                    if let Err(e) = store.record_topology_snapshot(snapshot.captured_at, &json) {
                        warn!(error = %e, "Failed to record topology snapshot");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize topology snapshot"),
            }
        }

        Ok(snapshot)
    }

    /// Resolve how the tunnel reaches `port`.
    pub async fn resolve(&self, port: u16) -> Result<Resolution, TopologyError> {
        let snapshot = self.snapshot().await?;
        let daemon = self.daemon_container.as_deref();

        if let Some(resolution) = resolve_in_snapshot(&snapshot, daemon, port) {
            debug!(port, target = %resolution.target(), "Resolved via container topology");
            return Ok(resolution);
        }

        if self.probe.is_listening(port).await {
            debug!(port, "Resolved via host process");
            return Ok(Resolution::host(port, ResolutionPath::HostProcess));
        }

        let network_check = match daemon {
            Some(name) => format!(
                "no container sharing a network with '{name}' exposes port {port}"
            ),
            None => "tunnel daemon is not containerised; shared-network check skipped".to_string(),
        };

        Err(TopologyError::Unreachable {
            port,
            checks: vec![
                network_check,
                format!("no container publishes port {port} to the host"),
                format!("nothing accepts connections on 127.0.0.1:{port}"),
            ],
            hint: match daemon {
                Some(name) => format!(
                    "start the service, or attach its container to a network shared with '{name}' \
                     (docker network connect <network> <container>)"
                ),
                None => format!("start the service so it listens on port {port} on the host"),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str, networks: &[&str], ports: &[(u16, Option<u16>)]) -> ContainerInfo {
        ContainerInfo {
            name: name.to_string(),
            network_ids: networks.iter().map(|n| n.to_string()).collect(),
            published_ports: ports
                .iter()
                .map(|&(container_port, host_port)| PublishedPort {
                    container_port,
                    host_port,
                })
                .collect(),
        }
    }

    fn inspector(containers: Vec<ContainerInfo>, listening: &[u16]) -> TopologyInspector {
        let runtime = StaticRuntime {
            networks: vec![NetworkInfo {
                id: "tunnel-net".to_string(),
                name: "tunnel".to_string(),
            }],
            containers,
        };
        let probe = StaticHostProbe {
            listening: listening.iter().copied().collect(),
        };
        TopologyInspector::new(
            Arc::new(runtime),
            Arc::new(probe),
            Some("cloudflared".to_string()),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_shared_network_container() {
        let inspector = inspector(
            vec![
                container("cloudflared", &["tunnel-net"], &[]),
                container("web", &["tunnel-net"], &[(5073, None)]),
            ],
            &[],
        );

        let resolution = inspector.resolve(5073).await.unwrap();
        assert_eq!(resolution.target(), "container:web:5073");
        assert_eq!(resolution.path, ResolutionPath::SharedNetwork);
    }

    #[tokio::test]
    async fn test_network_path_beats_published_port() {
        let inspector = inspector(
            vec![
                container("cloudflared", &["tunnel-net"], &[]),
                container("web", &["tunnel-net"], &[(5073, Some(5073))]),
            ],
            &[5073],
        );

        let resolution = inspector.resolve(5073).await.unwrap();
        assert_eq!(resolution.kind, TargetKind::Container);
    }

    #[tokio::test]
    async fn test_published_port_on_other_network() {
        let inspector = inspector(
            vec![
                container("cloudflared", &["tunnel-net"], &[]),
                container("api", &["other-net"], &[(80, Some(5000))]),
            ],
            &[],
        );

        let resolution = inspector.resolve(5000).await.unwrap();
        assert_eq!(resolution.target(), "host:localhost:5000");
        assert_eq!(resolution.path, ResolutionPath::PublishedPort);
    }

    #[tokio::test]
    async fn test_container_on_other_network_does_not_use_network_path() {
        let inspector = inspector(
            vec![
                container("cloudflared", &["tunnel-net"], &[]),
                container("api", &["other-net"], &[(5000, None)]),
            ],
            &[],
        );

        assert!(matches!(
            inspector.resolve(5000).await,
            Err(TopologyError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_host_process() {
        let inspector = inspector(vec![container("cloudflared", &["tunnel-net"], &[])], &[5000]);

        let resolution = inspector.resolve(5000).await.unwrap();
        assert_eq!(resolution.target(), "host:localhost:5000");
        assert_eq!(resolution.path, ResolutionPath::HostProcess);
    }

    #[tokio::test]
    async fn test_unreachable_lists_checks() {
        let inspector = inspector(vec![container("cloudflared", &["tunnel-net"], &[])], &[]);

        match inspector.resolve(6000).await {
            Err(TopologyError::Unreachable { port, checks, hint }) => {
                assert_eq!(port, 6000);
                assert_eq!(checks.len(), 3);
                assert!(hint.contains("cloudflared"));
            }
            other => panic!("expected unreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_daemon_container_is_never_a_target() {
        let inspector = inspector(
            vec![container("cloudflared", &["tunnel-net"], &[(20241, Some(20241))])],
            &[],
        );

        assert!(inspector.resolve(20241).await.is_err());
    }

    #[test]
    fn test_containers_considered_in_name_order() {
        let snapshot = TopologySnapshot {
            captured_at: Utc::now(),
            networks: vec![],
            containers: vec![
                container("cloudflared", &["n"], &[]),
                container("zeta", &["n"], &[(8080, None)]),
                container("alpha", &["n"], &[(8080, None)]),
            ],
        };

        let resolution = resolve_in_snapshot(&snapshot, Some("cloudflared"), 8080).unwrap();
        assert_eq!(resolution.address, "alpha:8080");
    }

    #[test]
    fn test_uncontainerised_daemon_skips_network_path() {
        let snapshot = TopologySnapshot {
            captured_at: Utc::now(),
            networks: vec![],
            containers: vec![container("web", &["n"], &[(5073, None)])],
        };

        assert!(resolve_in_snapshot(&snapshot, None, 5073).is_none());
    }

    #[tokio::test]
    async fn test_snapshot_recorded_for_diagnostics() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let inspector = inspector(vec![container("web", &["n"], &[])], &[]).with_store(store.clone());

        inspector.snapshot().await.unwrap();

        let stored = store.latest_topology_snapshot().unwrap().unwrap();
        assert!(stored.snapshot_json.contains("\"web\""));
    }
}
