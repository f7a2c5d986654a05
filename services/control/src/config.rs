//! Configuration for the control plane daemon.
//!
//! Everything is environment driven (`EDGEWARD_*`), with defaults suitable for
//! a single host running `cloudflared` next to Docker.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// How the tunnel daemon is signalled for restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMode {
    /// Daemon runs as a container; signalled through the Docker Engine API.
    Container,
    /// Daemon runs as a host process tracked by a pid file.
    Process,
}

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP command surface listen address.
    pub listen_addr: SocketAddr,

    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// SQLite database path.
    pub database_path: PathBuf,

    /// Path of the ingress mapping file read by the tunnel daemon.
    pub ingress_path: PathBuf,

    /// Tunnel UUID (rendered into the ingress file and used as CNAME target).
    pub tunnel_id: String,

    /// Credentials file referenced by the ingress file.
    pub credentials_file: PathBuf,

    /// Docker Engine Unix socket.
    pub docker_socket: PathBuf,

    /// Name of the container running the tunnel daemon, if containerised.
    pub tunnel_container: Option<String>,

    /// Restart signalling mode.
    pub daemon_mode: DaemonMode,

    /// Pid file of the daemon (process mode).
    pub pid_file: PathBuf,

    /// Command handing the start of a new daemon instance to the process supervisor.
    pub start_command: Vec<String>,

    /// Readiness URL of the tunnel daemon.
    pub liveness_url: String,

    /// Period between liveness checks.
    pub check_interval: Duration,

    /// Grace window between the stop signal and force termination.
    pub grace_window: Duration,

    /// How long the daemon must stay up before the backoff index resets.
    pub sustained_up: Duration,

    /// Upper bound for any DNS provider or container runtime call.
    pub provider_timeout: Duration,

    /// Zone snapshots older than this are refreshed before being served.
    pub zone_staleness: Duration,

    /// Background zone refresh period.
    pub zone_refresh_interval: Duration,

    /// Drift reconciliation period.
    pub reconcile_interval: Duration,

    /// JSON file mapping owning workloads to their allocated ports.
    pub port_allocations_file: PathBuf,

    /// Workloads acting as privileged operators.
    pub privileged_workloads: Vec<String>,

    /// Use the in-memory DNS provider (no credentials needed).
    pub dev_mode: bool,

    /// Zones served by the in-memory DNS provider in dev mode.
    pub dev_zones: Vec<String>,

    /// Cloudflare API base URL.
    pub dns_api_url: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("EDGEWARD_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:7300".to_string())
            .parse()
            .context("EDGEWARD_LISTEN_ADDR must be a socket address.")?;

        let data_dir = PathBuf::from(
            std::env::var("EDGEWARD_DATA_DIR").unwrap_or_else(|_| "/var/lib/edgeward".to_string()),
        );

        let database_path = std::env::var("EDGEWARD_DATABASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("edgeward.db"));

        let ingress_path = std::env::var("EDGEWARD_INGRESS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/cloudflared/config.yml"));

        let tunnel_id = std::env::var("EDGEWARD_TUNNEL_ID")
            .context("Missing tunnel id. Set EDGEWARD_TUNNEL_ID.")?;

        let credentials_file = std::env::var("EDGEWARD_CREDENTIALS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(format!("/etc/cloudflared/{tunnel_id}.json")));

        let docker_socket = PathBuf::from(
            std::env::var("EDGEWARD_DOCKER_SOCKET")
                .unwrap_or_else(|_| "/var/run/docker.sock".to_string()),
        );

        let tunnel_container = std::env::var("EDGEWARD_TUNNEL_CONTAINER")
            .ok()
            .filter(|s| !s.is_empty());

        let daemon_mode = match std::env::var("EDGEWARD_DAEMON_MODE").as_deref() {
            Ok("process") => DaemonMode::Process,
            Ok("container") => DaemonMode::Container,
            Ok(other) => anyhow::bail!("EDGEWARD_DAEMON_MODE must be 'container' or 'process', got '{other}'."),
            Err(_) if tunnel_container.is_some() => DaemonMode::Container,
            Err(_) => DaemonMode::Process,
        };

        let pid_file = std::env::var("EDGEWARD_PID_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/run/cloudflared.pid"));

        let start_command = std::env::var("EDGEWARD_START_COMMAND")
            .unwrap_or_else(|_| "systemctl start cloudflared".to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let liveness_url = std::env::var("EDGEWARD_LIVENESS_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:20241/ready".to_string());

        let port_allocations_file = std::env::var("EDGEWARD_PORT_ALLOCATIONS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("ports.json"));

        let privileged_workloads = std::env::var("EDGEWARD_PRIVILEGED_WORKLOADS")
            .unwrap_or_else(|_| "operator".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let dev_mode = std::env::var("EDGEWARD_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let dev_zones = std::env::var("EDGEWARD_DEV_ZONES")
            .unwrap_or_else(|_| "example.com".to_string())
            .split(',')
            .map(|z| z.trim().to_lowercase())
            .filter(|z| !z.is_empty())
            .collect();

        let dns_api_url = std::env::var("EDGEWARD_DNS_API_URL")
            .unwrap_or_else(|_| "https://api.cloudflare.com/client/v4".to_string());

        let log_level = std::env::var("EDGEWARD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            data_dir,
            database_path,
            ingress_path,
            tunnel_id,
            credentials_file,
            docker_socket,
            tunnel_container,
            daemon_mode,
            pid_file,
            start_command,
            liveness_url,
            check_interval: secs_var("EDGEWARD_CHECK_INTERVAL_SECS", 30)?,
            grace_window: secs_var("EDGEWARD_GRACE_SECS", 10)?,
            sustained_up: secs_var("EDGEWARD_SUSTAINED_UP_SECS", 300)?,
            provider_timeout: secs_var("EDGEWARD_PROVIDER_TIMEOUT_SECS", 10)?,
            zone_staleness: secs_var("EDGEWARD_ZONE_STALENESS_SECS", 600)?,
            zone_refresh_interval: secs_var("EDGEWARD_ZONE_REFRESH_SECS", 3600)?,
            reconcile_interval: secs_var("EDGEWARD_RECONCILE_SECS", 300)?,
            port_allocations_file,
            privileged_workloads,
            dev_mode,
            dev_zones,
            dns_api_url,
            log_level,
        })
    }
}

fn secs_var(name: &str, default: u64) -> Result<Duration> {
    let secs: u64 = std::env::var(name)
        .ok()
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{name} must be an integer (seconds)."))?
        .unwrap_or(default);
    Ok(Duration::from_secs(secs.max(1)))
}
