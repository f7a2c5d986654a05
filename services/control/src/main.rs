//! Edgeward control plane daemon.
//!
//! Supervises the tunnel daemon, brokers route requests over HTTP, and keeps
//! DNS records, the ingress file and the routing records in agreement.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use edgeward_control::{
    api,
    app::AppState,
    broker::{BrokerParts, RoutingBroker},
    collaborators::{EnvSecretStore, FilePortAuthority, StaticWorkloadRegistry},
    config::{Config, DaemonMode},
    dns::{CloudflareProvider, DnsProvider, MemoryDnsProvider},
    docker::DockerClient,
    health::{HealthSupervisor, HttpLivenessProbe},
    ingress::IngressWriter,
    reconcile::Reconciler,
    restart::{ContainerDaemon, DaemonControl, ProcessDaemon, RestartController},
    state::StateStore,
    topology::{ContainerRuntime, StaticRuntime, TcpHostProbe, TopologyInspector},
    zones::ZoneDiscovery,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to EDGEWARD_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting edgeward control plane");
    info!(
        listen_addr = %config.listen_addr,
        tunnel_id = %config.tunnel_id,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let store = match StateStore::open(&config.database_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, path = %config.database_path.display(), "Failed to open state store");
            return Err(e.into());
        }
    };

    // DNS provider
    let dns: Arc<dyn DnsProvider> = if config.dev_mode {
        warn!(zones = ?config.dev_zones, "Dev mode: using in-memory DNS provider");
        Arc::new(MemoryDnsProvider::new(config.dev_zones.iter()))
    } else {
        Arc::new(
            CloudflareProvider::from_secrets(
                config.dns_api_url.clone(),
                &EnvSecretStore::new(),
                config.provider_timeout,
            )
            .context("configuring DNS provider")?,
        )
    };

    // Container runtime
    let docker = Arc::new(DockerClient::new(&config.docker_socket));
    let runtime: Arc<dyn ContainerRuntime> = if docker.socket_exists() {
        docker.clone()
    } else {
        warn!(
            socket = %config.docker_socket.display(),
            "Docker socket not found, only host-bound ports will resolve"
        );
        Arc::new(StaticRuntime::default())
    };

    let topology = Arc::new(
        TopologyInspector::new(
            runtime,
            Arc::new(TcpHostProbe::new(Duration::from_secs(1))),
            config.tunnel_container.clone(),
            config.provider_timeout,
        )
        .with_store(store.clone()),
    );

    let zones = Arc::new(ZoneDiscovery::new(
        dns.clone(),
        store.clone(),
        config.zone_staleness,
        config.provider_timeout,
    ));

    let ingress = Arc::new(IngressWriter::new(
        &config.ingress_path,
        config.tunnel_id.clone(),
        &config.credentials_file,
        store.clone(),
    ));

    // Tunnel daemon control
    let daemon: Arc<dyn DaemonControl> = match config.daemon_mode {
        DaemonMode::Container => {
            let name = config
                .tunnel_container
                .clone()
                .context("EDGEWARD_TUNNEL_CONTAINER is required in container mode")?;
            Arc::new(ContainerDaemon::new(docker.clone(), name))
        }
        DaemonMode::Process => Arc::new(ProcessDaemon::new(
            &config.pid_file,
            config.start_command.clone(),
        )),
    };
    let restart = Arc::new(RestartController::new(
        daemon,
        config.grace_window,
        config.provider_timeout,
    ));

    let probe = HttpLivenessProbe::new(config.liveness_url.clone(), Duration::from_secs(5))
        .context("building liveness probe")?;
    let supervisor = Arc::new(HealthSupervisor::new(
        Arc::new(probe),
        restart,
        store.clone(),
        config.check_interval,
        config.sustained_up,
    ));

    let broker = Arc::new(RoutingBroker::new(BrokerParts {
        store: store.clone(),
        topology,
        zones: zones.clone(),
        ingress: ingress.clone(),
        dns: dns.clone(),
        ports: Arc::new(FilePortAuthority::new(&config.port_allocations_file)),
        registry: Arc::new(StaticWorkloadRegistry::new(
            config.privileged_workloads.iter(),
        )),
        health: supervisor.subscribe(),
        tunnel_id: config.tunnel_id.clone(),
        provider_timeout: config.provider_timeout,
    }));

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        ingress,
        zones.clone(),
        dns,
        broker.locks(),
        config.tunnel_id.clone(),
        config.provider_timeout,
    ));

    // Repair drift left by a previous run before accepting requests
    reconciler.reconcile_once().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor_handle = tokio::spawn(supervisor.run(shutdown_rx.clone()));
    let zones_handle = tokio::spawn(
        zones.run_refresh_loop(config.zone_refresh_interval, shutdown_rx.clone()),
    );
    let reconcile_handle = tokio::spawn(
        reconciler.run(config.reconcile_interval, shutdown_rx.clone()),
    );

    let app = api::create_router(AppState::new(broker, store));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for background loops to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    for (name, handle) in [
        ("health supervisor", supervisor_handle),
        ("zone refresh", zones_handle),
        ("reconciler", reconcile_handle),
    ] {
        if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
            warn!(task = name, "Background loop did not shut down in time");
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}
