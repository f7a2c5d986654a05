//! Routing Broker.
//!
//! Orchestrates route requests and deletions across the three stores that
//! must agree: routing records in the state store, DNS records at the
//! provider, and entries in the ingress file.
//!
//! There is no transaction spanning the three. Each operation runs its steps
//! in a fixed order under a per-hostname lock and undoes completed steps in
//! reverse order when a later one fails. If an undo step fails as well the
//! drift is logged, recorded in the audit entry, and left to the
//! reconciliation pass.
//!
//! Mutations run on their own task, so a caller that stops waiting (an HTTP
//! client disconnecting) cannot leave one half applied.

mod error;
mod locks;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub use error::BrokerError;
pub use locks::KeyedLocks;

use crate::collaborators::{PortAuthority, WorkloadRegistry};
use crate::dns::{DnsError, DnsProvider, DnsRecord, NewDnsRecord};
use crate::health::{HealthStatus, TunnelState};
use crate::ingress::IngressWriter;
use crate::retry::{self, RetryPolicy};
use crate::state::{
    AuditEntry, NewRoute, RouteFilter, RoutingRecord, StateStore, StateStoreError, ZoneSnapshot,
};
use crate::topology::TopologyInspector;
use crate::zones::ZoneDiscovery;

/// Audit action names.
pub mod actions {
    pub const REQUEST_ROUTE: &str = "route.request";
    pub const DELETE_ROUTE: &str = "route.delete";
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub workload: String,
    /// Confirmed by the workload registry, never self-asserted.
    pub privileged: bool,
}

/// Input to [`RoutingBroker::request_route`].
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Bare label (`api`) or full hostname (`api.example.com`).
    pub hostname: String,
    pub domain: String,
    pub target_port: u16,
    pub owning_workload: String,
}

/// A successfully created route.
#[derive(Debug, Clone, Serialize)]
pub struct RouteGrant {
    pub public_url: String,
    pub record: RoutingRecord,
}

/// A removed route.
#[derive(Debug, Clone, Serialize)]
pub struct RouteRemoval {
    pub record: RoutingRecord,
    /// Steps that were skipped, e.g. a DNS record left behind.
    pub warnings: Vec<String>,
}

/// Tunnel status as reported by [`RoutingBroker::status`].
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub tunnel_id: String,
    pub state: TunnelState,
    /// Seconds in the current `up` period.
    pub uptime_secs: Option<u64>,
    pub restart_count: u64,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub active_routes: usize,
}

/// Everything the broker delegates to.
pub struct BrokerParts {
    pub store: Arc<StateStore>,
    pub topology: Arc<TopologyInspector>,
    pub zones: Arc<ZoneDiscovery>,
    pub ingress: Arc<IngressWriter>,
    pub dns: Arc<dyn DnsProvider>,
    pub ports: Arc<dyn PortAuthority>,
    pub registry: Arc<dyn WorkloadRegistry>,
    pub health: watch::Receiver<HealthStatus>,
    pub tunnel_id: String,
    pub provider_timeout: Duration,
}

/// Routing Broker.
pub struct RoutingBroker {
    store: Arc<StateStore>,
    topology: Arc<TopologyInspector>,
    zones: Arc<ZoneDiscovery>,
    ingress: Arc<IngressWriter>,
    dns: Arc<dyn DnsProvider>,
    ports: Arc<dyn PortAuthority>,
    registry: Arc<dyn WorkloadRegistry>,
    health: watch::Receiver<HealthStatus>,
    tunnel_id: String,
    provider_timeout: Duration,
    retry: RetryPolicy,
    locks: Arc<KeyedLocks>,
}

impl RoutingBroker {
    pub fn new(parts: BrokerParts) -> Self {
        Self {
            store: parts.store,
            topology: parts.topology,
            zones: parts.zones,
            ingress: parts.ingress,
            dns: parts.dns,
            ports: parts.ports,
            registry: parts.registry,
            health: parts.health,
            tunnel_id: parts.tunnel_id,
            provider_timeout: parts.provider_timeout,
            retry: RetryPolicy::default(),
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-hostname locks, shared with the reconciler.
    pub fn locks(&self) -> Arc<KeyedLocks> {
        Arc::clone(&self.locks)
    }

    /// Resolve a caller, honouring the privileged flag only if the registry agrees.
    pub fn caller(&self, workload: &str, wants_privilege: bool) -> Caller {
        let privileged = wants_privilege && self.registry.is_privileged(workload);
        if wants_privilege && !privileged {
            warn!(workload = %workload, "Privileged flag ignored for non-operator caller");
        }
        Caller {
            workload: workload.to_string(),
            privileged,
        }
    }

    // -------------------------------------------------------------------------
    // requestRoute
    // -------------------------------------------------------------------------

    /// Publish `hostname.domain` and route it to the caller's service.
    pub async fn request_route(
        self: &Arc<Self>,
        caller: &Caller,
        request: &RouteRequest,
    ) -> Result<RouteGrant, BrokerError> {
        let broker = Arc::clone(self);
        let caller = caller.clone();
        let request = request.clone();
        run_detached(async move { broker.run_request_route(&caller, &request).await }).await
    }

    async fn run_request_route(
        &self,
        caller: &Caller,
        request: &RouteRequest,
    ) -> Result<RouteGrant, BrokerError> {
        let mut notes = Vec::new();
        let result = self.try_request_route(caller, request, &mut notes).await;

        let (success, mut detail) = match &result {
            Ok(grant) => (
                true,
                format!("{} -> {}", grant.record.fqdn(), grant.record.target()),
            ),
            Err(e) => (
                false,
                format!("{}.{}: {e}", request.hostname, request.domain),
            ),
        };
        append_notes(&mut detail, &notes);
        self.audit(actions::REQUEST_ROUTE, &caller.workload, success, detail);

        result
    }

    async fn try_request_route(
        &self,
        caller: &Caller,
        request: &RouteRequest,
        notes: &mut Vec<String>,
    ) -> Result<RouteGrant, BrokerError> {
        let (label, domain) = normalize(&request.hostname, &request.domain)?;
        let fqdn = format!("{label}.{domain}");
        let port = request.target_port;
        let workload = request.owning_workload.trim();

        if port == 0 {
            return Err(BrokerError::InvalidRequest("target port must be 1-65535".to_string()));
        }
        if workload.is_empty() {
            return Err(BrokerError::InvalidRequest("owning workload is required".to_string()));
        }
        if !caller.privileged && workload != caller.workload {
            return Err(BrokerError::PortNotOwned {
                port,
                workload: caller.workload.clone(),
            });
        }

        let zones = self.zones.snapshot().await?;
        let zone_id = zones
            .find(&domain)
            .map(|z| z.provider_zone_id.clone())
            .ok_or_else(|| {
                BrokerError::InvalidRequest(format!("{domain} is not a managed zone"))
            })?;

        if !self.ports.owns_port(workload, port).await? {
            return Err(BrokerError::PortNotOwned {
                port,
                workload: workload.to_string(),
            });
        }

        let _guard = self.locks.lock(&fqdn).await;

        if self.store.get_active_route(&label, &domain)?.is_some() {
            return Err(BrokerError::Conflict { fqdn });
        }

        let resolution = self.topology.resolve(port).await?;

        // 1. record
        let record = self
            .store
            .insert_route(&NewRoute {
                hostname: label.clone(),
                domain: domain.clone(),
                owning_workload: workload.to_string(),
                target_port: port,
                target_kind: resolution.kind,
                target_address: resolution.address.clone(),
            })
            .map_err(|e| match e {
                StateStoreError::Conflict(_) => BrokerError::Conflict { fqdn: fqdn.clone() },
                other => other.into(),
            })?;

        // 2. DNS
        if let Err(e) = self.create_tunnel_record(&zone_id, &fqdn, notes).await {
            warn!(hostname = %fqdn, error = %e, "DNS record creation failed, rolling back");
            self.undo_insert(&record, notes).await;
            return Err(e.into());
        }

        // 3. ingress file
        if let Err(e) = self.ingress.sync().await {
            warn!(hostname = %fqdn, error = %e, "Ingress update failed, rolling back");
            self.undo_dns_create(&zone_id, &fqdn, notes).await;
            self.undo_insert(&record, notes).await;
            return Err(e.into());
        }

        info!(
            hostname = %fqdn,
            workload = %workload,
            target = %record.target(),
            "Route created"
        );

        Ok(RouteGrant {
            public_url: record.public_url(),
            record,
        })
    }

    /// Create the tunnel CNAME for `fqdn`.
    ///
    /// The provider may have created the record even when the call failed
    /// (lost response, timeout, or a retry answered "already exists"). After
    /// a failure the record is looked up: one already pointing at this
    /// tunnel counts as created, anything else is reported as the failure.
    async fn create_tunnel_record(
        &self,
        zone_id: &str,
        fqdn: &str,
        notes: &mut Vec<String>,
    ) -> Result<(), DnsError> {
        let wanted = NewDnsRecord::tunnel_cname(fqdn, &self.tunnel_id);
        let err = match retry::call(&self.retry, self.provider_timeout, "create_record", || {
            self.dns.create_record(zone_id, &wanted)
        })
        .await
        {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };

        let existing = retry::call(&self.retry, self.provider_timeout, "find_record", || {
            self.dns.find_record(zone_id, fqdn)
        })
        .await;
        match existing {
            Ok(Some(record)) if points_at(&record, &wanted) => {
                info!(hostname = %fqdn, record_id = %record.id, "DNS record already points at the tunnel, adopting it");
                Ok(())
            }
            Ok(_) => Err(err),
            Err(lookup) => {
                compensation_failed(notes, fqdn, "check for a partially created DNS record", &lookup);
                Err(err)
            }
        }
    }

    async fn undo_insert(&self, record: &RoutingRecord, notes: &mut Vec<String>) {
        if let Err(e) = self.store.purge_route(record.id) {
            compensation_failed(notes, &record.fqdn(), "remove routing record", &e);
            return;
        }
        // Another hostname's update may already have rendered this record
        if let Err(e) = self.ingress.sync().await {
            compensation_failed(notes, &record.fqdn(), "re-render ingress file", &e);
        }
    }

    async fn undo_dns_create(&self, zone_id: &str, fqdn: &str, notes: &mut Vec<String>) {
        let result = retry::call(&self.retry, self.provider_timeout, "delete_record", || {
            self.dns.delete_record(zone_id, fqdn)
        })
        .await;
        if let Err(e) = result {
            compensation_failed(notes, fqdn, "delete DNS record", &e);
        }
    }

    // -------------------------------------------------------------------------
    // deleteRoute
    // -------------------------------------------------------------------------

    /// Remove a route. `hostname` may be the full hostname or a bare label
    /// together with `domain`.
    pub async fn delete_route(
        self: &Arc<Self>,
        caller: &Caller,
        hostname: &str,
        domain: Option<&str>,
    ) -> Result<RouteRemoval, BrokerError> {
        let broker = Arc::clone(self);
        let caller = caller.clone();
        let hostname = hostname.to_string();
        let domain = domain.map(str::to_string);
        run_detached(async move {
            broker
                .run_delete_route(&caller, &hostname, domain.as_deref())
                .await
        })
        .await
    }

    async fn run_delete_route(
        &self,
        caller: &Caller,
        hostname: &str,
        domain: Option<&str>,
    ) -> Result<RouteRemoval, BrokerError> {
        let mut notes = Vec::new();
        let result = self
            .try_delete_route(caller, hostname, domain, &mut notes)
            .await;

        let (success, mut detail) = match &result {
            Ok(removal) => (true, removal.record.fqdn()),
            Err(e) => (false, format!("{hostname}: {e}")),
        };
        append_notes(&mut detail, &notes);
        self.audit(actions::DELETE_ROUTE, &caller.workload, success, detail);

        result
    }

    async fn try_delete_route(
        &self,
        caller: &Caller,
        hostname: &str,
        domain: Option<&str>,
        notes: &mut Vec<String>,
    ) -> Result<RouteRemoval, BrokerError> {
        let (label, domain) = match domain {
            Some(domain) => normalize(hostname, domain)?,
            None => split_fqdn(hostname)?,
        };
        let fqdn = format!("{label}.{domain}");

        let _guard = self.locks.lock(&fqdn).await;

        let record = match self.store.get_active_route(&label, &domain)? {
            Some(record) if caller.privileged || record.owning_workload == caller.workload => {
                record
            }
            // Other workloads' records are not observable
            _ => return Err(BrokerError::NotFound(fqdn)),
        };

        let zone_id = self
            .zones
            .snapshot()
            .await?
            .find(&domain)
            .map(|z| z.provider_zone_id.clone());

        // 1. record
        self.store.mark_route_deleted(record.id)?;

        // 2. ingress file
        if let Err(e) = self.ingress.sync().await {
            warn!(hostname = %fqdn, error = %e, "Ingress update failed, rolling back delete");
            if let Err(e) = self.store.reactivate_route(record.id) {
                compensation_failed(notes, &fqdn, "re-activate routing record", &e);
            }
            return Err(e.into());
        }

        // 3. DNS
        let mut warnings = Vec::new();
        match zone_id {
            Some(zone_id) => {
                if let Err(e) = retry::call(&self.retry, self.provider_timeout, "delete_record", || {
                    self.dns.delete_record(&zone_id, &fqdn)
                })
                .await
                {
                    warn!(hostname = %fqdn, error = %e, "DNS record deletion failed, rolling back delete");
                    match self.store.reactivate_route(record.id) {
                        Ok(()) => {
                            if let Err(e) = self.ingress.sync().await {
                                compensation_failed(notes, &fqdn, "re-render ingress file", &e);
                            }
                        }
                        Err(e) => compensation_failed(notes, &fqdn, "re-activate routing record", &e),
                    }
                    return Err(e.into());
                }
            }
            None => {
                warn!(hostname = %fqdn, "Zone no longer managed, skipping DNS record deletion");
                let warning = format!(
                    "zone {domain} is no longer managed by these credentials; \
                     the DNS record for {fqdn} was left in place and must be removed by hand"
                );
                notes.push(warning.clone());
                warnings.push(warning);
            }
        }

        info!(hostname = %fqdn, workload = %record.owning_workload, "Route deleted");

        Ok(RouteRemoval {
            record: self.store.get_route(record.id)?.unwrap_or(record),
            warnings,
        })
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Active routes visible to the caller.
    ///
    /// Non-privileged callers only ever see their own routes, whatever
    /// workload filter they pass.
    pub fn list_routes(
        &self,
        caller: &Caller,
        workload: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Vec<RoutingRecord>, BrokerError> {
        let owning_workload = if caller.privileged {
            workload.map(str::to_string)
        } else {
            Some(caller.workload.clone())
        };

        let filter = RouteFilter {
            owning_workload,
            domain: domain.map(|d| d.trim().trim_end_matches('.').to_lowercase()),
        };
        Ok(self.store.list_active_routes(&filter)?)
    }

    /// Discovered zones, refreshed first if the snapshot is stale.
    pub async fn list_zones(&self) -> Result<ZoneSnapshot, BrokerError> {
        Ok(self.zones.snapshot().await?)
    }

    pub fn status(&self) -> Result<TunnelStatus, BrokerError> {
        let health = self.health.borrow().clone();
        let active_routes = self
            .store
            .list_active_routes(&RouteFilter::default())?
            .len();

        let uptime_secs = health
            .up_since
            .map(|since| Utc::now().signed_duration_since(since).num_seconds().max(0) as u64);

        Ok(TunnelStatus {
            tunnel_id: self.tunnel_id.clone(),
            state: health.state,
            uptime_secs,
            restart_count: health.restart_count,
            consecutive_failures: health.consecutive_failures,
            last_check: health.last_check,
            active_routes,
        })
    }

    fn audit(&self, action: &str, actor: &str, success: bool, detail: String) {
        let entry = AuditEntry::now(action, actor, success, detail);
        if let Err(e) = self.store.append_audit(&entry) {
            error!(action = %action, error = %e, "Failed to append audit entry");
        }
    }
}

/// Run a mutation on its own task so it completes even if the caller's
/// future is dropped.
async fn run_detached<T, F>(mutation: F) -> Result<T, BrokerError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, BrokerError>> + Send + 'static,
{
    tokio::spawn(mutation).await.map_err(|e| {
        error!(error = %e, "Route mutation task failed");
        BrokerError::Interrupted(e.to_string())
    })?
}

fn compensation_failed(
    notes: &mut Vec<String>,
    fqdn: &str,
    step: &str,
    err: &dyn std::fmt::Display,
) {
    error!(hostname = %fqdn, step = %step, error = %err, "Rollback step failed, drift left for reconciliation");
    notes.push(format!("rollback failed to {step}: {err}"));
}

fn points_at(record: &DnsRecord, wanted: &NewDnsRecord) -> bool {
    record.record_type.eq_ignore_ascii_case(&wanted.record_type)
        && record
            .content
            .trim_end_matches('.')
            .eq_ignore_ascii_case(&wanted.content)
}

fn append_notes(detail: &mut String, notes: &[String]) {
    if !notes.is_empty() {
        detail.push_str(" [");
        detail.push_str(&notes.join("; "));
        detail.push(']');
    }
}

// =============================================================================
// Hostname handling
// =============================================================================

/// Whether `label` is a valid DNS label: 1-63 alphanumerics or hyphens, not
/// starting or ending with a hyphen.
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

fn validate_domain(domain: &str) -> Result<(), BrokerError> {
    let labels: Vec<&str> = domain.split('.').collect();
    if domain.len() > 253 || labels.len() < 2 || !labels.iter().all(|l| is_valid_label(l)) {
        return Err(BrokerError::InvalidRequest(format!(
            "'{domain}' is not a valid domain"
        )));
    }
    Ok(())
}

/// Canonicalize `(hostname, domain)` into a lower-cased bare label and domain.
///
/// A hostname already ending in `.domain` is reduced to its label.
pub fn normalize(hostname: &str, domain: &str) -> Result<(String, String), BrokerError> {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    validate_domain(&domain)?;

    let hostname = hostname.trim().trim_end_matches('.').to_lowercase();
    let label = hostname
        .strip_suffix(&format!(".{domain}"))
        .unwrap_or(&hostname)
        .to_string();

    if !is_valid_label(&label) {
        return Err(BrokerError::InvalidRequest(format!(
            "'{label}' is not a valid hostname label (1-63 letters, digits or hyphens)"
        )));
    }

    Ok((label, domain))
}

/// Split a full hostname into label and domain.
pub fn split_fqdn(fqdn: &str) -> Result<(String, String), BrokerError> {
    let fqdn = fqdn.trim().trim_end_matches('.').to_lowercase();
    match fqdn.split_once('.') {
        Some((label, domain)) => normalize(label, domain),
        None => Err(BrokerError::InvalidRequest(format!(
            "'{fqdn}' is not a full hostname"
        ))),
    }
}
