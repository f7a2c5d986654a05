//! Drift reconciliation.
//!
//! Compensating rollback keeps the three stores in step during normal
//! operation. When a compensation itself fails, or a file is edited by hand,
//! they drift. This pass converges them toward the state store:
//!
//! - the ingress file is re-rendered if its entries differ from the active
//!   records
//! - active records whose DNS record is missing get it re-created
//!
//! Runs once at startup and then periodically.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::KeyedLocks;
use crate::dns::{DnsProvider, NewDnsRecord};
use crate::ingress::{IngressEntry, IngressWriter};
use crate::retry::{self, RetryPolicy};
use crate::state::{AuditEntry, RouteFilter, StateStore};
use crate::zones::ZoneDiscovery;

/// Actor recorded in audit entries written by the reconciler.
pub const RECONCILER_ACTOR: &str = "reconciler";

/// Findings of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Active records missing from the ingress file.
    pub missing_from_ingress: Vec<String>,
    /// Ingress entries with no matching active record.
    pub orphaned_in_ingress: Vec<String>,
    pub ingress_rewritten: bool,
    pub dns_recreated: Vec<String>,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    pub fn has_drift(&self) -> bool {
        !self.missing_from_ingress.is_empty()
            || !self.orphaned_in_ingress.is_empty()
            || !self.dns_recreated.is_empty()
    }

    fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing_from_ingress.is_empty() {
            parts.push(format!("missing from ingress: {}", self.missing_from_ingress.join(", ")));
        }
        if !self.orphaned_in_ingress.is_empty() {
            parts.push(format!("orphaned in ingress: {}", self.orphaned_in_ingress.join(", ")));
        }
        if !self.dns_recreated.is_empty() {
            parts.push(format!("DNS re-created: {}", self.dns_recreated.join(", ")));
        }
        if !self.errors.is_empty() {
            parts.push(format!("errors: {}", self.errors.join("; ")));
        }
        parts.join("; ")
    }
}

/// Drift reconciler.
pub struct Reconciler {
    store: Arc<StateStore>,
    ingress: Arc<IngressWriter>,
    zones: Arc<ZoneDiscovery>,
    dns: Arc<dyn DnsProvider>,
    locks: Arc<KeyedLocks>,
    tunnel_id: String,
    provider_timeout: Duration,
    retry: RetryPolicy,
    repair_dns: bool,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        ingress: Arc<IngressWriter>,
        zones: Arc<ZoneDiscovery>,
        dns: Arc<dyn DnsProvider>,
        locks: Arc<KeyedLocks>,
        tunnel_id: impl Into<String>,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ingress,
            zones,
            dns,
            locks,
            tunnel_id: tunnel_id.into(),
            provider_timeout,
            retry: RetryPolicy::default(),
            repair_dns: true,
        }
    }

    /// Only repair the ingress file.
    pub fn without_dns_repair(mut self) -> Self {
        self.repair_dns = false;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run one reconciliation pass.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        self.reconcile_ingress(&mut report).await;
        if self.repair_dns {
            self.reconcile_dns(&mut report).await;
        }

        if report.has_drift() || !report.errors.is_empty() {
            warn!(
                missing = report.missing_from_ingress.len(),
                orphaned = report.orphaned_in_ingress.len(),
                dns_recreated = report.dns_recreated.len(),
                errors = report.errors.len(),
                "Reconciliation found drift"
            );
            let entry = AuditEntry::now(
                "reconcile",
                RECONCILER_ACTOR,
                report.errors.is_empty(),
                report.summary(),
            );
            if let Err(e) = self.store.append_audit(&entry) {
                error!(error = %e, "Failed to append audit entry");
            }
        } else {
            debug!("Reconciliation found no drift");
        }

        report
    }

    async fn reconcile_ingress(&self, report: &mut ReconcileReport) {
        let records = match self.store.list_active_routes(&RouteFilter::default()) {
            Ok(records) => records,
            Err(e) => {
                report.errors.push(format!("list routes: {e}"));
                return;
            }
        };

        let desired: BTreeSet<IngressEntry> = records.iter().map(IngressEntry::from).collect();
        let actual: BTreeSet<IngressEntry> = match self.ingress.read_entries() {
            Ok(entries) => entries.into_iter().collect(),
            Err(e) => {
                // An unreadable file is rewritten from scratch
                warn!(error = %e, "Ingress file unreadable");
                report.errors.push(format!("read ingress: {e}"));
                BTreeSet::new()
            }
        };

        report.missing_from_ingress = desired
            .difference(&actual)
            .map(|e| e.hostname.clone())
            .collect();
        report.orphaned_in_ingress = actual
            .difference(&desired)
            .map(|e| e.hostname.clone())
            .collect();

        let file_missing = !self.ingress.path().exists();
        if report.missing_from_ingress.is_empty()
            && report.orphaned_in_ingress.is_empty()
            && !file_missing
        {
            return;
        }

        match self.ingress.sync().await {
            Ok(count) => {
                info!(entries = count, "Ingress file re-rendered from state store");
                report.ingress_rewritten = true;
            }
            Err(e) => report.errors.push(format!("rewrite ingress: {e}")),
        }
    }

    async fn reconcile_dns(&self, report: &mut ReconcileReport) {
        let records = match self.store.list_active_routes(&RouteFilter::default()) {
            Ok(records) => records,
            Err(e) => {
                report.errors.push(format!("list routes: {e}"));
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        let zones = match self.zones.snapshot().await {
            Ok(zones) => zones,
            Err(e) => {
                report.errors.push(format!("zones: {e}"));
                return;
            }
        };

        for record in records {
            let fqdn = record.fqdn();
            let Some(zone) = zones.find(&record.domain) else {
                report
                    .errors
                    .push(format!("{fqdn}: zone {} not managed", record.domain));
                continue;
            };

            let _guard = self.locks.lock(&fqdn).await;

            // The record may have been deleted while we waited
            match self.store.get_active_route(&record.hostname, &record.domain) {
                Ok(Some(current)) if current.id == record.id => {}
                Ok(_) => continue,
                Err(e) => {
                    report.errors.push(format!("{fqdn}: {e}"));
                    continue;
                }
            }

            let zone_id = zone.provider_zone_id.as_str();
            let existing = retry::call(&self.retry, self.provider_timeout, "find_record", || {
                self.dns.find_record(zone_id, &fqdn)
            })
            .await;

            match existing {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let new_record = NewDnsRecord::tunnel_cname(&fqdn, &self.tunnel_id);
                    let created =
                        retry::call(&self.retry, self.provider_timeout, "create_record", || {
                            self.dns.create_record(zone_id, &new_record)
                        })
                        .await;
                    match created {
                        Ok(_) => {
                            info!(hostname = %fqdn, "Re-created missing DNS record");
                            report.dns_recreated.push(fqdn);
                        }
                        Err(e) => report.errors.push(format!("{fqdn}: {e}")),
                    }
                }
                Err(e) => report.errors.push(format!("{fqdn}: {e}")),
            }
        }
    }

    /// Reconcile on a fixed period until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Reconciler starting");

        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile_once().await;
                }
                _ = shutdown.changed() => {
                    info!("Reconciler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::MemoryDnsProvider;
    use crate::state::{NewRoute, TargetKind};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<StateStore>,
        ingress: Arc<IngressWriter>,
        dns: Arc<MemoryDnsProvider>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let ingress = Arc::new(IngressWriter::new(
            dir.path().join("config.yml"),
            "tunnel-1",
            "/etc/cloudflared/tunnel-1.json",
            store.clone(),
        ));
        let dns = Arc::new(MemoryDnsProvider::new(["example.com"]));
        let zones = Arc::new(ZoneDiscovery::new(
            dns.clone(),
            store.clone(),
            Duration::from_secs(600),
            Duration::from_secs(5),
        ));
        let reconciler = Reconciler::new(
            store.clone(),
            ingress.clone(),
            zones,
            dns.clone(),
            Arc::new(KeyedLocks::new()),
            "tunnel-1",
            Duration::from_secs(5),
        )
        .with_retry(RetryPolicy::none());

        Fixture {
            _dir: dir,
            store,
            ingress,
            dns,
            reconciler,
        }
    }

    fn add_route(store: &StateStore, hostname: &str) {
        store
            .insert_route(&NewRoute {
                hostname: hostname.to_string(),
                domain: "example.com".to_string(),
                owning_workload: "teamA".to_string(),
                target_port: 5000,
                target_kind: TargetKind::Host,
                target_address: "localhost:5000".to_string(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_rewrites_drifted_ingress_file() {
        let f = fixture();
        add_route(&f.store, "api");

        // File hand-edited to contain a hostname with no record
        std::fs::write(
            f.ingress.path(),
            "tunnel: tunnel-1\ncredentials-file: x\ningress:\n  - hostname: stale.example.com\n    service: http://localhost:1\n  - service: http_status:404\n",
        )
        .unwrap();

        let report = f.reconciler.without_dns_repair().reconcile_once().await;

        assert_eq!(report.missing_from_ingress, ["api.example.com"]);
        assert_eq!(report.orphaned_in_ingress, ["stale.example.com"]);
        assert!(report.ingress_rewritten);

        let hostnames: Vec<_> = f
            .ingress
            .read_entries()
            .unwrap()
            .into_iter()
            .map(|e| e.hostname)
            .collect();
        assert_eq!(hostnames, ["api.example.com"]);

        let audit = f.store.recent_audit(1).unwrap();
        assert_eq!(audit[0].actor, RECONCILER_ACTOR);
    }

    #[tokio::test]
    async fn test_consistent_state_is_left_alone() {
        let f = fixture();
        add_route(&f.store, "api");
        f.ingress.sync().await.unwrap();
        f.dns
            .create_record(
                "zone-example.com",
                &NewDnsRecord::tunnel_cname("api.example.com", "tunnel-1"),
            )
            .await
            .unwrap();

        let report = f.reconciler.reconcile_once().await;
        assert!(!report.has_drift());
        assert!(report.errors.is_empty());
        assert!(!report.ingress_rewritten);
        assert!(f.store.recent_audit(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recreates_missing_dns_record() {
        let f = fixture();
        add_route(&f.store, "api");
        f.ingress.sync().await.unwrap();

        let report = f.reconciler.reconcile_once().await;

        assert_eq!(report.dns_recreated, ["api.example.com"]);
        assert!(f.dns.has_record("api.example.com"));
    }

    #[tokio::test]
    async fn test_missing_file_is_written() {
        let f = fixture();
        let report = f.reconciler.without_dns_repair().reconcile_once().await;

        assert!(report.ingress_rewritten);
        assert!(f.ingress.path().exists());
    }
}
