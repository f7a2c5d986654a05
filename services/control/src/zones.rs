//! Zone Discovery.
//!
//! Pulls the zones the operator's credentials can manage and replaces the
//! stored snapshot wholesale. Zones the credentials lost access to disappear
//! on the next refresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::dns::{DnsError, DnsProvider};
use crate::retry::{self, RetryPolicy};
use crate::state::{StateStore, StateStoreError, Zone, ZoneSnapshot};

#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("zone discovery failed: {0}")]
    Provider(#[from] DnsError),

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

/// Zone Discovery.
pub struct ZoneDiscovery {
    provider: Arc<dyn DnsProvider>,
    store: Arc<StateStore>,
    staleness: Duration,
    timeout: Duration,
    retry: RetryPolicy,
    refresh_lock: Mutex<()>,
}

impl ZoneDiscovery {
    pub fn new(
        provider: Arc<dyn DnsProvider>,
        store: Arc<StateStore>,
        staleness: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            staleness,
            timeout,
            retry: RetryPolicy::default(),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pull the full zone list and replace the snapshot.
    pub async fn refresh(&self) -> Result<ZoneSnapshot, ZoneError> {
        let _guard = self.refresh_lock.lock().await;

        let provider_zones = retry::call(&self.retry, self.timeout, "list_zones", || {
            self.provider.list_zones()
        })
        .await?;

        let now = Utc::now();
        let mut zones: Vec<Zone> = provider_zones
            .into_iter()
            .map(|z| Zone {
                domain_name: z.name.to_lowercase(),
                provider_zone_id: z.id,
                discovered_at: now,
            })
            .collect();
        zones.sort_by(|a, b| a.domain_name.cmp(&b.domain_name));
        zones.dedup_by(|a, b| a.domain_name == b.domain_name);

        self.store.replace_zones(&zones, now)?;
        info!(count = zones.len(), "Zone snapshot refreshed");

        Ok(ZoneSnapshot {
            zones,
            refreshed_at: Some(now),
        })
    }

    /// Current snapshot, refreshed first if older than the staleness threshold.
    ///
    /// If the refresh fails but an older snapshot exists, the older snapshot
    /// is served.
    pub async fn snapshot(&self) -> Result<ZoneSnapshot, ZoneError> {
        let current = self.store.zone_snapshot()?;
        if !self.is_stale(&current) {
            return Ok(current);
        }

        match self.refresh().await {
            Ok(fresh) => Ok(fresh),
            Err(e) if current.refreshed_at.is_some() => {
                warn!(error = %e, "Zone refresh failed, serving stale snapshot");
                Ok(current)
            }
            Err(e) => Err(e),
        }
    }

    fn is_stale(&self, snapshot: &ZoneSnapshot) -> bool {
        let Some(refreshed_at) = snapshot.refreshed_at else {
            return true;
        };
        let age = Utc::now().signed_duration_since(refreshed_at);
        age.to_std().map(|age| age > self.staleness).unwrap_or(false)
    }

    /// Refresh on a fixed period until shutdown.
    pub async fn run_refresh_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "Periodic zone refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Zone refresh loop shutting down");
                    break;
                }
            }
        }
    }
}
