//! DNS provider interface and adapters.
//!
//! The control plane only needs three things from a provider: the zones the
//! credentials can manage, and creating/deleting the CNAME that points a
//! public hostname at the tunnel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::collaborators::SecretStore;
use crate::retry::Transient;

/// Secret store key holding the provider API token.
pub const DNS_TOKEN_KEY: &str = "dns_api_token";

const ZONES_PER_PAGE: u32 = 50;

/// Errors from the DNS provider.
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("DNS provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("DNS provider error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("missing DNS provider credential '{0}'")]
    MissingCredential(String),

    #[error("DNS provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl Transient for DnsError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::MissingCredential(_) => false,
            Self::Timeout(_) => true,
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

/// A zone as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderZone {
    pub id: String,
    pub name: String,
}

/// A DNS record as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub content: String,
}

/// A record to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewDnsRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub content: String,
    pub proxied: bool,
    /// 1 means "automatic" for Cloudflare.
    pub ttl: u32,
}

impl NewDnsRecord {
    /// Proxied CNAME pointing `fqdn` at the tunnel.
    pub fn tunnel_cname(fqdn: &str, tunnel_id: &str) -> Self {
        Self {
            name: fqdn.to_string(),
            record_type: "CNAME".to_string(),
            content: format!("{tunnel_id}.cfargotunnel.com"),
            proxied: true,
            ttl: 1,
        }
    }
}

/// DNS provider operations used by the control plane.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Every zone the credentials can manage, across all pages.
    async fn list_zones(&self) -> Result<Vec<ProviderZone>, DnsError>;

    /// Create a record in the zone.
    async fn create_record(
        &self,
        zone_id: &str,
        record: &NewDnsRecord,
    ) -> Result<DnsRecord, DnsError>;

    /// Look up a record by fully qualified name.
    async fn find_record(&self, zone_id: &str, name: &str) -> Result<Option<DnsRecord>, DnsError>;

    /// Delete the record with this name. Returns `false` if none existed.
    async fn delete_record(&self, zone_id: &str, name: &str) -> Result<bool, DnsError>;
}

// =============================================================================
// Cloudflare
// =============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ResultInfo {
    page: u32,
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct DeletedRecord {
    #[allow(dead_code)]
    id: String,
}

/// Cloudflare API v4 adapter.
pub struct CloudflareProvider {
    client: Client,
    base_url: String,
    token: String,
}

impl CloudflareProvider {
    /// Create a provider for the given API base URL and bearer token.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DnsError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Create a provider with the token taken from the secret store.
    pub fn from_secrets(
        base_url: impl Into<String>,
        secrets: &dyn SecretStore,
        timeout: Duration,
    ) -> Result<Self, DnsError> {
        let token = secrets
            .get(DNS_TOKEN_KEY)
            .ok_or_else(|| DnsError::MissingCredential(DNS_TOKEN_KEY.to_string()))?;
        Self::new(base_url, token, timeout)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<(Option<T>, Option<ResultInfo>), DnsError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        let body = response.text().await?;

        let envelope: Option<Envelope<T>> = serde_json::from_str(&body).ok();

        match envelope {
            Some(env) if status.is_success() && env.success => Ok((env.result, env.result_info)),
            Some(env) => Err(DnsError::Api {
                status: status.as_u16(),
                message: describe_errors(&env.errors, &body),
            }),
            None => Err(DnsError::Api {
                status: status.as_u16(),
                message: body,
            }),
        }
    }
}

fn describe_errors(errors: &[ApiMessage], fallback: &str) -> String {
    if errors.is_empty() {
        return fallback.to_string();
    }
    errors
        .iter()
        .map(|e| format!("{} ({})", e.message, e.code))
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    async fn list_zones(&self) -> Result<Vec<ProviderZone>, DnsError> {
        let mut zones = Vec::new();
        let mut page = 1;

        loop {
            let request = self.client.get(self.url("/zones")).query(&[
                ("page", page.to_string()),
                ("per_page", ZONES_PER_PAGE.to_string()),
            ]);
            let (result, info) = self.send::<Vec<ProviderZone>>(request).await?;
            zones.extend(result.unwrap_or_default());

            match info {
                Some(info) if info.page < info.total_pages => page = info.page + 1,
                _ => break,
            }
        }

        debug!(count = zones.len(), "Listed zones from Cloudflare");
        Ok(zones)
    }

    async fn create_record(
        &self,
        zone_id: &str,
        record: &NewDnsRecord,
    ) -> Result<DnsRecord, DnsError> {
        let request = self
            .client
            .post(self.url(&format!("/zones/{zone_id}/dns_records")))
            .json(record);
        let (result, _) = self.send::<DnsRecord>(request).await?;

        let created = result.ok_or_else(|| DnsError::Api {
            status: 200,
            message: "record creation returned no result".to_string(),
        })?;
        info!(name = %created.name, record_id = %created.id, "Created DNS record");
        Ok(created)
    }

    async fn find_record(&self, zone_id: &str, name: &str) -> Result<Option<DnsRecord>, DnsError> {
        let request = self
            .client
            .get(self.url(&format!("/zones/{zone_id}/dns_records")))
            .query(&[("name", name)]);
        let (result, _) = self.send::<Vec<DnsRecord>>(request).await?;
        Ok(result.unwrap_or_default().into_iter().next())
    }

    async fn delete_record(&self, zone_id: &str, name: &str) -> Result<bool, DnsError> {
        let Some(record) = self.find_record(zone_id, name).await? else {
            return Ok(false);
        };

        let request = self
            .client
            .delete(self.url(&format!("/zones/{zone_id}/dns_records/{}", record.id)));
        self.send::<DeletedRecord>(request).await?;

        info!(name = %name, record_id = %record.id, "Deleted DNS record");
        Ok(true)
    }
}

// =============================================================================
// In-memory provider
// =============================================================================

/// DNS provider keeping records in memory.
///
/// Used in dev mode and by tests. Every call is logged so callers can assert
/// which provider operations happened, and failures can be injected.
#[derive(Default)]
pub struct MemoryDnsProvider {
    zones: Mutex<Vec<ProviderZone>>,
    records: Mutex<BTreeMap<String, DnsRecord>>,
    calls: Mutex<Vec<String>>,
    create_failures: Mutex<Vec<u16>>,
    delete_failures: Mutex<Vec<u16>>,
    lost_create_responses: AtomicU64,
    latency: Mutex<Duration>,
    next_id: AtomicU64,
}

impl MemoryDnsProvider {
    /// Create a provider serving the given zone names.
    pub fn new<I, S>(zone_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::default();
        provider.set_zones(zone_names);
        provider
    }

    /// Replace the zones the provider reports.
    pub fn set_zones<I, S>(&self, zone_names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let zones = zone_names
            .into_iter()
            .map(Into::into)
            .map(|name: String| ProviderZone {
                id: format!("zone-{name}"),
                name,
            })
            .collect();
        *lock(&self.zones) = zones;
    }

    /// Fail the next create calls with these HTTP statuses, in order.
    pub fn fail_next_creates(&self, statuses: &[u16]) {
        lock(&self.create_failures).extend_from_slice(statuses);
    }

    /// Fail the next delete calls with these HTTP statuses, in order.
    pub fn fail_next_deletes(&self, statuses: &[u16]) {
        lock(&self.delete_failures).extend_from_slice(statuses);
    }

    /// Apply the next `count` creates but answer them with a timeout, as
    /// when the response is lost on the way back.
    pub fn lose_next_create_responses(&self, count: u64) {
        self.lost_create_responses.fetch_add(count, Ordering::SeqCst);
    }

    /// Delay every record create and delete by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Names of all records currently held.
    pub fn record_names(&self) -> Vec<String> {
        lock(&self.records).keys().cloned().collect()
    }

    pub fn has_record(&self, name: &str) -> bool {
        lock(&self.records).contains_key(name)
    }

    /// Log of provider calls, e.g. `create api.example.com`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record_call(&self, call: String) {
        lock(&self.calls).push(call);
    }

    async fn delay(&self) {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_failure(queue: &Mutex<Vec<u16>>) -> Option<DnsError> {
        let mut queue = lock(queue);
        if queue.is_empty() {
            return None;
        }
        let status = queue.remove(0);
        Some(DnsError::Api {
            status,
            message: "injected failure".to_string(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DnsProvider for MemoryDnsProvider {
    async fn list_zones(&self) -> Result<Vec<ProviderZone>, DnsError> {
        self.record_call("list_zones".to_string());
        Ok(lock(&self.zones).clone())
    }

    async fn create_record(
        &self,
        zone_id: &str,
        record: &NewDnsRecord,
    ) -> Result<DnsRecord, DnsError> {
        self.record_call(format!("create {}", record.name));
        self.delay().await;
        if let Some(err) = Self::take_failure(&self.create_failures) {
            return Err(err);
        }

        let created = {
            let mut records = lock(&self.records);
            if records.contains_key(&record.name) {
                return Err(DnsError::Api {
                    status: 400,
                    message: format!("record {} already exists in {zone_id}", record.name),
                });
            }

            let created = DnsRecord {
                id: format!("rec-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1),
                name: record.name.clone(),
                record_type: record.record_type.clone(),
                content: record.content.clone(),
            };
            records.insert(record.name.clone(), created.clone());
            created
        };

        let lost = self
            .lost_create_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(DnsError::Timeout(Duration::ZERO));
        }
        Ok(created)
    }

    async fn find_record(&self, _zone_id: &str, name: &str) -> Result<Option<DnsRecord>, DnsError> {
        self.record_call(format!("find {name}"));
        Ok(lock(&self.records).get(name).cloned())
    }

    async fn delete_record(&self, _zone_id: &str, name: &str) -> Result<bool, DnsError> {
        self.record_call(format!("delete {name}"));
        self.delay().await;
        if let Some(err) = Self::take_failure(&self.delete_failures) {
            return Err(err);
        }
        Ok(lock(&self.records).remove(name).is_some())
    }
}
