//! Interfaces to the authorities the control plane consults but does not own.
//!
//! - [`PortAuthority`]: which owning workload holds which port.
//! - [`SecretStore`]: API credentials.
//! - [`WorkloadRegistry`]: which identities are privileged operators.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Errors from consulting an external authority.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("failed to read port allocations from {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid port allocations: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Decides which port belongs to which owning workload.
#[async_trait]
pub trait PortAuthority: Send + Sync {
    async fn owns_port(&self, workload: &str, port: u16) -> Result<bool, CollaboratorError>;
}

/// Supplies API credentials by key.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Maps workload identity to operator privilege.
pub trait WorkloadRegistry: Send + Sync {
    fn is_privileged(&self, workload: &str) -> bool;
}

// =============================================================================
// Port allocations
// =============================================================================

/// In-memory port allocation table: workload -> allocated ports.
#[derive(Debug, Clone, Default)]
pub struct PortAllocations {
    allocations: HashMap<String, HashSet<u16>>,
}

impl PortAllocations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{"teamA": [5000, 5001], "teamB": [5073]}`.
    pub fn from_json(data: &str) -> Result<Self, CollaboratorError> {
        let allocations: HashMap<String, HashSet<u16>> = serde_json::from_str(data)?;
        Ok(Self { allocations })
    }

    /// Builder-style allocation.
    pub fn allocate(mut self, workload: impl Into<String>, port: u16) -> Self {
        self.allocations
            .entry(workload.into())
            .or_default()
            .insert(port);
        self
    }

    pub fn owns(&self, workload: &str, port: u16) -> bool {
        self.allocations
            .get(workload)
            .is_some_and(|ports| ports.contains(&port))
    }
}

#[async_trait]
impl PortAuthority for PortAllocations {
    async fn owns_port(&self, workload: &str, port: u16) -> Result<bool, CollaboratorError> {
        Ok(self.owns(workload, port))
    }
}

/// Port authority backed by a JSON file maintained by the allocator.
///
/// The file is re-read on every lookup so allocations made after startup are
/// honoured. A missing file means nothing is allocated.
pub struct FilePortAuthority {
    path: PathBuf,
}

impl FilePortAuthority {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<PortAllocations, CollaboratorError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => PortAllocations::from_json(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Port allocation file not found");
                Ok(PortAllocations::new())
            }
            Err(source) => Err(CollaboratorError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[async_trait]
impl PortAuthority for FilePortAuthority {
    async fn owns_port(&self, workload: &str, port: u16) -> Result<bool, CollaboratorError> {
        Ok(self.load().await?.owns(workload, port))
    }
}

// =============================================================================
// Secrets
// =============================================================================

/// Secrets read from `EDGEWARD_SECRET_<KEY>` environment variables.
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self {
            prefix: "EDGEWARD_SECRET_".to_string(),
        }
    }

    fn var_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase())
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for EnvSecretStore {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(self.var_name(key))
            .ok()
            .filter(|v| !v.is_empty())
    }
}

// =============================================================================
// Workload registry
// =============================================================================

/// Registry with a fixed set of privileged operators.
#[derive(Debug, Clone, Default)]
pub struct StaticWorkloadRegistry {
    privileged: HashSet<String>,
}

impl StaticWorkloadRegistry {
    pub fn new<I, S>(privileged: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            privileged: privileged.into_iter().map(Into::into).collect(),
        }
    }
}

impl WorkloadRegistry for StaticWorkloadRegistry {
    fn is_privileged(&self, workload: &str) -> bool {
        self.privileged.contains(workload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_allocations_from_json() {
        let allocations = PortAllocations::from_json(r#"{"teamA": [5000, 5001]}"#).unwrap();
        assert!(allocations.owns("teamA", 5000));
        assert!(!allocations.owns("teamA", 5073));
        assert!(!allocations.owns("teamB", 5000));
    }

    #[tokio::test]
    async fn test_file_port_authority_reads_current_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.json");
        let authority = FilePortAuthority::new(&path);

        assert!(!authority.owns_port("teamA", 5000).await.unwrap());

        std::fs::write(&path, r#"{"teamA": [5000]}"#).unwrap();
        assert!(authority.owns_port("teamA", 5000).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_port_authority_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FilePortAuthority::new(&path)
            .owns_port("teamA", 5000)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Parse(_)));
    }

    #[test]
    fn test_env_secret_store_key_mapping() {
        let store = EnvSecretStore::new();
        assert_eq!(store.var_name("dns_api_token"), "EDGEWARD_SECRET_DNS_API_TOKEN");
    }

    #[test]
    fn test_static_registry() {
        let registry = StaticWorkloadRegistry::new(["operator"]);
        assert!(registry.is_privileged("operator"));
        assert!(!registry.is_privileged("teamA"));
    }
}
