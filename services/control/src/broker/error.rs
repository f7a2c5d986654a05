//! Routing Broker error taxonomy.

use thiserror::Error;

use crate::collaborators::CollaboratorError;
use crate::dns::DnsError;
use crate::docker::DockerError;
use crate::ingress::IngressError;
use crate::state::StateStoreError;
use crate::topology::TopologyError;
use crate::zones::ZoneError;

/// Errors returned by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Hostname is already routed.
    #[error("{fqdn} already in use")]
    Conflict { fqdn: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("port {port} is not allocated to workload '{workload}'")]
    PortNotOwned { port: u16, workload: String },

    /// Every resolution path was tried.
    #[error("port {port} is not reachable from the tunnel ({})", .checks.join("; "))]
    Unreachable {
        port: u16,
        checks: Vec<String>,
        hint: String,
    },

    /// DNS provider, container runtime or port authority failure, including timeouts.
    #[error("provider error: {0}")]
    Provider(String),

    /// The ingress file was not replaced; the previous file is still in effect.
    #[error("ingress file not updated: {0}")]
    ConfigWrite(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("state store error: {0}")]
    Store(#[from] StateStoreError),

    /// The task running the mutation panicked or was aborted.
    #[error("operation interrupted: {0}")]
    Interrupted(String),
}

impl BrokerError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "conflict",
            Self::NotFound(_) => "not_found",
            Self::PortNotOwned { .. } => "port_not_owned",
            Self::Unreachable { .. } => "unreachable",
            Self::Provider(_) => "provider_error",
            Self::ConfigWrite(_) => "config_write_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Store(_) => "state_store_error",
            Self::Interrupted(_) => "interrupted",
        }
    }

    /// Whether the same request may succeed if simply repeated later.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::ConfigWrite(_))
    }

    /// What the caller can do about it.
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Conflict { .. } => {
                Some("choose another hostname or delete the existing route first".to_string())
            }
            Self::PortNotOwned { .. } => {
                Some("request the port from the port allocator before routing it".to_string())
            }
            Self::Unreachable { hint, .. } => Some(hint.clone()),
            _ => None,
        }
    }
}

impl From<DnsError> for BrokerError {
    fn from(err: DnsError) -> Self {
        Self::Provider(err.to_string())
    }
}

impl From<DockerError> for BrokerError {
    fn from(err: DockerError) -> Self {
        Self::Provider(err.to_string())
    }
}

impl From<CollaboratorError> for BrokerError {
    fn from(err: CollaboratorError) -> Self {
        Self::Provider(format!("port authority unavailable: {err}"))
    }
}

impl From<ZoneError> for BrokerError {
    fn from(err: ZoneError) -> Self {
        match err {
            ZoneError::Provider(e) => e.into(),
            ZoneError::Store(e) => e.into(),
        }
    }
}

impl From<TopologyError> for BrokerError {
    fn from(err: TopologyError) -> Self {
        match err {
            TopologyError::Unreachable { port, checks, hint } => {
                Self::Unreachable { port, checks, hint }
            }
            TopologyError::Runtime(e) => e.into(),
        }
    }
}

impl From<IngressError> for BrokerError {
    fn from(err: IngressError) -> Self {
        match err {
            IngressError::Store(e) => e.into(),
            other => Self::ConfigWrite(other.to_string()),
        }
    }
}
