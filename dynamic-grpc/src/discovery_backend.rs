//! Defines the interface that [`ServiceDiscovery`](crate::ServiceDiscovery) requires in order
//! to define services and list their live instances.

use crate::{DiscoveryConfig, HostPort};

/// One live endpoint of a service as reported by a discovery backend.
///
/// Instances are produced fresh by every query and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceInstance {
    endpoint: HostPort,
}

impl ServiceInstance {
    pub fn new(endpoint: HostPort) -> Self {
        Self { endpoint }
    }

    /// The endpoint the instance listens on.
    pub fn endpoint(&self) -> &HostPort {
        &self.endpoint
    }
}

impl From<HostPort> for ServiceInstance {
    fn from(endpoint: HostPort) -> Self {
        Self::new(endpoint)
    }
}

/// Failures reported by a [`DiscoveryBackend`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// No service with this name has been defined.
    #[error("unknown service '{0}'")]
    UnknownService(String),
    /// Any other failure, e.g. an unreachable agent or a malformed response.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Interface to a service discovery backend holding a table of defined services.
///
/// The table lives as long as the backend and is the only place definitions are kept.
#[async_trait::async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Whether `service` has already been defined.
    fn is_defined(&self, service: &str) -> bool;

    /// Define `service` with `config` unless a definition already exists.
    ///
    /// An existing definition is left untouched.
    async fn define_service_if_absent(
        &self,
        service: &str,
        config: &DiscoveryConfig,
    ) -> Result<(), BackendError>;

    /// Return the live instances of a defined service.
    ///
    /// A defined service without instances yields an empty list, while a service
    /// that was never defined yields [`BackendError::UnknownService`].
    async fn list_instances(&self, service: &str) -> Result<Vec<ServiceInstance>, BackendError>;
}
