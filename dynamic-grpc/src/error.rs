//! Errors surfaced by the registry and the discovery manager.

use crate::HostPort;
use std::sync::Arc;

/// A cloneable, type-erased cause.
///
/// Causes are shared so that the outcome of one resolution can be handed to
/// every caller waiting on it.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Everything that can go wrong while turning a service name into a channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DynamicGrpcError {
    /// The service name was empty or whitespace only. Raised before any I/O.
    #[error("invalid service name {0:?}: must not be empty or blank")]
    InvalidServiceName(String),

    /// The discovery backend has no definition for the service.
    #[error("service '{service}' is not known to the discovery backend")]
    ServiceNotFound { service: String },

    /// The discovery backend could not define the service or list its instances.
    #[error("service discovery failed for '{service}'")]
    ServiceDiscovery {
        service: String,
        #[source]
        source: SharedError,
    },

    /// Discovery succeeded but the connection could not be established.
    #[error("failed to create a channel for '{service}'{}", at(.endpoint))]
    ChannelCreation {
        service: String,
        endpoint: Option<HostPort>,
        #[source]
        source: SharedError,
    },

    /// A load balancer was asked to pick from an empty set of instances.
    #[error("load balancer invoked without any candidate instances")]
    InvalidLoadBalancerInput,
}

impl DynamicGrpcError {
    pub(crate) fn discovery<S: ToString>(service: S, cause: anyhow::Error) -> Self {
        Self::ServiceDiscovery {
            service: service.to_string(),
            source: shared(cause),
        }
    }

    pub(crate) fn channel_creation<S: ToString>(
        service: S,
        endpoint: Option<HostPort>,
        cause: anyhow::Error,
    ) -> Self {
        Self::ChannelCreation {
            service: service.to_string(),
            endpoint,
            source: shared(cause),
        }
    }

    /// The service the error relates to, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::InvalidServiceName(name) => Some(name),
            Self::ServiceNotFound { service }
            | Self::ServiceDiscovery { service, .. }
            | Self::ChannelCreation { service, .. } => Some(service),
            Self::InvalidLoadBalancerInput => None,
        }
    }

    /// Whether the error indicates a caller bug rather than a transient failure.
    ///
    /// Retrying a request that failed with a contract violation can never succeed.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidServiceName(_) | Self::InvalidLoadBalancerInput
        )
    }
}

fn at(endpoint: &Option<HostPort>) -> String {
    endpoint
        .as_ref()
        .map(|endpoint| format!(" at {endpoint}"))
        .unwrap_or_default()
}

fn shared(cause: anyhow::Error) -> SharedError {
    let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = cause.into();
    Arc::from(boxed)
}
