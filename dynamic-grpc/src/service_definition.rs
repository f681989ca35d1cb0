use crate::duration::format_duration;
use crate::DynamicGrpcError;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// The logical name of a gRPC service, e.g. `orders`.
///
/// Never empty and never whitespace only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName(String);

impl ServiceName {
    /// Create a [`ServiceName`], failing with
    /// [`DynamicGrpcError::InvalidServiceName`] for blank input.
    ///
    /// The name is kept exactly as provided.
    pub fn new<T: Into<String>>(name: T) -> Result<Self, DynamicGrpcError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DynamicGrpcError::InvalidServiceName(name));
        }
        Ok(Self(name))
    }

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// ```
/// let name = dynamic_grpc::ServiceName::try_from("orders").unwrap();
/// assert_eq!(name.as_str(), "orders");
/// assert!(dynamic_grpc::ServiceName::try_from("  ").is_err());
/// ```
impl TryFrom<&str> for ServiceName {
    type Error = DynamicGrpcError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl TryFrom<String> for ServiceName {
    type Error = DynamicGrpcError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

/// Parameter keys of the flat map produced by [`DiscoveryConfig::params`].
pub mod params {
    pub const HOST: &str = "consul-host";
    pub const PORT: &str = "consul-port";
    pub const REFRESH_PERIOD: &str = "refresh-period";
    pub const USE_HEALTH_CHECKS: &str = "use-health-checks";
    pub const APPLICATION: &str = "application";
}

/// The registration record handed to a [`DiscoveryBackend`](crate::DiscoveryBackend)
/// when a service is defined.
///
/// Built once per service name and never updated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Host of the discovery agent.
    pub host: String,
    /// Port of the discovery agent.
    pub port: u16,
    /// How long a fetched instance list may be reused.
    pub refresh_period: Duration,
    /// Only report instances whose health checks pass.
    pub use_health_checks: bool,
    /// The name the service is registered under in the discovery backend.
    pub application: String,
}

impl DiscoveryConfig {
    /// Render the configuration as a flat key/value map.
    pub fn params(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            (params::HOST, self.host.clone()),
            (params::PORT, self.port.to_string()),
            (params::REFRESH_PERIOD, format_duration(self.refresh_period)),
            (params::USE_HEALTH_CHECKS, self.use_health_checks.to_string()),
            (params::APPLICATION, self.application.clone()),
        ])
    }
}
