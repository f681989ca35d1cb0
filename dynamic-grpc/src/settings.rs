//! Configuration consumed by the discovery manager.

use crate::duration::serde_duration;
use crate::{DiscoveryConfig, ServiceName};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Settings shared by every service definition.
///
/// ```
/// let settings: dynamic_grpc::DiscoverySettings = serde_json::from_str(
///     r#"{ "host": "consul", "refresh-period": "30s", "service-overrides": { "orders": "orders-v2" } }"#,
/// ).unwrap();
///
/// assert_eq!(settings.port, 8500);
/// assert_eq!(settings.refresh_period, std::time::Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DiscoverySettings {
    /// Host of the discovery agent.
    pub host: String,
    /// Port of the discovery agent.
    pub port: u16,
    /// How long a fetched instance list may be reused.
    #[serde(deserialize_with = "serde_duration::deserialize")]
    pub refresh_period: Duration,
    /// Only report instances whose health checks pass.
    pub use_health_checks: bool,
    /// Logical service name to discovery application name.
    pub service_overrides: HashMap<String, String>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8500,
            refresh_period: Duration::from_secs(10),
            use_health_checks: true,
            service_overrides: HashMap::new(),
        }
    }
}

impl DiscoverySettings {
    /// The application name the discovery backend knows `service` by.
    pub fn application_name<'a>(&'a self, service: &'a ServiceName) -> &'a str {
        self.service_overrides
            .get(service.as_str())
            .map(String::as_str)
            .unwrap_or_else(|| service.as_str())
    }

    /// Build the [`DiscoveryConfig`] registering `application`.
    pub fn discovery_config(&self, application: &str) -> DiscoveryConfig {
        DiscoveryConfig {
            host: self.host.clone(),
            port: self.port,
            refresh_period: self.refresh_period,
            use_health_checks: self.use_health_checks,
            application: application.to_string(),
        }
    }
}
