//! Implements [`DiscoveryBackend`] over an in-process address table.

use crate::{BackendError, DiscoveryBackend, DiscoveryConfig, HostPort, ServiceInstance};
use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Implements [`DiscoveryBackend`] with a fixed table of application addresses.
///
/// Useful for local development and tests, or for services whose addresses are
/// known up front. The table can be changed at runtime with
/// [`StaticBackend::set_instances`].
#[derive(Debug, Default)]
pub struct StaticBackend {
    /// Defined service name to the application it was registered for.
    definitions: RwLock<HashMap<String, DiscoveryConfig>>,
    /// Application name to its instances.
    addresses: RwLock<HashMap<String, Vec<HostPort>>>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addresses` (each `host:port`) for `application`.
    ///
    /// Fails if any address cannot be parsed.
    pub fn with_addresses<I, S>(self, application: &str, addresses: I) -> Result<Self, anyhow::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints = addresses
            .into_iter()
            .map(|raw| {
                HostPort::parse(raw.as_ref())
                    .ok_or_else(|| anyhow!("invalid address '{}' for '{application}'", raw.as_ref()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.set_instances(application, endpoints);
        Ok(self)
    }

    /// Replace the instances of `application`.
    pub fn set_instances(&self, application: &str, endpoints: Vec<HostPort>) {
        self.addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(application.to_string(), endpoints);
    }

    /// The configuration `service` was defined with.
    pub fn definition(&self, service: &str) -> Option<DiscoveryConfig> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for StaticBackend {
    fn is_defined(&self, service: &str) -> bool {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(service)
    }

    #[tracing::instrument(level = "debug", skip(self, config))]
    async fn define_service_if_absent(
        &self,
        service: &str,
        config: &DiscoveryConfig,
    ) -> Result<(), BackendError> {
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(service.to_string())
            .or_insert_with(|| config.clone());
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_instances(&self, service: &str) -> Result<Vec<ServiceInstance>, BackendError> {
        let application = self
            .definition(service)
            .ok_or_else(|| BackendError::UnknownService(service.to_string()))?
            .application;

        let instances: Vec<ServiceInstance> = self
            .addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&application)
            .map(|endpoints| endpoints.iter().cloned().map(ServiceInstance::new).collect())
            .unwrap_or_default();

        tracing::debug!(%application, count = instances.len(), "listed static instances");
        Ok(instances)
    }
}
