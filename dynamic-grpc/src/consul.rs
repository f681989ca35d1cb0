//! Implements [`DiscoveryBackend`] for the Consul HTTP API.

use crate::{BackendError, DiscoveryBackend, DiscoveryConfig, HostPort, ServiceInstance};
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Implements [`DiscoveryBackend`] by querying the health endpoint of a Consul agent.
///
/// Each defined service remembers the agent it was defined against, and keeps the
/// last fetched instance list for its refresh period.
pub struct ConsulBackend {
    client: reqwest::Client,
    services: RwLock<HashMap<String, Arc<ConsulService>>>,
}

struct ConsulService {
    config: DiscoveryConfig,
    cache: Mutex<Option<(Instant, Vec<ServiceInstance>)>>,
}

impl ConsulService {
    fn fresh_instances(&self) -> Option<Vec<ServiceInstance>> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        match &*cache {
            Some((fetched_at, instances)) if fetched_at.elapsed() < self.config.refresh_period => {
                Some(instances.clone())
            }
            _ => None,
        }
    }

    fn store(&self, instances: &[ServiceInstance]) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((Instant::now(), instances.to_vec()));
    }
}

impl ConsulBackend {
    /// Construct a [`ConsulBackend`] whose agent requests time out after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build the consul http client")?;

        Ok(Self {
            client,
            services: RwLock::default(),
        })
    }

    fn service(&self, service: &str) -> Option<Arc<ConsulService>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    async fn fetch(&self, config: &DiscoveryConfig) -> Result<Vec<ServiceInstance>, anyhow::Error> {
        let mut request = self.client.get(health_url(config));
        if config.use_health_checks {
            request = request.query(&[("passing", "true")]);
        }

        let entries: Vec<HealthEntry> = request
            .send()
            .await
            .with_context(|| format!("failed to reach consul at {}:{}", config.host, config.port))?
            .error_for_status()
            .context("consul rejected the health query")?
            .json()
            .await
            .context("malformed consul health response")?;

        Ok(instances_from_entries(&config.application, entries))
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for ConsulBackend {
    fn is_defined(&self, service: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(service)
    }

    #[tracing::instrument(level = "debug", skip(self, config), fields(application = %config.application))]
    async fn define_service_if_absent(
        &self,
        service: &str,
        config: &DiscoveryConfig,
    ) -> Result<(), BackendError> {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(ConsulService {
                    config: config.clone(),
                    cache: Mutex::new(None),
                })
            });
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_instances(&self, service: &str) -> Result<Vec<ServiceInstance>, BackendError> {
        let definition = self
            .service(service)
            .ok_or_else(|| BackendError::UnknownService(service.to_string()))?;

        if let Some(instances) = definition.fresh_instances() {
            tracing::debug!("serving {} cached instances", instances.len());
            return Ok(instances);
        }

        let instances = self.fetch(&definition.config).await?;
        tracing::debug!("consul returned {} instances", instances.len());
        definition.store(&instances);
        Ok(instances)
    }
}

fn health_url(config: &DiscoveryConfig) -> String {
    format!(
        "http://{}:{}/v1/health/service/{}",
        config.host, config.port, config.application
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: NodeEntry,
    service: ServiceEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
}

/// Services registered without an address inherit the address of their node.
fn instances_from_entries(application: &str, entries: Vec<HealthEntry>) -> Vec<ServiceInstance> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let host = if entry.service.address.is_empty() {
                entry.node.address
            } else {
                entry.service.address
            };
            let port = entry.service.port;
            match HostPort::from_parts(host.clone(), port) {
                Some(endpoint) => Some(ServiceInstance::new(endpoint)),
                None => {
                    tracing::warn!(%application, %host, port, "skipping malformed consul entry");
                    None
                }
            }
        })
        .collect()
}
