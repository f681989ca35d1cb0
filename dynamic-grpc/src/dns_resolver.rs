//! Implements [`DiscoveryBackend`] for DNS `SRV` records.

use crate::{BackendError, DiscoveryBackend, DiscoveryConfig, HostPort, ServiceInstance};
use anyhow::Context;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::{system_conf, TokioAsyncResolver};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

/// Implements [`DiscoveryBackend`] by resolving `SRV` records for the application name,
/// e.g. against the DNS interface of a Consul agent.
pub struct DnsResolver {
    /// The hickory resolver which contacts the dns service directly such
    /// that we bypass os-specific dns caching.
    dns: TokioAsyncResolver,
    /// Appended to the application name, e.g. `service.consul`.
    domain: Option<String>,
    definitions: RwLock<HashMap<String, DiscoveryConfig>>,
}

impl DnsResolver {
    /// Construct a new [`DnsResolver`] from env and system configuration, e.g `resolv.conf`.
    pub fn from_system_config() -> Result<Self, anyhow::Error> {
        let (config, mut opts) = system_conf::read_system_conf()
            .context("failed to read dns services from system configuration")?;

        // We do not want any caching on our side.
        opts.cache_size = 0;

        Ok(Self::with_config(config, opts))
    }

    /// Construct a new [`DnsResolver`] querying a single name server, e.g. `127.0.0.1:8600`.
    pub fn with_name_server(name_server: SocketAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[name_server.ip()], name_server.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], group);

        let mut opts = ResolverOpts::default();
        opts.cache_size = 0;

        Self::with_config(config, opts)
    }

    fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self {
            dns: TokioAsyncResolver::tokio(config, opts),
            domain: None,
            definitions: RwLock::default(),
        }
    }

    /// Query `<application>.<domain>` instead of the bare application name.
    pub fn domain<T: Into<String>>(self, domain: T) -> Self {
        Self {
            domain: Some(domain.into()),
            ..self
        }
    }

    fn record_name(&self, application: &str) -> String {
        match &self.domain {
            Some(domain) => format!("{}.{}", application, domain.trim_matches('.')),
            None => application.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for DnsResolver {
    fn is_defined(&self, service: &str) -> bool {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(service)
    }

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
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .map(|config| config.application.clone())
            .ok_or_else(|| BackendError::UnknownService(service.to_string()))?;
        let name = self.record_name(&application);

        match self.dns.srv_lookup(name.as_str()).await {
            Ok(lookup) => {
                tracing::debug!("dns query expires in: {:?}", lookup.as_lookup().valid_until());
                Ok(lookup
                    .iter()
                    .filter_map(|srv| {
                        let target = srv.target().to_utf8();
                        tracing::debug!("result: target {} port {}", target, srv.port());
                        HostPort::from_parts(target.trim_end_matches('.'), srv.port())
                    })
                    .map(ServiceInstance::new)
                    .collect())
            }
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                Ok(Vec::new())
            }
            Err(err) => Err(anyhow::Error::from(err)
                .context(format!("srv lookup for '{name}' failed"))
                .into()),
        }
    }
}
