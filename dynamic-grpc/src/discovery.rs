//! Keeps service definitions in the discovery backend and looks up their instances.

use crate::{
    BackendError, DiscoveryBackend, DiscoverySettings, DynamicGrpcError, ServiceInstance,
    ServiceName,
};
use anyhow::anyhow;
use std::sync::Arc;

/// Facade over a [`DiscoveryBackend`].
///
/// Holds no state of its own: whether a service is defined is always answered by
/// the backend's service table.
#[derive(Clone)]
pub struct ServiceDiscovery {
    backend: Arc<dyn DiscoveryBackend>,
    settings: Arc<DiscoverySettings>,
}

impl ServiceDiscovery {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, settings: DiscoverySettings) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
        }
    }

    /// The settings new definitions are built from.
    pub fn settings(&self) -> &DiscoverySettings {
        &self.settings
    }

    /// Define `service` in the backend unless it is already defined.
    ///
    /// The application name registered is `service` itself, unless the settings
    /// carry an override for it.
    pub async fn ensure_defined(&self, service: &ServiceName) -> Result<(), DynamicGrpcError> {
        let application = self.settings.application_name(service);
        self.ensure_defined_for(service, application).await
    }

    /// Define `service` in the backend as `application` unless it is already defined.
    ///
    /// Once defined, the application name of a service is never re-evaluated.
    #[tracing::instrument(level = "debug", skip(self, service), fields(service = %service))]
    pub async fn ensure_defined_for(
        &self,
        service: &ServiceName,
        application: &str,
    ) -> Result<(), DynamicGrpcError> {
        if self.backend.is_defined(service.as_str()) {
            tracing::trace!("service already defined");
            return Ok(());
        }

        if application.trim().is_empty() {
            return Err(DynamicGrpcError::discovery(
                service,
                anyhow!("the discovery application name must not be blank"),
            ));
        }

        let config = self.settings.discovery_config(application);
        self.backend
            .define_service_if_absent(service.as_str(), &config)
            .await
            .map_err(|err| match err {
                BackendError::UnknownService(_) => DynamicGrpcError::discovery(
                    service,
                    anyhow!("backend rejected the definition of '{application}'"),
                ),
                BackendError::Other(err) => DynamicGrpcError::discovery(service, err),
            })?;

        tracing::info!(%application, "defined service in discovery backend");
        Ok(())
    }

    /// Fetch the current instances of a defined service.
    ///
    /// An empty list is a valid answer; a service that was never defined fails
    /// with [`DynamicGrpcError::ServiceNotFound`].
    #[tracing::instrument(level = "debug", skip(self, service), fields(service = %service))]
    pub async fn get_instances(
        &self,
        service: &ServiceName,
    ) -> Result<Vec<ServiceInstance>, DynamicGrpcError> {
        self.backend
            .list_instances(service.as_str())
            .await
            .map_err(|err| match err {
                BackendError::UnknownService(_) => DynamicGrpcError::ServiceNotFound {
                    service: service.to_string(),
                },
                BackendError::Other(err) => DynamicGrpcError::discovery(service, err),
            })
    }
}

impl std::fmt::Debug for ServiceDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDiscovery")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{DiscoveryConfig, StaticBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Wraps a [`StaticBackend`] and counts the calls reaching it.
    #[derive(Default)]
    pub(crate) struct CountingBackend {
        pub(crate) inner: StaticBackend,
        pub(crate) definitions: AtomicUsize,
        pub(crate) lookups: AtomicUsize,
        pub(crate) fail_lookups: std::sync::atomic::AtomicBool,
    }

    impl CountingBackend {
        pub(crate) fn with_addresses(application: &str, addresses: &[&str]) -> Self {
            Self {
                inner: StaticBackend::new()
                    .with_addresses(application, addresses)
                    .unwrap(),
                ..Self::default()
            }
        }

        pub(crate) fn definitions(&self) -> usize {
            self.definitions.load(Ordering::SeqCst)
        }

        pub(crate) fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl DiscoveryBackend for CountingBackend {
        fn is_defined(&self, service: &str) -> bool {
            self.inner.is_defined(service)
        }

        async fn define_service_if_absent(
            &self,
            service: &str,
            config: &DiscoveryConfig,
        ) -> Result<(), BackendError> {
            self.definitions.fetch_add(1, Ordering::SeqCst);
            self.inner.define_service_if_absent(service, config).await
        }

        async fn list_instances(
            &self,
            service: &str,
        ) -> Result<Vec<ServiceInstance>, BackendError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail_lookups.load(Ordering::SeqCst) {
                return Err(anyhow!("agent unreachable").into());
            }
            self.inner.list_instances(service).await
        }
    }

    fn name(raw: &str) -> ServiceName {
        ServiceName::new(raw).unwrap()
    }

    fn discovery(backend: &Arc<CountingBackend>, settings: DiscoverySettings) -> ServiceDiscovery {
        ServiceDiscovery::new(backend.clone(), settings)
    }

    #[tokio::test]
    async fn ensure_defined_registers_exactly_once() {
        let backend = Arc::new(CountingBackend::default());
        let discovery = discovery(&backend, DiscoverySettings::default());

        discovery.ensure_defined(&name("orders")).await.unwrap();
        discovery.ensure_defined(&name("orders")).await.unwrap();

        assert_eq!(backend.definitions(), 1);
        assert_eq!(
            backend.inner.definition("orders").unwrap().application,
            "orders"
        );
    }

    #[tokio::test]
    async fn override_is_used_as_application_name() {
        let backend = Arc::new(CountingBackend::default());
        let mut settings = DiscoverySettings::default();
        settings
            .service_overrides
            .insert("orders".into(), "orders-v2".into());
        let discovery = discovery(&backend, settings);

        discovery.ensure_defined(&name("orders")).await.unwrap();

        assert_eq!(
            backend.inner.definition("orders").unwrap().application,
            "orders-v2"
        );
    }

    #[tokio::test]
    async fn override_is_frozen_once_defined() {
        let backend = Arc::new(CountingBackend::default());
        discovery(&backend, DiscoverySettings::default())
            .ensure_defined(&name("orders"))
            .await
            .unwrap();

        let mut settings = DiscoverySettings::default();
        settings
            .service_overrides
            .insert("orders".into(), "orders-v2".into());
        discovery(&backend, settings)
            .ensure_defined(&name("orders"))
            .await
            .unwrap();

        assert_eq!(backend.definitions(), 1);
        assert_eq!(
            backend.inner.definition("orders").unwrap().application,
            "orders"
        );
    }

    #[tokio::test]
    async fn ensure_defined_for_uses_the_given_application() {
        let backend = Arc::new(CountingBackend::default());
        let discovery = discovery(&backend, DiscoverySettings::default());

        discovery
            .ensure_defined_for(&name("orders"), "legacy-orders")
            .await
            .unwrap();

        assert_eq!(
            backend.inner.definition("orders").unwrap().application,
            "legacy-orders"
        );
    }

    #[tokio::test]
    async fn blank_application_is_a_discovery_error() {
        let backend = Arc::new(CountingBackend::default());
        let discovery = discovery(&backend, DiscoverySettings::default());

        let err = discovery
            .ensure_defined_for(&name("orders"), " ")
            .await
            .unwrap_err();

        assert!(matches!(err, DynamicGrpcError::ServiceDiscovery { .. }));
        assert_eq!(backend.definitions(), 0);
    }

    #[tokio::test]
    async fn instances_of_undefined_service_are_not_found() {
        let backend = Arc::new(CountingBackend::with_addresses(
            "orders",
            &["10.0.0.1:9000"],
        ));
        let discovery = discovery(&backend, DiscoverySettings::default());

        let err = discovery.get_instances(&name("orders")).await.unwrap_err();

        assert!(
            matches!(&err, DynamicGrpcError::ServiceNotFound { service } if service == "orders")
        );
    }

    #[tokio::test]
    async fn defined_service_without_instances_is_not_an_error() {
        let backend = Arc::new(CountingBackend::default());
        let discovery = discovery(&backend, DiscoverySettings::default());

        discovery.ensure_defined(&name("orders")).await.unwrap();

        assert!(discovery
            .get_instances(&name("orders"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn backend_failures_become_discovery_errors() {
        let backend = Arc::new(CountingBackend::default());
        backend.fail_lookups.store(true, Ordering::SeqCst);
        let discovery = discovery(&backend, DiscoverySettings::default());

        discovery.ensure_defined(&name("orders")).await.unwrap();
        let err = discovery.get_instances(&name("orders")).await.unwrap_err();

        assert!(
            matches!(&err, DynamicGrpcError::ServiceDiscovery { service, .. } if service == "orders")
        );
    }
}
