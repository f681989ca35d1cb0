//! Provides the builder and implementation of [`ChannelRegistry`], which turns
//! service names into cached channels.

use crate::{
    CachedChannel, ConsulBackend, Connector, DiscoveryBackend, DiscoverySettings,
    DynamicGrpcError, LoadBalancer, RandomLoadBalancer, ServiceDiscovery, ServiceName,
    TonicConnector,
};
use anyhow::anyhow;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tonic::transport::ClientTlsConfig;
use tracing::Instrument;

type Resolution<T> = Result<CachedChannel<T>, DynamicGrpcError>;
type PendingResolution<T> = Shared<BoxFuture<'static, Resolution<T>>>;

/// The lifecycle state of a service in a [`ChannelRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Nothing is cached and no resolution is running.
    Unresolved,
    /// A resolution is in flight; callers wait for its outcome.
    Resolving,
    /// A channel is cached and handed to every caller.
    Cached,
}

enum Slot<T> {
    Resolving {
        generation: u64,
        pending: PendingResolution<T>,
    },
    Cached(CachedChannel<T>),
}

enum Lookup<T> {
    Hit(CachedChannel<T>),
    Pending(PendingResolution<T>),
    Miss,
}

/// Resolves service names to channels through service discovery and caches one
/// channel per service.
///
/// The registry is a cheap handle: clones share the same cache. For each service,
/// discovery and connection run at most once at a time, and every concurrent caller
/// receives the outcome of that single run. Failed resolutions are never cached, so
/// the next call retries from scratch.
///
/// ```rust,no_run
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     use dynamic_grpc::{ChannelRegistry, DiscoverySettings};
///     use tonic_health::pb::health_client::HealthClient;
///
///     let registry = ChannelRegistry::builder()
///         .settings(DiscoverySettings::default())
///         .build()?;
///
///     let client = registry.get_client("orders", HealthClient::new).await?;
///     Ok(())
/// }
/// ```
pub struct ChannelRegistry<K: Connector = TonicConnector> {
    inner: Arc<Inner<K>>,
}

impl<K: Connector> Clone for ChannelRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K: Connector> {
    discovery: ServiceDiscovery,
    load_balancer: Arc<dyn LoadBalancer>,
    connector: K,
    idle_timeout: Option<Duration>,
    slots: Mutex<HashMap<ServiceName, Slot<K::Channel>>>,
    generations: AtomicU64,
}

impl ChannelRegistry<TonicConnector> {
    /// Start configuring a `ChannelRegistry` backed by tonic channels.
    pub fn builder() -> ChannelRegistryBuilder<TonicConnector> {
        ChannelRegistryBuilder::new()
    }
}

impl<K: Connector> ChannelRegistry<K> {
    /// Return the channel for `service_name`, resolving and connecting it first
    /// if none is cached.
    ///
    /// Repeated calls return clones of the same channel until it is evicted.
    pub async fn get_channel(
        &self,
        service_name: &str,
    ) -> Result<CachedChannel<K::Channel>, DynamicGrpcError> {
        let service = ServiceName::new(service_name)?;
        self.channel(service, None).await
    }

    /// Like [`get_channel`](Self::get_channel), but defines the service against the
    /// discovery application `application` instead of the configured one.
    ///
    /// The channel is still cached under `service_name`. An already defined service
    /// keeps its original application.
    pub async fn get_channel_for(
        &self,
        service_name: &str,
        application: &str,
    ) -> Result<CachedChannel<K::Channel>, DynamicGrpcError> {
        let service = ServiceName::new(service_name)?;
        self.channel(service, Some(application.to_string())).await
    }

    /// Resolve the channel for `service_name` and build a typed client from it.
    ///
    /// `stub_builder` is typically the `new` function of a generated tonic client.
    pub async fn get_client<F, C>(
        &self,
        service_name: &str,
        stub_builder: F,
    ) -> Result<C, DynamicGrpcError>
    where
        F: FnOnce(CachedChannel<K::Channel>) -> C,
    {
        self.get_channel(service_name).await.map(stub_builder)
    }

    /// Evict and close the cached channel of `service_name`.
    ///
    /// Returns whether a channel was evicted. A resolution that is in flight is
    /// not affected and will populate the cache when it completes.
    pub fn invalidate(&self, service_name: &str) -> Result<bool, DynamicGrpcError> {
        let service = ServiceName::new(service_name)?;

        let evicted = {
            let mut slots = self.inner.lock_slots();
            if matches!(slots.get(&service), Some(Slot::Cached(_))) {
                slots.remove(&service)
            } else {
                None
            }
        };

        match evicted {
            Some(Slot::Cached(channel)) => {
                tracing::info!(service = %service, endpoint = %channel.endpoint(), "channel invalidated");
                self.inner.close(&channel);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Evict and close every cached channel. Returns how many were evicted.
    pub fn invalidate_all(&self) -> usize {
        let evicted = self.inner.take_cached(|_| true);
        for channel in &evicted {
            self.inner.close(channel);
        }
        evicted.len()
    }

    /// Evict channels that are broken or idle for longer than the idle timeout.
    ///
    /// Returns how many were evicted. Lookups do the same lazily for the service
    /// they target.
    pub fn evict_stale(&self) -> usize {
        self.inner.evict_stale()
    }

    /// The lifecycle state of `service_name`.
    pub fn state(&self, service_name: &str) -> Result<ChannelState, DynamicGrpcError> {
        let service = ServiceName::new(service_name)?;
        let state = match self.inner.lock_slots().get(&service) {
            None => ChannelState::Unresolved,
            Some(Slot::Resolving { .. }) => ChannelState::Resolving,
            Some(Slot::Cached(_)) => ChannelState::Cached,
        };
        Ok(state)
    }

    /// The services that currently have a cached channel.
    pub fn cached_services(&self) -> Vec<ServiceName> {
        let mut services: Vec<ServiceName> = self
            .inner
            .lock_slots()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Cached(_)))
            .map(|(service, _)| service.clone())
            .collect();
        services.sort();
        services
    }

    /// The discovery manager used by this registry.
    pub fn discovery(&self) -> &ServiceDiscovery {
        &self.inner.discovery
    }

    async fn channel(
        &self,
        service: ServiceName,
        application: Option<String>,
    ) -> Result<CachedChannel<K::Channel>, DynamicGrpcError> {
        let (pending, stale) = {
            let mut slots = self.inner.lock_slots();

            let lookup = match slots.get(&service) {
                Some(Slot::Cached(channel)) if channel.is_live(self.inner.idle_timeout) => {
                    Lookup::Hit(channel.clone())
                }
                Some(Slot::Resolving { pending, .. }) => Lookup::Pending(pending.clone()),
                _ => Lookup::Miss,
            };

            match lookup {
                Lookup::Hit(channel) => {
                    tracing::trace!(service = %service, "channel cache hit");
                    channel.touch();
                    return Ok(channel);
                }
                Lookup::Pending(pending) => {
                    tracing::debug!(service = %service, "joining in-flight resolution");
                    (pending, None)
                }
                Lookup::Miss => {
                    let stale = match slots.remove(&service) {
                        Some(Slot::Cached(stale)) => Some(stale),
                        _ => None,
                    };
                    let pending = self.start_resolution(&mut slots, service, application);
                    (pending, stale)
                }
            }
        };

        if let Some(stale) = stale {
            tracing::info!(
                service = %stale.service(),
                endpoint = %stale.endpoint(),
                broken = stale.is_broken(),
                "evicting stale channel"
            );
            self.inner.close(&stale);
        }

        pending.await
    }

    /// Claim the slot of `service` and spawn its resolution.
    ///
    /// The resolution runs as its own task, so callers that stop waiting do not
    /// cancel it for the others.
    fn start_resolution(
        &self,
        slots: &mut MutexGuard<'_, HashMap<ServiceName, Slot<K::Channel>>>,
        service: ServiceName,
        application: Option<String>,
    ) -> PendingResolution<K::Channel> {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(service = %service, generation, "starting resolution");

        let inner = Arc::clone(&self.inner);
        let task_service = service.clone();
        let span = tracing::debug_span!("resolve", service = %service);
        let task = tokio::spawn(
            async move {
                let _release = ReleaseOnDrop {
                    inner: &inner,
                    service: &task_service,
                    generation,
                };
                let resolution = inner.resolve(&task_service, application.as_deref()).await;
                inner.complete(&task_service, generation, &resolution);
                resolution
            }
            .instrument(span),
        );

        let failed_service = service.clone();
        let pending = async move {
            task.await.unwrap_or_else(|err| {
                Err(DynamicGrpcError::channel_creation(
                    failed_service,
                    None,
                    anyhow!("resolution task failed: {err}"),
                ))
            })
        }
        .boxed()
        .shared();

        slots.insert(
            service,
            Slot::Resolving {
                generation,
                pending: pending.clone(),
            },
        );
        pending
    }
}

impl<K: Connector> Inner<K> {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<ServiceName, Slot<K::Channel>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Define, discover, select and connect.
    async fn resolve(
        &self,
        service: &ServiceName,
        application: Option<&str>,
    ) -> Result<CachedChannel<K::Channel>, DynamicGrpcError> {
        match application {
            Some(application) => {
                self.discovery
                    .ensure_defined_for(service, application)
                    .await?
            }
            None => self.discovery.ensure_defined(service).await?,
        }

        let instances = self.discovery.get_instances(service).await?;
        if instances.is_empty() {
            return Err(DynamicGrpcError::discovery(
                service,
                anyhow!("no live instances available"),
            ));
        }

        let endpoint = self.load_balancer.select(&instances)?.endpoint().clone();
        tracing::debug!(%endpoint, candidates = instances.len(), "selected instance");

        let channel = self
            .connector
            .connect(&endpoint)
            .await
            .map_err(|err| DynamicGrpcError::channel_creation(service, Some(endpoint.clone()), err))?;

        tracing::info!(%endpoint, "channel established");
        Ok(CachedChannel::new(service.clone(), endpoint, channel))
    }

    /// Record the outcome of the resolution `generation` of `service`.
    fn complete(
        &self,
        service: &ServiceName,
        generation: u64,
        resolution: &Resolution<K::Channel>,
    ) {
        let mut slots = self.lock_slots();
        if !is_resolving(&slots, service, generation) {
            return;
        }

        match resolution {
            Ok(channel) => {
                slots.insert(service.clone(), Slot::Cached(channel.clone()));
            }
            Err(err) => {
                slots.remove(service);
                tracing::warn!(error = %err, "resolution failed");
            }
        }
    }

    /// Free the slot of `service` if resolution `generation` still holds it.
    fn release(&self, service: &ServiceName, generation: u64) {
        let mut slots = self.lock_slots();
        if is_resolving(&slots, service, generation) {
            slots.remove(service);
            tracing::warn!(service = %service, generation, "resolution aborted");
        }
    }

    fn take_cached<F>(&self, mut evict: F) -> Vec<CachedChannel<K::Channel>>
    where
        F: FnMut(&CachedChannel<K::Channel>) -> bool,
    {
        let mut slots = self.lock_slots();
        let keys: Vec<ServiceName> = slots
            .iter()
            .filter_map(|(service, slot)| match slot {
                Slot::Cached(channel) if evict(channel) => Some(service.clone()),
                _ => None,
            })
            .collect();

        keys.iter()
            .filter_map(|service| match slots.remove(service) {
                Some(Slot::Cached(channel)) => Some(channel),
                _ => None,
            })
            .collect()
    }

    fn evict_stale(&self) -> usize {
        let idle_timeout = self.idle_timeout;
        let evicted = self.take_cached(|channel| !channel.is_live(idle_timeout));
        for channel in &evicted {
            tracing::info!(
                service = %channel.service(),
                endpoint = %channel.endpoint(),
                broken = channel.is_broken(),
                "evicting stale channel"
            );
            self.close(channel);
        }
        evicted.len()
    }

    fn close(&self, channel: &CachedChannel<K::Channel>) {
        if channel.close() {
            self.connector.close(channel.channel());
        }
    }
}

fn is_resolving<T>(
    slots: &HashMap<ServiceName, Slot<T>>,
    service: &ServiceName,
    generation: u64,
) -> bool {
    matches!(
        slots.get(service),
        Some(Slot::Resolving { generation: current, .. }) if *current == generation
    )
}

/// Frees the slot of a resolution task that panicked or was cancelled before
/// recording its outcome.
struct ReleaseOnDrop<'a, K: Connector> {
    inner: &'a Inner<K>,
    service: &'a ServiceName,
    generation: u64,
}

impl<K: Connector> Drop for ReleaseOnDrop<'_, K> {
    fn drop(&mut self) {
        self.inner.release(self.service, self.generation);
    }
}

impl<K: Connector> Drop for Inner<K> {
    fn drop(&mut self) {
        for channel in self.take_cached(|_| true) {
            self.close(&channel);
        }
    }
}

/// Periodically evicts stale channels until the registry is dropped.
async fn sweep<K: Connector>(registry: Weak<Inner<K>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = registry.upgrade() else {
            break;
        };
        let evicted = inner.evict_stale();
        if evicted > 0 {
            tracing::debug!(evicted, "sweep evicted stale channels");
        }
    }
}

/// Builder to configure and create a [`ChannelRegistry`].
pub struct ChannelRegistryBuilder<K> {
    backend: Option<Arc<dyn DiscoveryBackend>>,
    settings: DiscoverySettings,
    load_balancer: Arc<dyn LoadBalancer>,
    connector: K,
    idle_timeout: Option<Duration>,
    sweep_interval: Option<Duration>,
    agent_timeout: Duration,
}

impl ChannelRegistryBuilder<TonicConnector> {
    pub fn new() -> Self {
        Self {
            backend: None,
            settings: DiscoverySettings::default(),
            load_balancer: Arc::new(RandomLoadBalancer::new()),
            connector: TonicConnector::new(),
            idle_timeout: None,
            sweep_interval: None,
            agent_timeout: Duration::from_secs(10),
        }
    }

    /// Set a request timeout that will be applied to every new `Endpoint`.
    pub fn timeout(self, timeout: Duration) -> Self {
        Self {
            connector: self.connector.timeout(timeout),
            ..self
        }
    }

    /// Set a connection timeout that will be applied to every new `Endpoint`.
    ///
    /// Defaults to the overall request `timeout` if not set.
    pub fn connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connector: self.connector.connect_timeout(connect_timeout),
            ..self
        }
    }

    /// Configure the channels to use tls.
    pub fn with_tls(self, tls_config: ClientTlsConfig) -> Self {
        Self {
            connector: self.connector.with_tls(tls_config),
            ..self
        }
    }
}

impl Default for ChannelRegistryBuilder<TonicConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Connector> ChannelRegistryBuilder<K> {
    /// Set a custom [`DiscoveryBackend`].
    ///
    /// Defaults to a [`ConsulBackend`].
    pub fn discovery_backend<B: DiscoveryBackend + 'static>(self, backend: B) -> Self {
        self.shared_discovery_backend(Arc::new(backend))
    }

    /// Set a [`DiscoveryBackend`] that is shared with other owners.
    pub fn shared_discovery_backend(self, backend: Arc<dyn DiscoveryBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..self
        }
    }

    /// Set the [`DiscoverySettings`] used to define services.
    pub fn settings(self, settings: DiscoverySettings) -> Self {
        Self { settings, ..self }
    }

    /// Discover `service` under the application name `application`.
    pub fn service_override<S: Into<String>, A: Into<String>>(
        mut self,
        service: S,
        application: A,
    ) -> Self {
        self.settings
            .service_overrides
            .insert(service.into(), application.into());
        self
    }

    /// Set the [`LoadBalancer`] that picks the instance of a new channel.
    ///
    /// Defaults to [`RandomLoadBalancer`].
    pub fn load_balancer<L: LoadBalancer + 'static>(self, load_balancer: L) -> Self {
        Self {
            load_balancer: Arc::new(load_balancer),
            ..self
        }
    }

    /// Set a custom [`Connector`].
    pub fn connector<C: Connector>(self, connector: C) -> ChannelRegistryBuilder<C> {
        ChannelRegistryBuilder {
            connector,
            backend: self.backend,
            settings: self.settings,
            load_balancer: self.load_balancer,
            idle_timeout: self.idle_timeout,
            sweep_interval: self.sweep_interval,
            agent_timeout: self.agent_timeout,
        }
    }

    /// Evict channels that have not been handed out or used for `idle_timeout`.
    pub fn idle_timeout(self, idle_timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(idle_timeout),
            ..self
        }
    }

    /// Sweep broken and idle channels out of the cache every `interval`.
    ///
    /// Without a sweep interval, stale channels are only evicted when their
    /// service is looked up.
    pub fn sweep_interval(self, interval: Duration) -> Self {
        Self {
            sweep_interval: Some(interval),
            ..self
        }
    }

    /// Set the request timeout of the default [`ConsulBackend`].
    ///
    /// Default is 10 seconds.
    pub fn agent_timeout(self, agent_timeout: Duration) -> Self {
        Self {
            agent_timeout,
            ..self
        }
    }

    /// Construct a [`ChannelRegistry`] from the builder.
    ///
    /// Must be called within a tokio runtime when a sweep interval is set.
    pub fn build(self) -> Result<ChannelRegistry<K>, anyhow::Error> {
        let backend = match self.backend {
            Some(backend) => backend,
            None => Arc::new(ConsulBackend::new(self.agent_timeout)?),
        };

        if self.sweep_interval == Some(Duration::ZERO) {
            anyhow::bail!("the sweep interval must be greater than zero");
        }

        let inner = Arc::new(Inner {
            discovery: ServiceDiscovery::new(backend, self.settings),
            load_balancer: self.load_balancer,
            connector: self.connector,
            idle_timeout: self.idle_timeout,
            slots: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        });

        if let Some(interval) = self.sweep_interval {
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|_| anyhow!("a sweep interval requires a tokio runtime"))?;
            runtime.spawn(sweep(Arc::downgrade(&inner), interval));
        }

        Ok(ChannelRegistry { inner })
    }
}

const _: () = {
    const fn assert_is_send<T: Send + Sync>() {}
    assert_is_send::<ChannelRegistry>();
    assert_is_send::<ChannelRegistryBuilder<TonicConnector>>();
};
