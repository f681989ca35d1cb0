//! Provides [`CachedChannel`], the handle the registry caches and hands out.

use crate::{HostPort, ServiceName};
use futures::future::BoxFuture;
use http::Request;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tonic::body::BoxBody;
use tonic::client::GrpcService;
use tonic::transport::Channel;
use tower::Service;

/// A channel to one endpoint of a service, shared by every caller of that service.
///
/// Clones share liveness state: once the transport reports a failure through any
/// clone, the registry stops handing the channel out.
///
/// `CachedChannel<Channel>` implements tonic [`GrpcService`], so it can be passed
/// straight to a generated client:
///
/// ```rust,no_run
/// # async fn run(registry: dynamic_grpc::ChannelRegistry) -> Result<(), dynamic_grpc::DynamicGrpcError> {
/// use tonic_health::pb::health_client::HealthClient;
///
/// let channel = registry.get_channel("orders").await?;
/// let client = HealthClient::new(channel);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CachedChannel<T> {
    channel: T,
    service: ServiceName,
    endpoint: HostPort,
    state: Arc<ChannelState>,
}

#[derive(Debug)]
struct ChannelState {
    closed: AtomicBool,
    broken: AtomicBool,
    last_used: Mutex<Instant>,
}

impl<T> CachedChannel<T> {
    pub(crate) fn new(service: ServiceName, endpoint: HostPort, channel: T) -> Self {
        Self {
            channel,
            service,
            endpoint,
            state: Arc::new(ChannelState {
                closed: AtomicBool::new(false),
                broken: AtomicBool::new(false),
                last_used: Mutex::new(Instant::now()),
            }),
        }
    }

    /// The underlying transport channel.
    pub fn channel(&self) -> &T {
        &self.channel
    }

    /// Take the underlying transport channel, detaching it from failure tracking.
    pub fn into_inner(self) -> T {
        self.channel
    }

    /// The service this channel was resolved for.
    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    /// The endpoint this channel is connected to.
    pub fn endpoint(&self) -> &HostPort {
        &self.endpoint
    }

    /// Whether `other` is a clone of the same cached channel.
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Whether the registry has closed this channel.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Whether the transport reported a failure on this channel.
    pub fn is_broken(&self) -> bool {
        self.state.broken.load(Ordering::Acquire)
    }

    /// Report the endpoint as unusable; the registry evicts the channel on its
    /// next lookup.
    pub fn mark_broken(&self) {
        if !self.state.broken.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                service = %self.service,
                endpoint = %self.endpoint,
                "channel marked as broken"
            );
        }
    }

    /// Time since the channel was last handed out or used.
    pub fn idle_for(&self) -> Duration {
        self.last_used().elapsed()
    }

    fn last_used(&self) -> Instant {
        *self
            .state
            .last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn touch(&self) {
        *self
            .state
            .last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Whether the channel may still be handed out.
    pub(crate) fn is_live(&self, idle_timeout: Option<Duration>) -> bool {
        !self.is_closed()
            && !self.is_broken()
            && idle_timeout.map_or(true, |timeout| self.idle_for() < timeout)
    }

    /// Flag the channel as closed. Returns `false` if it already was.
    pub(crate) fn close(&self) -> bool {
        !self.state.closed.swap(true, Ordering::AcqRel)
    }
}

impl Service<Request<BoxBody>> for CachedChannel<Channel> {
    type Response = http::Response<<Channel as GrpcService<BoxBody>>::ResponseBody>;
    type Error = <Channel as GrpcService<BoxBody>>::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let ready = GrpcService::poll_ready(&mut self.channel, cx);
        if let Poll::Ready(Err(err)) = &ready {
            tracing::debug!(error = %err, "channel failed to become ready");
            self.mark_broken();
        }
        ready
    }

    fn call(&mut self, request: Request<BoxBody>) -> Self::Future {
        self.touch();
        let response = GrpcService::call(&mut self.channel, request);
        let failed = self.clone();
        Box::pin(async move {
            let result = response.await;
            if let Err(err) = &result {
                tracing::debug!(error = %err, "transport error on channel");
                failed.mark_broken();
            }
            result
        })
    }
}

const _: () = {
    const fn assert_is_send<T: Send + Sync>() {}
    assert_is_send::<CachedChannel<Channel>>();
};
