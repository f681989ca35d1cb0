//! `dynamic-grpc` resolves gRPC services by name through a pluggable service discovery
//! backend and hands out one cached tonic [`Channel`](tonic::transport::Channel) per service.
//!
//! # Simple example
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() {
//!     use dynamic_grpc::ChannelRegistry;
//!     use tonic_health::pb::health_client::HealthClient;
//!
//!     // Create a registry that discovers services through the local Consul agent.
//!     let registry = ChannelRegistry::builder()
//!         .build()
//!         .expect("failed to construct ChannelRegistry");
//!
//!     let health_client = registry
//!         .get_client("orders", HealthClient::new)
//!         .await
//!         .expect("failed to resolve orders");
//! }
//! ```
//!
//! [`ChannelRegistry`] also allows plugging in a different implementation of [`DiscoveryBackend`].
//!
//! ```rust
//! use dynamic_grpc::{BackendError, DiscoveryBackend, DiscoveryConfig, ServiceInstance};
//!
//! // Knows every service, none of which has instances.
//! struct DummyBackend;
//!
//! #[async_trait::async_trait]
//! impl DiscoveryBackend for DummyBackend {
//!     fn is_defined(&self, _service: &str) -> bool {
//!         true
//!     }
//!
//!     async fn define_service_if_absent(
//!         &self,
//!         _service: &str,
//!         _config: &DiscoveryConfig,
//!     ) -> Result<(), BackendError> {
//!         Ok(())
//!     }
//!
//!     async fn list_instances(&self, _service: &str) -> Result<Vec<ServiceInstance>, BackendError> {
//!         Ok(Vec::new())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     use dynamic_grpc::{ChannelRegistry, DynamicGrpcError};
//!
//!     let registry = ChannelRegistry::builder()
//!         .discovery_backend(DummyBackend)
//!         .build()
//!         .expect("failed to construct ChannelRegistry");
//!
//!     let result = registry.get_channel("orders").await;
//!     assert!(matches!(result, Err(DynamicGrpcError::ServiceDiscovery { .. })));
//! }
//! ```
//!
//! Services whose addresses are known up front can use the [`StaticBackend`], and the
//! instance a channel connects to is picked by a [`LoadBalancer`].
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() {
//!     use dynamic_grpc::{ChannelRegistry, RoundRobinLoadBalancer, StaticBackend};
//!     use std::time::Duration;
//!
//!     let backend = StaticBackend::new()
//!         .with_addresses("orders", ["10.0.0.1:9000", "10.0.0.2:9000"])
//!         .expect("invalid address");
//!
//!     let registry = ChannelRegistry::builder()
//!         .discovery_backend(backend)
//!         .load_balancer(RoundRobinLoadBalancer::new())
//!         .timeout(Duration::from_secs(10))
//!         .idle_timeout(Duration::from_secs(300))
//!         .sweep_interval(Duration::from_secs(30))
//!         .build()
//!         .expect("failed to construct ChannelRegistry");
//!
//!     let channel = registry.get_channel("orders").await.expect("failed to resolve orders");
//!     println!("orders is served by {}", channel.endpoint());
//! }
//! ```
//!
//! The discovery application a service is looked up under defaults to its name, and can be
//! overridden per service.
//!
//! ```rust
//! use dynamic_grpc::{ChannelRegistry, DiscoverySettings};
//!
//! let mut settings = DiscoverySettings::default();
//! settings.host = "consul.internal".to_string();
//!
//! let registry = ChannelRegistry::builder()
//!     .settings(settings)
//!     .service_override("orders", "orders-v2")
//!     .build()
//!     .expect("failed to construct ChannelRegistry");
//! ```
//!
//! # Internals
//! Each service name maps to a slot in the registry's cache. A lookup either returns the
//! cached channel, joins the resolution already in flight for that service, or claims the
//! slot and spawns a new resolution (define, discover, select, connect) whose outcome is
//! shared by every waiter. Failures release the slot, so the next lookup starts over.

mod cached_channel;
mod connector;
mod consul;
mod discovery;
mod discovery_backend;
mod dns_resolver;
mod duration;
mod error;
mod host_port;
mod load_balancer;
mod registry;
mod service_definition;
mod settings;
mod static_backend;

pub use cached_channel::*;
pub use connector::*;
pub use consul::*;
pub use discovery::*;
pub use discovery_backend::*;
pub use dns_resolver::*;
pub use duration::{format_duration, parse_duration};
pub use error::*;
pub use host_port::*;
pub use load_balancer::*;
pub use registry::*;
pub use service_definition::*;
pub use settings::*;
pub use static_backend::*;
