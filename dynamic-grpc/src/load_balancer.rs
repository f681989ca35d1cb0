//! Strategies to pick one instance out of the instances of a service.

use crate::{DynamicGrpcError, ServiceInstance};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Interface for picking the instance a new channel is connected to.
///
/// Implementations must fail with [`DynamicGrpcError::InvalidLoadBalancerInput`]
/// when `instances` is empty.
pub trait LoadBalancer: Send + Sync {
    fn select<'a>(
        &self,
        instances: &'a [ServiceInstance],
    ) -> Result<&'a ServiceInstance, DynamicGrpcError>;
}

/// Picks an instance uniformly at random.
pub struct RandomLoadBalancer {
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl RandomLoadBalancer {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Use `rng` as the source of randomness, e.g. a seeded rng in tests.
    pub fn with_rng<R: RngCore + Send + 'static>(rng: R) -> Self {
        Self {
            rng: Mutex::new(Box::new(rng)),
        }
    }
}

impl Default for RandomLoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RandomLoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomLoadBalancer").finish_non_exhaustive()
    }
}

impl LoadBalancer for RandomLoadBalancer {
    fn select<'a>(
        &self,
        instances: &'a [ServiceInstance],
    ) -> Result<&'a ServiceInstance, DynamicGrpcError> {
        match instances {
            [] => Err(DynamicGrpcError::InvalidLoadBalancerInput),
            [only] => Ok(only),
            _ => {
                let index = self
                    .rng
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .gen_range(0..instances.len());
                Ok(&instances[index])
            }
        }
    }
}

/// Cycles through the instances in order.
///
/// The position is shared across services, so it is only evenly spread when
/// the instance set is stable.
#[derive(Debug, Default)]
pub struct RoundRobinLoadBalancer {
    next: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn select<'a>(
        &self,
        instances: &'a [ServiceInstance],
    ) -> Result<&'a ServiceInstance, DynamicGrpcError> {
        if instances.is_empty() {
            return Err(DynamicGrpcError::InvalidLoadBalancerInput);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % instances.len();
        Ok(&instances[index])
    }
}
