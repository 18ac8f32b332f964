//! Explicit per-service resource registries.
//!
//! Per spec.md §9 Design Notes ("shared mutable globals ... carried
//! explicitly as application state passed to request handlers, not hidden
//! at module scope"), one breaker, one pool, and one balancer exist per
//! service. Grounded on the teacher's `circuit_breaker_registry.rs`
//! (`Arc<Mutex<HashMap<String, _>>>`, register/get by id), generalized to
//! the other two resource kinds and bundled into one `FabricRegistry`.

use crate::circuit_breaker::{Breaker, BreakerConfig};
use crate::load_balancer::{LoadBalancer, StrategyKind};
use crate::pool::{ManageConnection, Pool, PoolConfig};
use crate::telemetry::{FabricEvent, NullSink, TelemetrySink};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry of named circuit breakers, one per service.
pub struct BreakerRegistry<Sink = NullSink> {
    breakers: Mutex<HashMap<String, Breaker<Sink>>>,
}

impl<Sink> Default for BreakerRegistry<Sink> {
    fn default() -> Self {
        Self { breakers: Mutex::new(HashMap::new()) }
    }
}

impl<Sink> BreakerRegistry<Sink>
where
    Sink: TelemetrySink + Clone + Send + Sync + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the named breaker, creating one with `config` if absent.
    pub fn get_or_create(&self, service: &str, config: BreakerConfig, sink: Sink) -> Breaker<Sink> {
        let mut guard = self.breakers.lock().unwrap();
        guard.entry(service.to_string()).or_insert_with(|| Breaker::new(service, config).with_sink(sink)).clone()
    }

    pub fn get(&self, service: &str) -> Option<Breaker<Sink>> {
        self.breakers.lock().unwrap().get(service).cloned()
    }

    pub fn services(&self) -> Vec<String> {
        self.breakers.lock().unwrap().keys().cloned().collect()
    }
}

/// Registry of named connection pools, one per service. Generic over a
/// single connection-manager type: every service in a deployment of this
/// fabric dials the same kind of worker connection.
pub struct PoolRegistry<M, Sink = NullSink>
where
    M: ManageConnection,
{
    pools: Mutex<HashMap<String, Pool<M, Sink>>>,
}

impl<M, Sink> Default for PoolRegistry<M, Sink>
where
    M: ManageConnection,
{
    fn default() -> Self {
        Self { pools: Mutex::new(HashMap::new()) }
    }
}

impl<M, Sink> PoolRegistry<M, Sink>
where
    M: ManageConnection,
    Sink: TelemetrySink + Clone + Send + Sync + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, service: &str, pool: Pool<M, Sink>) {
        self.pools.lock().unwrap().insert(service.to_string(), pool);
    }

    pub fn get(&self, service: &str) -> Option<Pool<M, Sink>>
    where
        Pool<M, Sink>: Clone,
    {
        self.pools.lock().unwrap().get(service).cloned()
    }

    pub fn services(&self) -> Vec<String> {
        self.pools.lock().unwrap().keys().cloned().collect()
    }
}

/// Registry of named load balancers, one per service.
pub struct LoadBalancerRegistry<Sink = NullSink> {
    balancers: Mutex<HashMap<String, Arc<LoadBalancer<Sink>>>>,
}

impl<Sink> Default for LoadBalancerRegistry<Sink> {
    fn default() -> Self {
        Self { balancers: Mutex::new(HashMap::new()) }
    }
}

impl<Sink> LoadBalancerRegistry<Sink>
where
    Sink: TelemetrySink + Clone + Send + Sync + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, service: &str, strategy: StrategyKind, sink: Sink) -> Arc<LoadBalancer<Sink>> {
        let mut guard = self.balancers.lock().unwrap();
        guard
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(LoadBalancer::new(service, strategy).with_sink(sink)))
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<Arc<LoadBalancer<Sink>>> {
        self.balancers.lock().unwrap().get(service).cloned()
    }

    pub fn services(&self) -> Vec<String> {
        self.balancers.lock().unwrap().keys().cloned().collect()
    }
}

/// Bundles the three per-service registries so a gateway constructs one of
/// these at startup and threads it explicitly through request handlers.
pub struct FabricRegistry<M, Sink = NullSink>
where
    M: ManageConnection,
{
    pub breakers: BreakerRegistry<Sink>,
    pub pools: PoolRegistry<M, Sink>,
    pub load_balancers: LoadBalancerRegistry<Sink>,
}

impl<M, Sink> Default for FabricRegistry<M, Sink>
where
    M: ManageConnection,
    Sink: Default,
{
    fn default() -> Self {
        Self { breakers: BreakerRegistry::default(), pools: PoolRegistry::default(), load_balancers: LoadBalancerRegistry::default() }
    }
}

impl<M, Sink> FabricRegistry<M, Sink>
where
    M: ManageConnection,
    Sink: TelemetrySink + Clone + Send + Sync + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    pub fn new() -> Self {
        Self { breakers: BreakerRegistry::new(), pools: PoolRegistry::new(), load_balancers: LoadBalancerRegistry::new() }
    }

    pub fn pool_config_default(&self) -> PoolConfig {
        PoolConfig::default()
    }
}
