//! Strategy-driven endpoint selection plus an active health loop.
//!
//! Grounded on the pack's `endpoint_pool.rs` (round-robin + per-endpoint
//! circuit state), generalized to the four strategies spec.md §4.8 names.
//! Strategies are a closed, tagged set rather than an open trait-object
//! hierarchy, per spec.md §9's "one method per strategy, no open
//! inheritance hierarchy" guidance.

use crate::clock::{Clock, MonotonicClock};
use crate::endpoint::Endpoint;
use crate::telemetry::{emit_best_effort, FabricEvent, LoadBalancerEvent, NullSink, TelemetrySink};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;

/// Active probe used by the health loop. Implementations talk to the real
/// transport; this trait is the seam that lets the loop be tested without one.
#[async_trait]
pub trait HealthChecker: Send + Sync + 'static {
    async fn check(&self, host: &str, port: u16) -> bool;
}

/// The closed set of selection strategies named in spec.md §4.8.
enum Strategy {
    RoundRobin { index: Mutex<usize> },
    Weighted,
    LeastConnections,
    LeastLatency,
}

impl Strategy {
    fn pick(&self, endpoints: &[Endpoint]) -> Option<usize> {
        let healthy: Vec<usize> =
            endpoints.iter().enumerate().filter(|(_, e)| e.is_healthy()).map(|(i, _)| i).collect();
        if healthy.is_empty() {
            return None;
        }

        match self {
            Strategy::RoundRobin { index } => {
                let mut idx = index.lock().unwrap();
                let chosen = healthy[*idx % healthy.len()];
                *idx = (*idx + 1) % healthy.len();
                Some(chosen)
            }
            Strategy::Weighted => {
                let total: u32 = healthy.iter().map(|&i| endpoints[i].weight).sum();
                if total == 0 {
                    return healthy.first().copied();
                }
                let mut r = rand::rng().random_range(0..total);
                for &i in &healthy {
                    if r < endpoints[i].weight {
                        return Some(i);
                    }
                    r -= endpoints[i].weight;
                }
                healthy.last().copied()
            }
            Strategy::LeastConnections => healthy.into_iter().min_by_key(|&i| endpoints[i].inflight()),
            Strategy::LeastLatency => healthy
                .into_iter()
                .min_by_key(|&i| endpoints[i].average_latency().unwrap_or(Duration::MAX)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    RoundRobin,
    Weighted,
    LeastConnections,
    LeastLatency,
}

impl StrategyKind {
    fn build(self) -> Strategy {
        match self {
            StrategyKind::RoundRobin => Strategy::RoundRobin { index: Mutex::new(0) },
            StrategyKind::Weighted => Strategy::Weighted,
            StrategyKind::LeastConnections => Strategy::LeastConnections,
            StrategyKind::LeastLatency => Strategy::LeastLatency,
        }
    }
}

/// The endpoint a `select` call handed out. Callers report back via
/// `LoadBalancer::report_success`/`report_failure` keyed by `address`.
#[derive(Debug, Clone)]
pub struct SelectedEndpoint {
    pub host: String,
    pub port: u16,
    pub address: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EndpointSnapshot {
    pub address: String,
    pub healthy: bool,
    pub weight: u32,
    pub success_count: u64,
    pub consecutive_failure_count: u32,
    pub average_latency: Option<Duration>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LoadBalancerStats {
    pub service: String,
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
    pub endpoints: Vec<EndpointSnapshot>,
}

/// One service's endpoint set plus the strategy used to pick among them.
/// Independent of the connection pool; a pool hands out reusable
/// connections, a balancer decides which target a call should reach.
pub struct LoadBalancer<Sink = NullSink> {
    service: String,
    strategy: Strategy,
    clock: std::sync::Arc<dyn Clock>,
    endpoints: Mutex<Vec<Endpoint>>,
    sink: Sink,
}

impl LoadBalancer<NullSink> {
    pub fn new(service: impl Into<String>, strategy: StrategyKind) -> Self {
        Self::with_clock(service, strategy, std::sync::Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(service: impl Into<String>, strategy: StrategyKind, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self { service: service.into(), strategy: strategy.build(), clock, endpoints: Mutex::new(Vec::new()), sink: NullSink }
    }
}

impl<Sink> LoadBalancer<Sink>
where
    Sink: Clone,
{
    pub fn with_sink<NewSink: Clone>(self, sink: NewSink) -> LoadBalancer<NewSink> {
        LoadBalancer { service: self.service, strategy: self.strategy, clock: self.clock, endpoints: self.endpoints, sink }
    }
}

impl<Sink> LoadBalancer<Sink>
where
    Sink: TelemetrySink + Clone + Send + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    pub fn add_endpoint(&self, host: impl Into<String>, port: u16, weight: u32) {
        self.endpoints.lock().unwrap().push(Endpoint::new(host, port, weight));
    }

    pub fn remove_endpoint(&self, host: &str, port: u16) {
        self.endpoints.lock().unwrap().retain(|e| !(e.host == host && e.port == port));
    }

    /// Select an endpoint per the configured strategy, marking a slot
    /// in-flight for `LeastConnections`-style accounting. Returns `None`
    /// when no endpoint is healthy; callers must translate that into a
    /// typed `NoHealthyEndpoint` failure.
    pub fn select(&self) -> Option<SelectedEndpoint> {
        let mut endpoints = self.endpoints.lock().unwrap();
        match self.strategy.pick(&endpoints) {
            Some(idx) => {
                let ep = &mut endpoints[idx];
                ep.acquire_slot();
                let selected =
                    SelectedEndpoint { host: ep.host.clone(), port: ep.port, address: ep.address() };
                drop(endpoints);
                self.emit(FabricEvent::LoadBalancer(LoadBalancerEvent::Selected {
                    service: self.service.clone(),
                    address: selected.address.clone(),
                }));
                Some(selected)
            }
            None => {
                drop(endpoints);
                self.emit(FabricEvent::LoadBalancer(LoadBalancerEvent::NoHealthyEndpoint {
                    service: self.service.clone(),
                }));
                None
            }
        }
    }

    /// Report a successful dispatched call: releases the in-flight slot and
    /// records the latency sample.
    pub fn report_success(&self, address: &str, latency: Duration) {
        let now = self.clock.now_millis();
        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(ep) = endpoints.iter_mut().find(|e| e.address() == address) {
            ep.release_slot();
            ep.record_outcome(latency, true, now);
        }
    }

    /// Report a failed dispatched call: releases the in-flight slot and
    /// records the failure. Three consecutive failures mark the endpoint
    /// unhealthy (shared rule with the active health loop).
    pub fn report_failure(&self, address: &str, latency: Duration) {
        let now = self.clock.now_millis();
        let became_unhealthy;
        {
            let mut endpoints = self.endpoints.lock().unwrap();
            let Some(ep) = endpoints.iter_mut().find(|e| e.address() == address) else { return };
            ep.release_slot();
            ep.record_outcome(latency, false, now);
            became_unhealthy = !ep.is_healthy();
        }
        if became_unhealthy {
            self.emit(FabricEvent::LoadBalancer(LoadBalancerEvent::EndpointMarkedUnhealthy {
                service: self.service.clone(),
                address: address.to_string(),
            }));
        }
    }

    pub fn stats(&self) -> LoadBalancerStats {
        let endpoints = self.endpoints.lock().unwrap();
        let snapshots: Vec<EndpointSnapshot> = endpoints
            .iter()
            .map(|e| EndpointSnapshot {
                address: e.address(),
                healthy: e.is_healthy(),
                weight: e.weight,
                success_count: e.success_count(),
                consecutive_failure_count: e.consecutive_failure_count(),
                average_latency: e.average_latency(),
            })
            .collect();
        LoadBalancerStats {
            service: self.service.clone(),
            total_endpoints: snapshots.len(),
            healthy_endpoints: snapshots.iter().filter(|e| e.healthy).count(),
            endpoints: snapshots,
        }
    }

    /// Run the active health loop until `stop` fires, probing every
    /// endpoint every `interval` and flipping `healthy` directly on the
    /// checker's result.
    pub async fn run_health_loop(
        &self,
        checker: std::sync::Arc<dyn HealthChecker>,
        interval: Duration,
        stop: &tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => self.run_health_pass(&checker).await,
            }
        }
    }

    async fn run_health_pass(&self, checker: &std::sync::Arc<dyn HealthChecker>) {
        let targets: Vec<(String, u16, String)> = {
            let endpoints = self.endpoints.lock().unwrap();
            endpoints.iter().map(|e| (e.host.clone(), e.port, e.address())).collect()
        };

        for (host, port, address) in targets {
            let healthy = checker.check(&host, port).await;
            let now = self.clock.now_millis();
            let became_unhealthy = {
                let mut endpoints = self.endpoints.lock().unwrap();
                match endpoints.iter_mut().find(|e| e.address() == address) {
                    Some(ep) => {
                        ep.record_health_check(healthy, now);
                        !healthy
                    }
                    None => false,
                }
            };
            if became_unhealthy {
                self.emit(FabricEvent::LoadBalancer(LoadBalancerEvent::EndpointMarkedUnhealthy {
                    service: self.service.clone(),
                    address,
                }));
            }
        }
    }

    fn emit(&self, event: FabricEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            emit_best_effort(sink, event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn lb(strategy: StrategyKind) -> LoadBalancer {
        LoadBalancer::new("planner", strategy)
    }

    #[tokio::test]
    async fn round_robin_visits_every_healthy_member_within_k_selections() {
        let b = lb(StrategyKind::RoundRobin);
        b.add_endpoint("a", 1, 1);
        b.add_endpoint("b", 2, 1);
        b.add_endpoint("c", 3, 1);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            seen.insert(b.select().unwrap().address);
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn round_robin_skips_unhealthy_endpoints() {
        let b = lb(StrategyKind::RoundRobin);
        b.add_endpoint("a", 1, 1);
        b.add_endpoint("b", 2, 1);
        b.report_failure("a:1", Duration::ZERO);
        b.report_failure("a:1", Duration::ZERO);
        b.report_failure("a:1", Duration::ZERO);
        for _ in 0..4 {
            assert_eq!(b.select().unwrap().address, "b:2");
        }
    }

    #[tokio::test]
    async fn select_returns_none_when_no_endpoint_healthy() {
        let b = lb(StrategyKind::RoundRobin);
        assert!(b.select().is_none());
    }

    #[tokio::test]
    async fn least_connections_prefers_idle_endpoint() {
        let b = lb(StrategyKind::LeastConnections);
        b.add_endpoint("a", 1, 1);
        b.add_endpoint("b", 2, 1);
        let _first = b.select().unwrap(); // bumps "a" or "b" inflight to 1
        let second = b.select().unwrap();
        assert_ne!(_first.address, second.address);
    }

    #[tokio::test]
    async fn least_latency_deprioritizes_zero_sample_endpoints() {
        let b = lb(StrategyKind::LeastLatency);
        b.add_endpoint("fast", 1, 1);
        b.add_endpoint("untested", 2, 1);
        b.report_success("fast:1", Duration::from_millis(5));
        // "untested" has no samples and must be treated as +infinity.
        for _ in 0..3 {
            assert_eq!(b.select().unwrap().address, "fast:1");
            b.report_success("fast:1", Duration::from_millis(5));
        }
    }

    #[tokio::test]
    async fn weighted_never_picks_zero_weight_absent_endpoint() {
        let b = lb(StrategyKind::Weighted);
        b.add_endpoint("only", 1, 5);
        for _ in 0..10 {
            assert_eq!(b.select().unwrap().address, "only:1");
        }
    }

    #[tokio::test]
    async fn health_loop_marks_endpoint_unhealthy_on_failed_probe() {
        struct AlwaysDown;
        #[async_trait]
        impl HealthChecker for AlwaysDown {
            async fn check(&self, _host: &str, _port: u16) -> bool {
                false
            }
        }

        let b = lb(StrategyKind::RoundRobin);
        b.add_endpoint("a", 1, 1);
        b.run_health_pass(&(Arc::new(AlwaysDown) as Arc<dyn HealthChecker>)).await;
        assert!(!b.stats().endpoints[0].healthy);
    }

    #[tokio::test]
    async fn health_loop_clears_consecutive_failures_on_success() {
        struct Flag(AtomicBool);
        #[async_trait]
        impl HealthChecker for Flag {
            async fn check(&self, _host: &str, _port: u16) -> bool {
                self.0.load(Ordering::SeqCst)
            }
        }
        let checker = Arc::new(Flag(AtomicBool::new(false)));
        let b = lb(StrategyKind::RoundRobin);
        b.add_endpoint("a", 1, 1);
        b.run_health_pass(&(checker.clone() as Arc<dyn HealthChecker>)).await;
        b.run_health_pass(&(checker.clone() as Arc<dyn HealthChecker>)).await;
        assert!(!b.stats().endpoints[0].healthy);

        checker.0.store(true, Ordering::SeqCst);
        b.run_health_pass(&(checker as Arc<dyn HealthChecker>)).await;
        let snap = b.stats().endpoints[0].clone();
        assert!(snap.healthy);
        assert_eq!(snap.consecutive_failure_count, 0);
    }

    #[tokio::test]
    async fn stats_reports_total_and_healthy_counts() {
        let b = lb(StrategyKind::RoundRobin);
        b.add_endpoint("a", 1, 1);
        b.add_endpoint("b", 2, 1);
        b.report_failure("a:1", Duration::ZERO);
        b.report_failure("a:1", Duration::ZERO);
        b.report_failure("a:1", Duration::ZERO);
        let stats = b.stats();
        assert_eq!(stats.total_endpoints, 2);
        assert_eq!(stats.healthy_endpoints, 1);
    }

    #[test]
    fn remove_endpoint_drops_it_from_selection() {
        let b = lb(StrategyKind::RoundRobin);
        b.add_endpoint("a", 1, 1);
        b.add_endpoint("b", 2, 1);
        b.remove_endpoint("a", 1);
        assert_eq!(b.stats().total_endpoints, 1);
    }
}
