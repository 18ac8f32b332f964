//! Multi-module integration: pool exhaustion (spec.md §8 scenario 5) and a
//! load balancer reporting endpoint health back from call outcomes.

use async_trait::async_trait;
use fabric_resilience::{LoadBalancer, ManageConnection, PipelineError, Pool, PoolConfig, StrategyKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct CountingManager {
    connects: AtomicUsize,
}

#[async_trait]
impl ManageConnection for CountingManager {
    type Connection = usize;
    type Error = String;

    async fn connect(&self) -> Result<usize, String> {
        Ok(self.connects.fetch_add(1, Ordering::SeqCst))
    }

    async fn is_valid(&self, _conn: &mut usize) -> bool {
        true
    }
}

#[tokio::test]
async fn second_acquire_times_out_then_succeeds_after_release() {
    let manager = CountingManager { connects: AtomicUsize::new(0) };
    let config = PoolConfig { min_size: 1, max_size: 1, acquire_timeout: Duration::from_millis(100), ..PoolConfig::default() };
    let pool = Pool::new("scenario-5", manager, config);

    let held = pool.acquire().await.expect("first acquire succeeds immediately");

    let started = std::time::Instant::now();
    let blocked = pool.acquire().await;
    assert!(matches!(blocked, Err(PipelineError::PoolExhausted)));
    assert!(started.elapsed() >= Duration::from_millis(90));

    drop(held);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let third = pool.acquire().await;
    assert!(third.is_ok());
}

#[tokio::test]
async fn acquire_against_a_closed_pool_fails_with_pool_closed() {
    let manager = CountingManager { connects: AtomicUsize::new(0) };
    let pool = Pool::new("scenario-5-closed", manager, PoolConfig::default());
    pool.close().await;
    let result = pool.acquire().await;
    assert!(matches!(result, Err(PipelineError::PoolClosed)));
}

#[tokio::test]
async fn load_balancer_marks_endpoint_unhealthy_after_three_failures_and_skips_it() {
    let balancer: LoadBalancer = LoadBalancer::new("workers", StrategyKind::RoundRobin);
    balancer.add_endpoint("10.0.0.1", 9000, 1);
    balancer.add_endpoint("10.0.0.2", 9000, 1);

    // Three consecutive failures is the documented threshold for unhealthy.
    for _ in 0..3 {
        balancer.report_failure("10.0.0.1:9000", Duration::from_millis(5));
    }

    let stats = balancer.stats();
    assert_eq!(stats.total_endpoints, 2);
    assert_eq!(stats.healthy_endpoints, 1);

    for _ in 0..10 {
        if let Some(selected) = balancer.select() {
            assert_ne!(selected.address, "10.0.0.1:9000", "the unhealthy endpoint must not be selected");
        }
    }
}
