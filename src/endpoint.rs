//! Per-target health, weight, and latency history, shared by the load
//! balancer and exposed for gateway metrics.

use crate::window::RollingWindow;
use std::time::Duration;

/// Consecutive failures (checks or dispatched calls) before an endpoint
/// is marked unhealthy.
pub const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;

/// One addressable worker `(host, port)`.
#[derive(Debug)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    healthy: bool,
    latency_window: RollingWindow<Duration>,
    success_count: u64,
    consecutive_failure_count: u32,
    last_check_ts: Option<u64>,
    inflight: u32,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight: weight.max(1),
            healthy: true,
            latency_window: RollingWindow::new(100),
            success_count: 0,
            consecutive_failure_count: 0,
            last_check_ts: None,
            inflight: 0,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn set_healthy(&mut self, healthy: bool) {
        self.healthy = healthy;
        if healthy {
            self.consecutive_failure_count = 0;
        }
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn consecutive_failure_count(&self) -> u32 {
        self.consecutive_failure_count
    }

    pub fn inflight(&self) -> u32 {
        self.inflight
    }

    pub fn last_check_ts(&self) -> Option<u64> {
        self.last_check_ts
    }

    /// Rolling average latency, or `None` if no samples have been recorded yet.
    pub fn average_latency(&self) -> Option<Duration> {
        self.latency_window.average()
    }

    pub fn sample_count(&self) -> usize {
        self.latency_window.len()
    }

    /// Record the outcome of a dispatched call: latency and success/failure.
    pub fn record_outcome(&mut self, latency: Duration, success: bool, now_millis: u64) {
        self.latency_window.push(latency);
        self.last_check_ts = Some(now_millis);
        if success {
            self.success_count += 1;
            self.consecutive_failure_count = 0;
        } else {
            self.consecutive_failure_count += 1;
            if self.consecutive_failure_count >= CONSECUTIVE_FAILURE_THRESHOLD {
                self.healthy = false;
            }
        }
    }

    /// Record the outcome of an active health-check probe (no latency sample).
    pub fn record_health_check(&mut self, healthy: bool, now_millis: u64) {
        self.last_check_ts = Some(now_millis);
        self.set_healthy(healthy);
        if !healthy {
            self.consecutive_failure_count += 1;
        }
    }

    pub fn acquire_slot(&mut self) {
        self.inflight += 1;
    }

    pub fn release_slot(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_consecutive_failures_mark_unhealthy() {
        let mut ep = Endpoint::new("localhost", 9000, 1);
        ep.record_outcome(Duration::from_millis(5), false, 1);
        ep.record_outcome(Duration::from_millis(5), false, 2);
        assert!(ep.is_healthy());
        ep.record_outcome(Duration::from_millis(5), false, 3);
        assert!(!ep.is_healthy());
    }

    #[test]
    fn one_success_clears_consecutive_counter() {
        let mut ep = Endpoint::new("localhost", 9000, 1);
        ep.record_outcome(Duration::from_millis(5), false, 1);
        ep.record_outcome(Duration::from_millis(5), false, 2);
        ep.record_outcome(Duration::from_millis(5), true, 3);
        assert_eq!(ep.consecutive_failure_count(), 0);
        ep.record_outcome(Duration::from_millis(5), false, 4);
        ep.record_outcome(Duration::from_millis(5), false, 5);
        assert!(ep.is_healthy(), "counter should have been cleared by the success");
    }

    #[test]
    fn average_latency_is_none_with_no_samples() {
        let ep = Endpoint::new("localhost", 9000, 1);
        assert_eq!(ep.average_latency(), None);
    }

    #[test]
    fn inflight_tracks_acquire_and_release() {
        let mut ep = Endpoint::new("localhost", 9000, 1);
        ep.acquire_slot();
        ep.acquire_slot();
        assert_eq!(ep.inflight(), 2);
        ep.release_slot();
        assert_eq!(ep.inflight(), 1);
    }

    #[test]
    fn weight_is_floored_at_one() {
        let ep = Endpoint::new("localhost", 9000, 0);
        assert_eq!(ep.weight, 1);
    }
}
