use std::fmt;
use std::time::Duration;

/// Structured events emitted by every layer of the fabric. A closed, tagged
/// set rather than an open trait hierarchy, per the guidance to keep
/// dynamically-dispatched surfaces narrow.
#[derive(Debug, Clone, PartialEq)]
pub enum FabricEvent {
    Retry(RetryEvent),
    CircuitBreaker(CircuitBreakerEvent),
    Timeout(TimeoutEvent),
    Fallback(FallbackEvent),
    Pool(PoolEvent),
    LoadBalancer(LoadBalancerEvent),
    Checkpoint(CheckpointEvent),
    Request(RequestOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    Attempt { attempt: usize, delay: Duration },
    Exhausted { total_attempts: usize, total_duration: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    Opened { name: String, failure_count: usize },
    HalfOpen { name: String },
    Closed { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutEvent {
    Occurred { method: String, timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackEvent {
    CacheHit { method: String },
    HandlerMatched { service: String, method: String },
    RuleMatched { method: String },
    Exhausted { method: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Acquired { name: String, current_size: usize },
    Exhausted { name: String },
    Destroyed { name: String, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadBalancerEvent {
    Selected { service: String, address: String },
    NoHealthyEndpoint { service: String },
    EndpointMarkedUnhealthy { service: String, address: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointEvent {
    Written { stream_id: String, sequence: u64 },
    Evicted { stream_id: String },
    Completed { stream_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { duration: Duration },
    Failure { duration: Duration },
}

impl fmt::Display for FabricEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FabricEvent::Retry(e) => write!(f, "Retry::{}", e),
            FabricEvent::CircuitBreaker(e) => write!(f, "CircuitBreaker::{}", e),
            FabricEvent::Timeout(e) => write!(f, "Timeout::{}", e),
            FabricEvent::Fallback(e) => write!(f, "Fallback::{}", e),
            FabricEvent::Pool(e) => write!(f, "Pool::{}", e),
            FabricEvent::LoadBalancer(e) => write!(f, "LoadBalancer::{}", e),
            FabricEvent::Checkpoint(e) => write!(f, "Checkpoint::{}", e),
            FabricEvent::Request(e) => write!(f, "Request::{}", e),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => write!(f, "Attempt(#{}, delay={:?})", attempt, delay),
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { name, failure_count } => {
                write!(f, "Opened({}, failures={})", name, failure_count)
            }
            CircuitBreakerEvent::HalfOpen { name } => write!(f, "HalfOpen({})", name),
            CircuitBreakerEvent::Closed { name } => write!(f, "Closed({})", name),
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutEvent::Occurred { method, timeout } => write!(f, "Occurred({}, timeout={:?})", method, timeout),
        }
    }
}

impl fmt::Display for FallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackEvent::CacheHit { method } => write!(f, "CacheHit({})", method),
            FallbackEvent::HandlerMatched { service, method } => write!(f, "HandlerMatched({}/{})", service, method),
            FallbackEvent::RuleMatched { method } => write!(f, "RuleMatched({})", method),
            FallbackEvent::Exhausted { method } => write!(f, "Exhausted({})", method),
        }
    }
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolEvent::Acquired { name, current_size } => write!(f, "Acquired({}, size={})", name, current_size),
            PoolEvent::Exhausted { name } => write!(f, "Exhausted({})", name),
            PoolEvent::Destroyed { name, reason } => write!(f, "Destroyed({}, {})", name, reason),
        }
    }
}

impl fmt::Display for LoadBalancerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancerEvent::Selected { service, address } => write!(f, "Selected({}, {})", service, address),
            LoadBalancerEvent::NoHealthyEndpoint { service } => write!(f, "NoHealthyEndpoint({})", service),
            LoadBalancerEvent::EndpointMarkedUnhealthy { service, address } => {
                write!(f, "EndpointMarkedUnhealthy({}, {})", service, address)
            }
        }
    }
}

impl fmt::Display for CheckpointEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointEvent::Written { stream_id, sequence } => write!(f, "Written({}, seq={})", stream_id, sequence),
            CheckpointEvent::Evicted { stream_id } => write!(f, "Evicted({})", stream_id),
            CheckpointEvent::Completed { stream_id } => write!(f, "Completed({})", stream_id),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success(duration={:?})", duration),
            RequestOutcome::Failure { duration } => write!(f, "Failure(duration={:?})", duration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_breaker_event_display_includes_name_and_count() {
        let event = CircuitBreakerEvent::Opened { name: "planner".into(), failure_count: 5 };
        let s = event.to_string();
        assert!(s.contains("planner"));
        assert!(s.contains('5'));
    }

    #[test]
    fn fabric_event_display_delegates_to_variant() {
        let event = FabricEvent::Request(RequestOutcome::Success { duration: Duration::from_millis(5) });
        assert!(event.to_string().contains("Success"));
    }
}
