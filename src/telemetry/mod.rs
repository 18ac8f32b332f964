//! Telemetry for the resilience pipeline, pool, balancer, and checkpoint
//! manager.
//!
//! Every layer emits a `FabricEvent` through a `TelemetrySink`
//! (`tower::Service<FabricEvent>`), matching the teacher's event/sink split.

pub mod events;
pub mod sinks;

pub use events::{
    CheckpointEvent, CircuitBreakerEvent, FabricEvent, FallbackEvent, LoadBalancerEvent, PoolEvent,
    RequestOutcome, RetryEvent, TimeoutEvent,
};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
