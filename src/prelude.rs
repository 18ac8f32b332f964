//! Convenient re-exports for common fabric-resilience types.
pub use crate::{
    telemetry::{FabricEvent, LogSink, MemorySink, NullSink, TelemetrySink},
    Backoff, Breaker, BreakerConfig, CallDescriptor, CallError, CallResponse, CallStream,
    CheckpointManager, Clock, Endpoint, FailureCode, FallbackRegistry, FabricConfig, FabricRegistry,
    ResumableStream,
    LoadBalancer, Pipeline, Pool, PoolConfig, PipelineError, RetryEngine, RetryPolicy, StrategyKind,
    Transport,
};
