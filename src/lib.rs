#![forbid(unsafe_code)]

//! # fabric-resilience
//!
//! Client-side resilience and fanout core for a multi-process AI-agent
//! fabric: a layered call-interception pipeline (circuit breaker → retry
//! with backoff and jitter → adaptive timeout → fallback), the connection
//! pool and load balancer that feed it, and a checkpointed streaming layer
//! for resumable server-streaming calls.
//!
//! ## Features
//!
//! - **Circuit breaker** — one mutex-guarded three-state machine per target
//! - **Retry engine** — capped exponential backoff with additive jitter
//! - **Adaptive timeout** — per-method deadline from a sliding p95
//! - **Fallback resolver** — TTL cache → service handler → rule chain
//! - **Connection pool** — acquire/release, health revalidation, idle eviction
//! - **Load balancer** — round-robin, weighted, least-connections, least-latency
//! - **Stream checkpoints** — resumable server streams via sequence numbers
//!
//! ## Quick Start
//!
//! ```rust
//! use fabric_resilience::{
//!     Backoff, Breaker, BreakerConfig, CallDescriptor, CallError, CallResponse, CallStream,
//!     Pipeline, RetryEngine, RetryPolicy, TimeoutConfig, AdaptiveTimeoutTable, Transport,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! struct EchoTransport;
//!
//! #[async_trait]
//! impl Transport for EchoTransport {
//!     async fn call(&self, descriptor: &CallDescriptor) -> Result<CallResponse, CallError> {
//!         Ok(CallResponse { payload: descriptor.payload.clone() })
//!     }
//!
//!     async fn open_stream(&self, _descriptor: &CallDescriptor) -> Result<Box<dyn CallStream>, CallError> {
//!         unimplemented!("unary-only example")
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let transport = Arc::new(EchoTransport);
//! let breaker = Breaker::new("planner", BreakerConfig::default());
//! let retry = RetryEngine::new(
//!     RetryPolicy::new(3, Backoff::new(Duration::from_millis(50), 2.0, Duration::from_secs(1)), 0.2),
//!     Arc::new(fabric_resilience::TokioSleeper),
//! );
//! let timeouts = Arc::new(AdaptiveTimeoutTable::new(TimeoutConfig::default()));
//! let pipeline = Pipeline::new("planner", transport, breaker, retry, timeouts);
//!
//! let descriptor = CallDescriptor::unary("planner.Group/Plan", serde_json::json!({"task": "ship it"}));
//! let cancel = CancellationToken::new();
//! let response = pipeline.call(descriptor, &cancel).await.expect("echo never fails");
//! assert_eq!(response.payload, serde_json::json!({"task": "ship it"}));
//! # }
//! ```

mod backoff;
mod call;
mod checkpoint;
mod circuit_breaker;
mod clock;
mod config;
mod endpoint;
mod error;
mod fallback;
mod gateway_types;
mod load_balancer;
mod pipeline;
mod pool;
mod registry;
mod retry;
mod sleeper;
pub mod telemetry;
mod timeout;
mod window;
mod wire;

pub use backoff::Backoff;
pub use call::{CallDescriptor, CallResponse, CallStream, StreamMessage, Transport};
pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointManager, CheckpointManagerStats, ResumableStream, StreamState};
pub use circuit_breaker::{Breaker, BreakerConfig, CircuitState, StateChange};
pub use clock::{Clock, MonotonicClock};
pub use config::{
    BreakerSettings, ConfigError, FabricConfig, PoolSettings, RetrySettings, ServiceConfig, TimeoutSettings,
};
pub use endpoint::Endpoint;
pub use error::{CallError, FailureCode, PipelineError, http_status_for};
pub use fallback::{BuiltinServiceHandler, FallbackCache, FallbackRegistry, RuleChain, ServiceHandler};
pub use gateway_types::{ErrorEnvelope, MetricsSnapshot, PoolMetrics, WorkflowEvent, WorkflowRequest, WorkflowType};
pub use load_balancer::{
    EndpointSnapshot, HealthChecker, LoadBalancer, LoadBalancerStats, SelectedEndpoint, StrategyKind,
};
pub use pipeline::Pipeline;
pub use pool::{ManageConnection, Pool, PoolConfig, PoolCounters, PoolGuard};
pub use registry::{BreakerRegistry, FabricRegistry, LoadBalancerRegistry, PoolRegistry};
pub use retry::{RetryEngine, RetryPolicy, RetryStats};
pub use sleeper::{InstantSleeper, SleepOutcome, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::{AdaptiveTimeout, AdaptiveTimeoutTable, TimeoutConfig};
pub use window::RollingWindow;
pub use wire::{decode, encode, Decoded, FrameError, JsonRpcVersion, RpcError, RpcErrorCode, RpcRequest, RpcResponse};

pub mod prelude;
