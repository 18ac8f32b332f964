//! Fixed-order resilience pipeline: Fallback-on-breaker-rejection → Breaker
//! → Retry → Adaptive Timeout → Transport.
//!
//! Grounded on the teacher's `stack.rs` nested-composition shape, reordered
//! per spec.md §4.6: the breaker is outermost among the gating layers so it
//! can short-circuit cheaply, and retry wraps timeout so every attempt gets
//! a freshly computed deadline instead of a collapsing wall-clock one.

use crate::call::{CallDescriptor, CallResponse, Transport};
use crate::circuit_breaker::Breaker;
use crate::error::{CallError, FailureCode, PipelineError};
use crate::fallback::FallbackRegistry;
use crate::retry::RetryEngine;
use crate::telemetry::{FabricEvent, NullSink, TelemetrySink};
use crate::timeout::{AdaptiveTimeout, AdaptiveTimeoutTable};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One service's fully composed resilience pipeline.
pub struct Pipeline<T, Sink = NullSink> {
    service: String,
    transport: Arc<T>,
    breaker: Breaker<Sink>,
    retry: RetryEngine<Sink>,
    timeouts: Arc<AdaptiveTimeoutTable>,
    fallback: Option<Arc<FallbackRegistry<Sink>>>,
}

impl<T> Pipeline<T, NullSink>
where
    T: Transport,
{
    pub fn new(
        service: impl Into<String>,
        transport: Arc<T>,
        breaker: Breaker<NullSink>,
        retry: RetryEngine<NullSink>,
        timeouts: Arc<AdaptiveTimeoutTable>,
    ) -> Self {
        Self { service: service.into(), transport, breaker, retry, timeouts, fallback: None }
    }
}

impl<T, Sink> Pipeline<T, Sink>
where
    T: Transport,
    Sink: TelemetrySink + Clone + Send + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    pub fn with_fallback(mut self, fallback: Arc<FallbackRegistry<Sink>>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Dispatches `descriptor` through breaker → retry → adaptive timeout →
    /// transport. On breaker rejection, consults the fallback registry
    /// before surfacing `BreakerOpen`.
    pub async fn call(
        &self,
        descriptor: CallDescriptor,
        cancel: &CancellationToken,
    ) -> Result<CallResponse, PipelineError<CallError>> {
        let method = descriptor.method_name().to_string();
        let transport = Arc::clone(&self.transport);
        let timeouts = Arc::clone(&self.timeouts);
        let retry = self.retry.clone();
        let descriptor_for_fallback = descriptor.clone();

        // Breaker's `E` here is `PipelineError<CallError>`, the retry
        // engine's own result type, so `RetryExhausted` reaches the breaker
        // intact and is still classifiable via `failure_code()`.
        let breaker_result = self
            .breaker
            .execute(
                move || async move {
                    let (result, _stats) = retry
                        .execute(
                            |_attempt| {
                                let descriptor = descriptor.clone();
                                let transport = Arc::clone(&transport);
                                let timed = AdaptiveTimeout::new(method.clone(), Arc::clone(&timeouts));
                                async move { timed.execute(|| async move { transport.call(&descriptor).await }).await.map_err(unwrap_call_error) }
                            },
                            |e| e.code,
                            cancel,
                        )
                        .await;
                    result
                },
                |e: &PipelineError<CallError>| e.failure_code().unwrap_or(FailureCode::Unknown),
            )
            .await;

        match breaker_result {
            Ok(v) => Ok(v),
            Err(PipelineError::BreakerOpen { retry_after }) => {
                if let Some(fallback) = &self.fallback {
                    let method = descriptor_for_fallback.method_name().to_string();
                    if let Some(response) =
                        fallback.resolve(&self.service, &method, &descriptor_for_fallback.payload).await
                    {
                        return Ok(CallResponse { payload: response });
                    }
                }
                Err(PipelineError::BreakerOpen { retry_after })
            }
            Err(PipelineError::ApplicationError(inner)) => Err(inner),
            Err(other) => unreachable!("breaker only ever returns BreakerOpen or ApplicationError, got {other}"),
        }
    }
}

/// Adaptive timeout returns `PipelineError<CallError>` (it can itself report
/// `DeadlineExceeded`); the retry engine's op closure needs a bare
/// `CallError` to classify against the retryable set.
fn unwrap_call_error(err: PipelineError<CallError>) -> CallError {
    match err {
        PipelineError::ApplicationError(e) => e,
        PipelineError::DeadlineExceeded { .. } => CallError::new(FailureCode::DeadlineExceeded, err.to_string()),
        other => CallError::new(FailureCode::Unknown, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::circuit_breaker::BreakerConfig;
    use crate::call::CallStream;
    use crate::retry::RetryPolicy;
    use crate::sleeper::InstantSleeper;
    use crate::timeout::TimeoutConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakyTransport {
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn call(&self, _descriptor: &CallDescriptor) -> Result<CallResponse, CallError> {
            if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(CallError::new(FailureCode::Unavailable, "down"))
            } else {
                Ok(CallResponse { payload: serde_json::json!("ok") })
            }
        }

        async fn open_stream(&self, _descriptor: &CallDescriptor) -> Result<Box<dyn CallStream>, CallError> {
            unimplemented!("not exercised by these tests")
        }
    }

    fn test_pipeline(failures_left: usize) -> Pipeline<FlakyTransport> {
        let transport = Arc::new(FlakyTransport { failures_left: AtomicUsize::new(failures_left) });
        let breaker = Breaker::new("svc", BreakerConfig::default());
        let policy = RetryPolicy::new(3, Backoff::new(Duration::from_millis(1), 2.0, Duration::from_millis(10)), 0.0);
        let retry = RetryEngine::new(policy, Arc::new(InstantSleeper));
        let timeouts = Arc::new(AdaptiveTimeoutTable::new(TimeoutConfig::default()));
        Pipeline::new("svc", transport, breaker, retry, timeouts)
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_via_retry() {
        let pipeline = test_pipeline(2);
        let cancel = CancellationToken::new();
        let descriptor = CallDescriptor::unary("svc.Group/Plan", serde_json::json!({}));
        let result = pipeline.call(descriptor, &cancel).await;
        assert_eq!(result.unwrap().payload, serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn breaker_rejection_consults_fallback() {
        let transport = Arc::new(FlakyTransport { failures_left: AtomicUsize::new(usize::MAX) });
        let breaker = Breaker::new("svc", BreakerConfig { failure_threshold: 1, ..BreakerConfig::default() });
        let policy = RetryPolicy::new(1, Backoff::new(Duration::from_millis(1), 2.0, Duration::from_millis(10)), 0.0);
        let retry = RetryEngine::new(policy, Arc::new(InstantSleeper));
        let timeouts = Arc::new(AdaptiveTimeoutTable::new(TimeoutConfig::default()));
        let pipeline = Pipeline::new("svc", transport, breaker, retry, timeouts);
        let fallback = Arc::new(
            FallbackRegistry::new(10)
                .register_handler("svc", crate::fallback::BuiltinServiceHandler::new("svc")),
        );
        let pipeline = pipeline.with_fallback(fallback);

        let cancel = CancellationToken::new();
        let descriptor = CallDescriptor::unary("svc.Group/health", serde_json::json!({}));
        let _ = pipeline.call(descriptor.clone(), &cancel).await;
        let second = pipeline.call(descriptor, &cancel).await;
        assert_eq!(second.unwrap().payload, serde_json::json!({ "status": "Degraded" }));
    }
}
