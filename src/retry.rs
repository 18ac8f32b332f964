//! Bounded retry with capped exponential backoff and additive jitter.
//!
//! REDESIGN vs. the teacher: the teacher's `Jitter` enum applies
//! *multiplicative* jitter (`Full`/`Equal`/`Decorrelated`) over the whole
//! delay. spec.md requires additive jitter: `base_k ± U(0, jitter × base_k)`.
//! The teacher's `Backoff` shape and retry-loop structure are kept; the
//! jitter model is the single additive formula the spec mandates — no open
//! strategy surface, since there is exactly one jitter shape in scope.

use crate::backoff::Backoff;
use crate::error::{CallError, FailureCode, PipelineError, MAX_RETRY_FAILURES};
use crate::sleeper::{Sleeper, SleepOutcome};
use crate::telemetry::{emit_best_effort, FabricEvent, NullSink, RetryEvent, TelemetrySink};
use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Backoff,
    /// Fraction in `[0, 1]` of `base_k` to jitter by, both directions.
    pub jitter: f64,
    pub retryable: HashSet<FailureCode>,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: Backoff, jitter: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            jitter: jitter.clamp(0.0, 1.0),
            retryable: FailureCode::default_retryable().iter().copied().collect(),
        }
    }
}

/// Outcome counters for one `execute` call, exposed for assertions/telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub total_attempts: usize,
    pub retried: bool,
}

type RetryCallback = dyn Fn(usize, &CallError, Duration) + Send + Sync;

#[derive(Clone)]
pub struct RetryEngine<Sink = NullSink> {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    on_retry: Option<Arc<RetryCallback>>,
    sink: Sink,
}

impl RetryEngine<NullSink> {
    pub fn new(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper, on_retry: None, sink: NullSink }
    }
}

impl<Sink> RetryEngine<Sink>
where
    Sink: Clone,
{
    pub fn with_sink<NewSink: Clone>(self, sink: NewSink) -> RetryEngine<NewSink> {
        RetryEngine { policy: self.policy, sleeper: self.sleeper, on_retry: self.on_retry, sink }
    }

    pub fn on_retry(mut self, callback: impl Fn(usize, &CallError, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(callback));
        self
    }
}

impl<Sink> RetryEngine<Sink>
where
    Sink: TelemetrySink + Clone + Send + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    /// `sample_jitter` takes `base_k` and returns `base_k + U(-jitter*base_k, +jitter*base_k)`.
    fn jittered_delay(&self, base: Duration) -> Duration {
        if self.policy.jitter == 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.policy.jitter;
        let noise = rand::rng().random_range(-spread..=spread);
        let secs = (base.as_secs_f64() + noise).max(0.0);
        Duration::from_secs_f64(secs)
    }

    /// Runs `op` up to `max_attempts` times. `classify` maps a failure to a
    /// `FailureCode` to check against the retryable set.
    pub async fn execute<T, Fut>(
        &self,
        mut op: impl FnMut(usize) -> Fut,
        classify: impl Fn(&CallError) -> FailureCode,
        cancel: &CancellationToken,
    ) -> (Result<T, PipelineError<CallError>>, RetryStats)
    where
        Fut: Future<Output = Result<T, CallError>>,
    {
        let start = Instant::now();
        let mut failures: Vec<CallError> = Vec::new();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return (
                    Err(PipelineError::ApplicationError(CallError::new(FailureCode::Cancelled, "cancelled"))),
                    RetryStats { total_attempts: attempt - 1, retried: !failures.is_empty() },
                );
            }

            match op(attempt - 1).await {
                Ok(v) => {
                    return (Ok(v), RetryStats { total_attempts: attempt, retried: attempt > 1 });
                }
                Err(e) => {
                    let code = classify(&e);
                    let retryable = self.policy.retryable.contains(&code);
                    let attempts_remaining = attempt < self.policy.max_attempts;

                    if failures.len() < MAX_RETRY_FAILURES {
                        failures.push(e.clone());
                    }

                    if !retryable || !attempts_remaining {
                        if !retryable {
                            return (Err(PipelineError::ApplicationError(e)), RetryStats { total_attempts: attempt, retried: false });
                        }
                        self.emit_exhausted(attempt, start.elapsed());
                        return (
                            Err(PipelineError::RetryExhausted { attempts: attempt, failures }),
                            RetryStats { total_attempts: attempt, retried: attempt > 1 },
                        );
                    }

                    let base = self.policy.backoff.base_delay(attempt - 1);
                    let delay = self.jittered_delay(base);

                    if let Some(cb) = &self.on_retry {
                        cb(attempt, &e, delay);
                    }
                    self.emit_attempt(attempt, delay);

                    if self.sleeper.sleep_cancellable(delay, cancel).await == SleepOutcome::Cancelled {
                        return (
                            Err(PipelineError::ApplicationError(CallError::new(FailureCode::Cancelled, "cancelled during backoff"))),
                            RetryStats { total_attempts: attempt, retried: true },
                        );
                    }
                }
            }
        }
    }

    fn emit_attempt(&self, attempt: usize, delay: Duration) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            emit_best_effort(sink, FabricEvent::Retry(RetryEvent::Attempt { attempt, delay })).await;
        });
    }

    fn emit_exhausted(&self, total_attempts: usize, total_duration: Duration) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            emit_best_effort(sink, FabricEvent::Retry(RetryEvent::Exhausted { total_attempts, total_duration })).await;
        });
    }
}
