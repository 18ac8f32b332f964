//! Per-method adaptive timeout, generalized from the teacher's
//! `TimeoutPolicy`/`.execute()` shape (fixed duration, `tokio::time::timeout`,
//! telemetry on outcome) to a duration computed per-call from a sliding p95
//! per method. The teacher also exposes this as a `tower::Layer`/`Service`
//! pair for its `ServiceBuilder` stack; this crate has no such stack to plug
//! into, so only the bare `.execute()` surface is kept.

use crate::error::{CallError, FailureCode, PipelineError};
use crate::telemetry::{emit_best_effort, FabricEvent, NullSink, RequestOutcome, TelemetrySink, TimeoutEvent};
use crate::window::RollingWindow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Below this many samples, the estimator falls back to the configured base.
pub const MIN_SAMPLES_FOR_ADAPTATION: usize = 10;

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub adaptive_enabled: bool,
    pub window_size: usize,
    pub percentile: u8,
    pub adjustment_factor: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub global_default: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            adaptive_enabled: true,
            window_size: 100,
            percentile: 95,
            adjustment_factor: 1.5,
            min_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_secs(30),
            global_default: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct MethodState {
    base_override: Option<Duration>,
    window: RollingWindow<Duration>,
}

/// Maintains one rolling latency window per method and estimates the
/// deadline for the next call to that method.
#[derive(Debug)]
pub struct AdaptiveTimeoutTable {
    config: TimeoutConfig,
    methods: Mutex<HashMap<String, MethodState>>,
}

impl AdaptiveTimeoutTable {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config, methods: Mutex::new(HashMap::new()) }
    }

    pub fn set_base_override(&self, method: &str, base: Duration) {
        let mut guard = self.methods.lock().unwrap();
        let window_size = self.config.window_size;
        let entry = guard
            .entry(method.to_string())
            .or_insert_with(|| MethodState { base_override: None, window: RollingWindow::new(window_size) });
        entry.base_override = Some(base);
    }

    fn base_for(&self, method: &str, guard: &HashMap<String, MethodState>) -> Duration {
        guard.get(method).and_then(|m| m.base_override).unwrap_or(self.config.global_default)
    }

    /// Compute the timeout to use for the next call to `method`.
    pub fn estimate(&self, method: &str) -> Duration {
        let guard = self.methods.lock().unwrap();
        let base = self.base_for(method, &guard);

        if !self.config.adaptive_enabled {
            return base;
        }

        let window = guard.get(method).map(|m| &m.window);
        let len = window.map(|w| w.len()).unwrap_or(0);
        if len < MIN_SAMPLES_FOR_ADAPTATION {
            return base;
        }

        let sample = window.and_then(|w| w.percentile(self.config.percentile)).unwrap_or(base);
        let scaled = sample.mul_f64(self.config.adjustment_factor);
        let high = self.config.max_timeout.min(base * 2);
        scaled.clamp(self.config.min_timeout, high)
    }

    /// Record a single latency sample for `method`. Called on every
    /// completed call, success or failure.
    pub fn record(&self, method: &str, latency: Duration) {
        let mut guard = self.methods.lock().unwrap();
        let window_size = self.config.window_size;
        let entry = guard
            .entry(method.to_string())
            .or_insert_with(|| MethodState { base_override: None, window: RollingWindow::new(window_size) });
        entry.window.push(latency);
    }
}

/// Executes an operation under the adaptive timeout for `method`, recording
/// the latency sample and emitting telemetry on the outcome.
pub struct AdaptiveTimeout<Sink = NullSink> {
    method: String,
    table: std::sync::Arc<AdaptiveTimeoutTable>,
    sink: Sink,
}

impl AdaptiveTimeout<NullSink> {
    pub fn new(method: impl Into<String>, table: std::sync::Arc<AdaptiveTimeoutTable>) -> Self {
        Self { method: method.into(), table, sink: NullSink }
    }
}

impl<Sink> AdaptiveTimeout<Sink>
where
    Sink: Clone,
{
    pub fn with_sink<NewSink: Clone>(self, sink: NewSink) -> AdaptiveTimeout<NewSink> {
        AdaptiveTimeout { method: self.method, table: self.table, sink }
    }
}

impl<Sink> AdaptiveTimeout<Sink>
where
    Sink: TelemetrySink + Clone + Send + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    pub async fn execute<T, Fut>(&self, op: impl FnOnce() -> Fut) -> Result<T, PipelineError<CallError>>
    where
        Fut: Future<Output = Result<T, CallError>>,
    {
        let duration = self.table.estimate(&self.method);
        let start = Instant::now();

        match tokio::time::timeout(duration, op()).await {
            Ok(Ok(v)) => {
                let elapsed = start.elapsed();
                self.table.record(&self.method, elapsed);
                self.emit(FabricEvent::Request(RequestOutcome::Success { duration: elapsed }));
                Ok(v)
            }
            Ok(Err(e)) => {
                let elapsed = start.elapsed();
                self.table.record(&self.method, elapsed);
                self.emit(FabricEvent::Request(RequestOutcome::Failure { duration: elapsed }));
                Err(PipelineError::ApplicationError(e))
            }
            Err(_) => {
                let elapsed = start.elapsed();
                self.table.record(&self.method, elapsed);
                self.emit(FabricEvent::Timeout(TimeoutEvent::Occurred { method: self.method.clone(), timeout: duration }));
                Err(PipelineError::DeadlineExceeded { elapsed, timeout: duration })
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

/// Maps a deadline-exceeded outcome to the taxonomy's failure code, for
/// classifying a `PipelineError` back into a `FailureCode` for upstream
/// layers (the breaker, the retry engine's `classify` hook).
pub fn failure_code_for(err: &PipelineError<CallError>) -> FailureCode {
    match err {
        PipelineError::DeadlineExceeded { .. } => FailureCode::DeadlineExceeded,
        PipelineError::ApplicationError(e) => e.code,
        _ => FailureCode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(cfg: TimeoutConfig) -> AdaptiveTimeoutTable {
        AdaptiveTimeoutTable::new(cfg)
    }

    #[test]
    fn fewer_than_ten_samples_returns_base() {
        let t = table(TimeoutConfig::default());
        for _ in 0..9 {
            t.record("Analyze", Duration::from_secs(1));
        }
        assert_eq!(t.estimate("Analyze"), TimeoutConfig::default().global_default);
    }

    #[test]
    fn exactly_ten_samples_returns_clamped_p95() {
        let cfg = TimeoutConfig {
            adjustment_factor: 1.5,
            min_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(10),
            global_default: Duration::from_secs(5),
            ..TimeoutConfig::default()
        };
        let t = table(cfg);
        for _ in 0..15 {
            t.record("Analyze", Duration::from_secs_f64(1.0));
        }
        // min(1.5 * 1.0, 2 * 5.0, 10) = 1.5s
        assert_eq!(t.estimate("Analyze"), Duration::from_secs_f64(1.5));
    }

    #[test]
    fn per_method_base_override_wins_over_global_default() {
        let t = table(TimeoutConfig::default());
        t.set_base_override("Plan", Duration::from_secs(2));
        assert_eq!(t.estimate("Plan"), Duration::from_secs(2));
    }

    #[test]
    fn adaptive_disabled_always_returns_base() {
        let cfg = TimeoutConfig { adaptive_enabled: false, ..TimeoutConfig::default() };
        let t = table(cfg);
        for _ in 0..50 {
            t.record("Analyze", Duration::from_secs(20));
        }
        assert_eq!(t.estimate("Analyze"), TimeoutConfig::default().global_default);
    }

    #[tokio::test]
    async fn execute_records_latency_sample_on_success() {
        let table = std::sync::Arc::new(AdaptiveTimeoutTable::new(TimeoutConfig::default()));
        let at = AdaptiveTimeout::new("Plan", table.clone());
        let result = at.execute(|| async { Ok::<_, CallError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn execute_times_out_long_operation() {
        tokio::time::pause();
        let cfg = TimeoutConfig { global_default: Duration::from_millis(10), ..TimeoutConfig::default() };
        let table = std::sync::Arc::new(AdaptiveTimeoutTable::new(cfg));
        let at = AdaptiveTimeout::new("Slow", table);
        let fut = at.execute(|| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, CallError>(())
        });
        tokio::pin!(fut);
        tokio::time::advance(Duration::from_millis(11)).await;
        let result = fut.await;
        assert!(matches!(result, Err(PipelineError::DeadlineExceeded { .. })));
    }
}
