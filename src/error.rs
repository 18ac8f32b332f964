//! Crate-wide error taxonomy.
//!
//! `FailureCode` is the closed taxonomy every layer reasons about.
//! `CallError` is what a `Transport` returns. `PipelineError` is what the
//! resilience pipeline returns, in the shape of the teacher's
//! `ResilienceError<E>` but specialized to `CallError`.

use std::time::Duration;
use thiserror::Error;

/// Fixed taxonomy of infrastructure/application failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCode {
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    Aborted,
    Internal,
    Unknown,
    NotFound,
    InvalidArgument,
    PermissionDenied,
    FailedPrecondition,
    Cancelled,
}

impl FailureCode {
    /// Default set of codes the retry layer considers retryable.
    pub fn default_retryable() -> &'static [FailureCode] {
        &[
            FailureCode::Unavailable,
            FailureCode::DeadlineExceeded,
            FailureCode::ResourceExhausted,
            FailureCode::Aborted,
        ]
    }

    /// Default set of codes that count against a circuit breaker.
    pub fn default_breaker_tripping() -> &'static [FailureCode] {
        &[
            FailureCode::Unavailable,
            FailureCode::DeadlineExceeded,
            FailureCode::ResourceExhausted,
            FailureCode::Internal,
            FailureCode::Unknown,
        ]
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Error surfaced by a `Transport` call.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct CallError {
    pub code: FailureCode,
    pub message: String,
}

impl CallError {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Cap on stored failures inside `RetryExhausted` to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Unified error type returned by the resilience pipeline.
#[derive(Debug, Clone, Error)]
pub enum PipelineError<E = CallError> {
    #[error("admission refused, circuit open (retry after {retry_after:?})")]
    BreakerOpen { retry_after: Duration },

    #[error("per-attempt deadline exceeded after {elapsed:?} (limit {timeout:?})")]
    DeadlineExceeded { elapsed: Duration, timeout: Duration },

    #[error("target unreachable")]
    Unavailable,

    #[error("target overloaded")]
    ResourceExhausted,

    #[error("pool exhausted: max_size reached and acquire_timeout elapsed")]
    PoolExhausted,

    #[error("pool closed")]
    PoolClosed,

    #[error("no healthy endpoint available")]
    NoHealthyEndpoint,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("retry exhausted after {attempts} attempts, last error: {}", failures.last().map(|e| e.to_string()).unwrap_or_default())]
    RetryExhausted { attempts: usize, failures: Vec<E> },

    #[error("application error: {0}")]
    ApplicationError(E),
}

impl<E> PipelineError<E> {
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::BreakerOpen { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }
}

impl PipelineError<CallError> {
    /// `failure_code` of the underlying application error, if any.
    pub fn failure_code(&self) -> Option<FailureCode> {
        match self {
            Self::ApplicationError(e) => Some(e.code),
            Self::RetryExhausted { failures, .. } => failures.last().map(|e| e.code),
            _ => None,
        }
    }
}

/// Gateway-facing HTTP status mapping. Pure function; no HTTP server lives
/// in this crate, but an external gateway can call this to translate a
/// `PipelineError` into a response.
pub fn http_status_for<E>(err: &PipelineError<E>) -> u16 {
    match err {
        PipelineError::BreakerOpen { .. } => 503,
        PipelineError::Unavailable => 503,
        PipelineError::PoolExhausted => 503,
        PipelineError::PoolClosed => 503,
        PipelineError::DeadlineExceeded { .. } => 504,
        PipelineError::NoHealthyEndpoint => 503,
        PipelineError::InvalidArgument(_) => 400,
        PipelineError::ResourceExhausted => 503,
        PipelineError::RetryExhausted { .. } => 503,
        PipelineError::ApplicationError(_) => 500,
    }
}
