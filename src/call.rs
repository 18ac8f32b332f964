//! Call abstraction: the opaque descriptor interceptors and transports share.
//!
//! The wire-format choice stays out of scope; this module only gives the
//! pipeline a narrow seam (`Transport`) so it can be exercised against an
//! in-memory test double instead of a real RPC stack, the way the teacher's
//! `Sleeper`/`Clock` traits give its policies a seam for tests.

use crate::error::CallError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Instant;

/// A unary or server-streaming call descriptor.
#[derive(Debug, Clone)]
pub struct CallDescriptor {
    /// Dotted/slashed method path, e.g. `"planner.Group/Plan"`.
    pub method: String,
    pub deadline: Option<Instant>,
    pub metadata: HashMap<String, String>,
    pub payload: serde_json::Value,
    pub server_streaming: bool,
}

impl CallDescriptor {
    pub fn unary(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            deadline: None,
            metadata: HashMap::new(),
            payload,
            server_streaming: false,
        }
    }

    pub fn streaming(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { server_streaming: true, ..Self::unary(method, payload) }
    }

    /// The final segment of a dotted/slashed path: `svc.Group/Method` -> `Method`.
    pub fn method_name(&self) -> &str {
        self.method.rsplit(|c| c == '.' || c == '/').next().unwrap_or(&self.method)
    }
}

/// Result of a unary call.
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub payload: serde_json::Value,
}

/// One message out of a server-streaming call.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub sequence: u64,
    pub payload: serde_json::Value,
    pub progress_percent: u8,
}

/// A pull-based server-stream iterator abstraction with a cancel signal,
/// per spec.md §9's "coroutine control flow" mapping.
#[async_trait]
pub trait CallStream: Send {
    /// Returns the next message, or `None` when the stream has ended.
    async fn next_message(&mut self) -> Result<Option<StreamMessage>, CallError>;
}

/// Narrow transport seam the resilience pipeline calls through.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, descriptor: &CallDescriptor) -> Result<CallResponse, CallError>;

    async fn open_stream(
        &self,
        descriptor: &CallDescriptor,
    ) -> Result<Box<dyn CallStream>, CallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_name_takes_final_segment_of_dotted_path() {
        let d = CallDescriptor::unary("planner.Group/Plan", serde_json::json!({}));
        assert_eq!(d.method_name(), "Plan");
    }

    #[test]
    fn method_name_handles_bare_method() {
        let d = CallDescriptor::unary("Analyze", serde_json::json!({}));
        assert_eq!(d.method_name(), "Analyze");
    }

    #[test]
    fn streaming_constructor_sets_flag() {
        let d = CallDescriptor::streaming("executor.Group/Watch", serde_json::json!(null));
        assert!(d.server_streaming);
    }
}
