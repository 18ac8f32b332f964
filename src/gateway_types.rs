//! Serializable shapes an external HTTP gateway would emit.
//!
//! spec.md §6 describes a gateway surface (workflow endpoint, SSE stream,
//! metrics endpoint, error envelope) that is explicitly out of scope for
//! this crate (no axum server lives here). This module supplies only the
//! `serde::Serialize`/`Deserialize` types a gateway crate would re-export,
//! the way `jmylchreest-m3u-proxy` separates its `models` from its `web`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::load_balancer::LoadBalancerStats;
use crate::pool::PoolCounters;

#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub current_size: usize,
    pub available: usize,
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_created: u64,
    pub total_destroyed: u64,
}

impl PoolMetrics {
    pub fn new(current_size: usize, available: usize, counters: PoolCounters) -> Self {
        Self {
            current_size,
            available,
            total_acquired: counters.total_acquired,
            total_released: counters.total_released,
            total_created: counters.total_created,
            total_destroyed: counters.total_destroyed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub pools: HashMap<String, PoolMetrics>,
    pub load_balancers: HashMap<String, LoadBalancerStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Pipeline,
    Parallel,
    /// Static pre-partition across a fixed worker set, per spec.md §9's
    /// resolution of the "self-organizing swarm" open question; no
    /// orchestration logic is implemented, this is a label only.
    Swarm,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRequest {
    pub task: String,
    #[serde(default)]
    pub constraints: Option<serde_json::Value>,
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub stream: bool,
}

/// One `data: {...}\n\n` frame of the workflow SSE stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Start,
    StepStart { step: String, agent: String },
    StepComplete { step: String, agent: String, result: serde_json::Value },
    StepError { step: String, agent: String, error: String },
    Complete { result: serde_json::Value },
    Error { error: String },
}

impl WorkflowEvent {
    /// Renders this event as one SSE frame, including the trailing blank line.
    pub fn to_sse(&self) -> String {
        let payload = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {payload}\n\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    pub fallback_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_service: Option<String>,
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_type_serializes_to_snake_case() {
        assert_eq!(serde_json::to_string(&WorkflowType::Swarm).unwrap(), "\"swarm\"");
    }

    #[test]
    fn workflow_request_defaults_stream_to_false_when_absent() {
        let request: WorkflowRequest = serde_json::from_str(
            r#"{"task": "plan the thing", "workflow_type": "pipeline"}"#,
        )
        .unwrap();
        assert!(!request.stream);
        assert!(request.constraints.is_none());
    }

    #[test]
    fn sse_frame_has_data_prefix_and_trailing_blank_line() {
        let event = WorkflowEvent::StepStart { step: "plan".into(), agent: "planner".into() };
        let frame = event.to_sse();
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"event\":\"step_start\""));
    }

    #[test]
    fn error_envelope_omits_absent_optional_fields() {
        let envelope = ErrorEnvelope {
            error: "breaker_open".into(),
            detail: "circuit open for planner".into(),
            retry_after: None,
            fallback_available: false,
            fallback_service: None,
            request_id: "req-1".into(),
        };
        let text = serde_json::to_string(&envelope).unwrap();
        assert!(!text.contains("retry_after"));
        assert!(!text.contains("fallback_service"));
    }
}
