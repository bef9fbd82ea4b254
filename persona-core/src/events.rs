//! Transport boundary messages
//!
//! Requests arrive as `enrich` messages; progress leaves as tagged JSON
//! events. Both are plain serde types so any transport (stdio, WebSocket,
//! SSE) can carry them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{PipelineState, Stage};

/// Inbound request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundMessage {
    Enrich(EnrichRequest),
}

/// Subject to enrich
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichRequest {
    #[serde(default, alias = "name", alias = "subjectName")]
    pub subject_name: Option<String>,
    #[serde(default, alias = "summary", alias = "subjectSummary")]
    pub subject_summary: Option<String>,
}

impl EnrichRequest {
    pub fn new(name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            subject_name: Some(name.into()),
            subject_summary: Some(summary.into()),
        }
    }

    /// Initial pipeline state for this request
    pub fn into_state(self, source: &str) -> PipelineState {
        PipelineState::for_subject(self.subject_name, self.subject_summary, source)
    }
}

/// Derived outcome of a full run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    CompleteSuccess,
    PartialSuccess,
    CompleteFailure,
}

impl RunStatus {
    /// Status from the number of succeeded branches out of `total`
    pub fn from_counts(succeeded: usize, total: usize) -> Self {
        if succeeded == 0 {
            RunStatus::CompleteFailure
        } else if succeeded >= total {
            RunStatus::CompleteSuccess
        } else {
            RunStatus::PartialSuccess
        }
    }
}

/// Streamed progress events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A node began executing
    NodeStart {
        node: Stage,
        at: DateTime<Utc>,
    },

    /// Fields that became available when a node finished
    PartialResult {
        node: Stage,
        fields: Map<String, Value>,
    },

    /// A node finished
    NodeComplete {
        node: Stage,
        duration_ms: u64,
        /// Whether the node recorded a recoverable failure
        degraded: bool,
    },

    /// A node failed at its boundary
    NodeError {
        node: Stage,
        error: String,
    },

    /// Terminal event, emitted exactly once per run
    FinalResult {
        state: Box<PipelineState>,
        successful_branches: Vec<Stage>,
        failed_branches: Vec<Stage>,
        status: RunStatus,
    },
}

impl ProgressEvent {
    pub fn node_start(node: Stage) -> Self {
        ProgressEvent::NodeStart { node, at: Utc::now() }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, ProgressEvent::FinalResult { .. })
    }

    /// Event type tag as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::NodeStart { .. } => "node_start",
            ProgressEvent::PartialResult { .. } => "partial_result",
            ProgressEvent::NodeComplete { .. } => "node_complete",
            ProgressEvent::NodeError { .. } => "node_error",
            ProgressEvent::FinalResult { .. } => "final_result",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrich_message_parsing() {
        let raw = r#"{"type":"enrich","data":{"name":"Jane Doe","subjectSummary":"CEO of ExampleCorp"}}"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        let InboundMessage::Enrich(req) = msg;
        assert_eq!(req.subject_name.as_deref(), Some("Jane Doe"));
        assert_eq!(req.subject_summary.as_deref(), Some("CEO of ExampleCorp"));

        let state = req.into_state("test");
        assert_eq!(state.name.as_deref(), Some("Jane Doe"));
        assert_eq!(state.provenance.len(), 1);
    }

    #[test]
    fn test_event_tagging() {
        let event = ProgressEvent::NodeError {
            node: Stage::Leadership,
            error: "boom".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node_error");
        assert_eq!(json["node"], "leadership");
        assert_eq!(event.kind(), "node_error");
        assert!(!event.is_final());
    }

    #[test]
    fn test_status_from_counts() {
        assert_eq!(RunStatus::from_counts(0, 3), RunStatus::CompleteFailure);
        assert_eq!(RunStatus::from_counts(2, 3), RunStatus::PartialSuccess);
        assert_eq!(RunStatus::from_counts(3, 3), RunStatus::CompleteSuccess);
        let json = serde_json::to_value(RunStatus::PartialSuccess).unwrap();
        assert_eq!(json, "partial_success");
    }
}
