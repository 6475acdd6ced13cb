//! State-transition events emitted by the orchestrator. Observability proper
//! lives with an external collaborator; this narrow sink only propagates the
//! request id and the transition so that collaborator can correlate calls.

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Classified,
    Filtered,
    Queried,
    Retrieved,
    Composed,
    Done,
    Error,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Classified => "classified",
            Stage::Filtered => "filtered",
            Stage::Queried => "queried",
            Stage::Retrieved => "retrieved",
            Stage::Composed => "composed",
            Stage::Done => "done",
            Stage::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub request_id: String,
    pub stage: Stage,
    pub detail: String,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// Default sink: forwards each transition to `tracing`.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: TraceEvent) {
        info!(
            request_id = %event.request_id,
            stage = event.stage.as_str(),
            "{}",
            event.detail
        );
    }
}
