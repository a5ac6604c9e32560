//! Transport-agnostic wire shape: `{ kind, data, metadata }`.

use crate::event::CanonicalEvent;
use crate::ids::{TaskId, ThreadId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation tags the orchestrator attaches to every delivered event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub thread_id: ThreadId,
    pub task_id: TaskId,
    /// 1-based position among the events delivered for this task.
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
}

/// A canonical event as delivered for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub event: CanonicalEvent,
    pub metadata: EventMetadata,
}

impl TaskEvent {
    pub fn kind_name(&self) -> &str {
        self.event.kind_name()
    }

    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            kind: self.event.kind_name().to_owned(),
            data: self.event.data(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub kind: String,
    pub data: Value,
    pub metadata: EventMetadata,
}
