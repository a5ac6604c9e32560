//! Raw engine events and the canonical events exposed to clients.
//!
//! The engine vocabulary is open and versioned: kinds are string tags and
//! payload fields are optional. Unknown tags parse into
//! `RawEventKind::Unknown` instead of failing, and normalize into
//! `CanonicalEvent::Passthrough`.

use crate::ids::CorrelationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

// ─── Raw engine vocabulary ─────────────────────────────────────────

/// Tag of an engine-emitted event.
///
/// Serialises to the canonical hyphenated tag. The legacy v1 engine names
/// (`on_tool_start`, `on_chain_end`, ...) parse to the same variants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RawEventKind {
    ToolInvocationStarted,
    ToolInvocationEnded,
    PhaseStarted,
    PhaseEnded,
    ModelToken,
    ModelTurnEnded,
    /// Synthesised by the budget governor, never by the engine.
    ExecutionEnded,
    Unknown(String),
}

impl RawEventKind {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "tool-invocation-started" | "on_tool_start" => Self::ToolInvocationStarted,
            "tool-invocation-ended" | "on_tool_end" => Self::ToolInvocationEnded,
            "phase-started" | "on_chain_start" => Self::PhaseStarted,
            "phase-ended" | "on_chain_end" => Self::PhaseEnded,
            "model-token" | "on_chat_model_stream" => Self::ModelToken,
            "model-turn-ended" | "on_chat_model_end" => Self::ModelTurnEnded,
            "execution-ended" => Self::ExecutionEnded,
            other => Self::Unknown(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ToolInvocationStarted => "tool-invocation-started",
            Self::ToolInvocationEnded => "tool-invocation-ended",
            Self::PhaseStarted => "phase-started",
            Self::PhaseEnded => "phase-ended",
            Self::ModelToken => "model-token",
            Self::ModelTurnEnded => "model-turn-ended",
            Self::ExecutionEnded => "execution-ended",
            Self::Unknown(tag) => tag,
        }
    }

    pub fn is_tool_start(&self) -> bool {
        matches!(self, Self::ToolInvocationStarted)
    }
}

impl From<String> for RawEventKind {
    fn from(tag: String) -> Self {
        match Self::parse(&tag) {
            Self::Unknown(_) => Self::Unknown(tag),
            known => known,
        }
    }
}

impl From<&str> for RawEventKind {
    fn from(tag: &str) -> Self {
        Self::parse(tag)
    }
}

impl From<RawEventKind> for String {
    fn from(kind: RawEventKind) -> Self {
        match kind {
            RawEventKind::Unknown(tag) => tag,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for RawEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event as emitted by the execution engine. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub kind: RawEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Emission instant. Every canonical timestamp is derived from it.
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(kind: impl Into<RawEventKind>) -> Self {
        Self {
            kind: kind.into(),
            correlation_id: None,
            payload: Value::Null,
            label: None,
            observed_at: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    /// The forced-termination event the governor emits in place of a
    /// blocked tool start.
    pub fn execution_ended(tool_calls: u32) -> Self {
        Self::new(RawEventKind::ExecutionEnded).with_payload(json!({
            "status": ExecutionStatus::Completed,
            "reason": TerminationReason::ToolCallLimitExceeded,
            "tool_calls": tool_calls,
        }))
    }
}

// ─── Canonical contract ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub status: EventStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub id: String,
    pub name: String,
    pub status: EventStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub detail: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCompleteEvent {
    pub id: String,
    pub content: String,
    pub completed_at: DateTime<Utc>,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ToolCallLimitExceeded,
    /// The engine closed its stream without a final model turn.
    EngineFinished,
}

/// Graceful end of an execution. An expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEndedEvent {
    pub status: ExecutionStatus,
    pub reason: TerminationReason,
    pub tool_calls: u32,
}

impl ExecutionEndedEvent {
    /// Closing event for an engine stream that ended on its own.
    pub fn engine_finished(tool_calls: u32) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            reason: TerminationReason::EngineFinished,
            tool_calls,
        }
    }

    /// True when the budget cut the execution short.
    pub fn is_forced(&self) -> bool {
        self.reason == TerminationReason::ToolCallLimitExceeded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Timeout,
    StreamFailure,
    EngineFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: String,
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_delivered: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Stable outward contract rendered by UIs.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalEvent {
    ToolCall(ToolCallEvent),
    Step(StepEvent),
    MessageComplete(MessageCompleteEvent),
    ExecutionEnded(ExecutionEndedEvent),
    Error(ErrorEvent),
    /// Unrecognised engine kind, forwarded unchanged.
    Passthrough(RawEvent),
}

impl CanonicalEvent {
    pub const TOOL_CALL: &'static str = "tool_call";
    pub const STEP: &'static str = "step";
    pub const MESSAGE_COMPLETE: &'static str = "message_complete";
    pub const EXECUTION_ENDED: &'static str = "execution_ended";
    pub const ERROR: &'static str = "error";

    /// Wire `kind`. Passthrough events keep the engine's own tag.
    pub fn kind_name(&self) -> &str {
        match self {
            Self::ToolCall(_) => Self::TOOL_CALL,
            Self::Step(_) => Self::STEP,
            Self::MessageComplete(_) => Self::MESSAGE_COMPLETE,
            Self::ExecutionEnded(_) => Self::EXECUTION_ENDED,
            Self::Error(_) => Self::ERROR,
            Self::Passthrough(raw) => raw.kind.as_str(),
        }
    }

    /// Terminal events end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ExecutionEnded(_) | Self::Error(_))
    }

    /// Lifecycle identity for events that carry a running/completed status.
    pub fn lifecycle(&self) -> Option<(&str, EventStatus)> {
        match self {
            Self::ToolCall(call) => Some((call.id.as_str(), call.status)),
            Self::Step(step) => Some((step.id.as_str(), step.status)),
            _ => None,
        }
    }

    /// Wire `data` object.
    pub fn data(&self) -> Value {
        let value = match self {
            Self::ToolCall(call) => serde_json::to_value(call),
            Self::Step(step) => serde_json::to_value(step),
            Self::MessageComplete(message) => serde_json::to_value(message),
            Self::ExecutionEnded(ended) => serde_json::to_value(ended),
            Self::Error(error) => serde_json::to_value(error),
            Self::Passthrough(raw) => {
                return json!({
                    "id": raw.correlation_id.as_ref().map(|id| id.as_str()).unwrap_or_default(),
                    "payload": raw.payload,
                    "label": raw.label,
                    "observed_at": raw.observed_at,
                });
            }
        };
        value.unwrap_or_else(|error| json!({ "error": error.to_string() }))
    }
}
