//! Event normalizer: engine `RawEvent` → stable `CanonicalEvent`.
//!
//! `normalize` is total and pure. The engine does not guarantee
//! field-complete payloads, so every field falls back to a documented
//! placeholder, and every timestamp comes from `RawEvent::observed_at`.
//! Policy (allow-listing, lifecycle checks) lives in the orchestrator.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use steward_protocol::{
    CanonicalEvent, EventStatus, ExecutionEndedEvent, MessageCompleteEvent, RawEvent,
    RawEventKind, StepEvent, ToolCallEvent,
};

pub const UNKNOWN_TOOL_NAME: &str = "unknown_tool";
pub const UNNAMED_STEP: &str = "unnamed_step";
pub const DEFAULT_FINISH_REASON: &str = "stop";

pub fn normalize(raw: &RawEvent) -> CanonicalEvent {
    match &raw.kind {
        RawEventKind::ToolInvocationStarted => CanonicalEvent::ToolCall(ToolCallEvent {
            id: event_id(raw, "call"),
            name: named(raw, UNKNOWN_TOOL_NAME),
            arguments: tool_arguments(&raw.payload),
            result: None,
            status: EventStatus::Running,
            started_at: raw.observed_at,
            completed_at: None,
            error: None,
        }),
        RawEventKind::ToolInvocationEnded => CanonicalEvent::ToolCall(ToolCallEvent {
            id: event_id(raw, "call"),
            name: named(raw, UNKNOWN_TOOL_NAME),
            arguments: tool_arguments(&raw.payload),
            result: first_field(&raw.payload, &["output", "result"]).cloned(),
            status: EventStatus::Completed,
            started_at: started_at(raw),
            completed_at: Some(raw.observed_at),
            error: raw.payload.get("error").and_then(render_error),
        }),
        RawEventKind::PhaseStarted => CanonicalEvent::Step(StepEvent {
            id: event_id(raw, "step"),
            name: named(raw, UNNAMED_STEP),
            status: EventStatus::Running,
            started_at: raw.observed_at,
            completed_at: None,
            detail: raw.payload.clone(),
        }),
        RawEventKind::PhaseEnded => CanonicalEvent::Step(StepEvent {
            id: event_id(raw, "step"),
            name: named(raw, UNNAMED_STEP),
            status: EventStatus::Completed,
            started_at: started_at(raw),
            completed_at: Some(raw.observed_at),
            detail: raw.payload.clone(),
        }),
        RawEventKind::ModelTurnEnded => CanonicalEvent::MessageComplete(MessageCompleteEvent {
            id: event_id(raw, "msg"),
            content: message_content(&raw.payload),
            completed_at: raw.observed_at,
            finish_reason: raw
                .payload
                .get("finish_reason")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_FINISH_REASON)
                .to_owned(),
        }),
        RawEventKind::ExecutionEnded => {
            match serde_json::from_value::<ExecutionEndedEvent>(raw.payload.clone()) {
                Ok(ended) => CanonicalEvent::ExecutionEnded(ended),
                Err(_) => CanonicalEvent::Passthrough(raw.clone()),
            }
        }
        RawEventKind::ModelToken | RawEventKind::Unknown(_) => {
            CanonicalEvent::Passthrough(raw.clone())
        }
    }
}

fn event_id(raw: &RawEvent, prefix: &str) -> String {
    match &raw.correlation_id {
        Some(id) if !id.is_blank() => id.as_str().to_owned(),
        _ => derived_id(raw, prefix),
    }
}

/// Content-derived id for events the engine left uncorrelated. Stable for a
/// given event so normalization stays repeatable.
fn derived_id(raw: &RawEvent, prefix: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.kind.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(raw.label.as_deref().unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(raw.payload.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(raw.observed_at.to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{prefix}_{}", &digest[..16])
}

fn named(raw: &RawEvent, fallback: &str) -> String {
    raw.label
        .as_deref()
        .filter(|label| !label.trim().is_empty())
        .or_else(|| raw.payload.get("name").and_then(Value::as_str))
        .unwrap_or(fallback)
        .to_owned()
}

fn first_field<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .find(|value| !value.is_null())
}

fn tool_arguments(payload: &Value) -> Value {
    first_field(payload, &["input", "arguments"])
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()))
}

fn started_at(raw: &RawEvent) -> DateTime<Utc> {
    raw.payload
        .get("started_at")
        .and_then(Value::as_str)
        .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or(raw.observed_at)
}

fn render_error(error: &Value) -> Option<String> {
    match error {
        Value::Null => None,
        Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    }
}

fn message_content(payload: &Value) -> String {
    let content = payload
        .get("content")
        .or_else(|| payload.get("output").and_then(|output| output.get("content")))
        .or_else(|| payload.get("output").filter(|output| output.is_string()));

    match content {
        Some(Value::String(text)) => text.clone(),
        // Block-style content: concatenate the text blocks.
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| block.as_str().or_else(|| block.get("text")?.as_str()))
            .collect(),
        _ => String::new(),
    }
}
