use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use steward_events::{UNKNOWN_TOOL_NAME, UNNAMED_STEP};
use steward_protocol::{CanonicalEvent, EventStatus};
use tracing::debug;

/// What the `running` event told us about an id.
#[derive(Debug, Clone)]
struct Started {
    at: DateTime<Utc>,
    name: String,
    arguments: Option<Value>,
}

#[derive(Debug, Clone)]
enum Lifecycle {
    Running(Started),
    Completed,
}

/// Enforces running → completed, at most one completed, per `(kind, id)`.
#[derive(Debug, Default)]
pub(crate) struct LifecycleLedger {
    entries: HashMap<(String, String), Lifecycle>,
}

impl LifecycleLedger {
    /// Returns the event to deliver, or `None` when it would break the
    /// lifecycle. A completion inherits the recorded start instant, and the
    /// name and arguments when its own are placeholders.
    pub(crate) fn admit(&mut self, mut event: CanonicalEvent) -> Option<CanonicalEvent> {
        let (id, status) = match event.lifecycle() {
            Some((id, status)) => (id.to_owned(), status),
            None => return Some(event),
        };
        let key = (event.kind_name().to_owned(), id);

        match (self.entries.get(&key).cloned(), status) {
            (None, EventStatus::Running) => {
                if let Some(started) = started(&event) {
                    self.entries.insert(key, Lifecycle::Running(started));
                }
                Some(event)
            }
            (None, EventStatus::Completed) => {
                self.entries.insert(key, Lifecycle::Completed);
                Some(event)
            }
            (Some(Lifecycle::Running(started)), EventStatus::Completed) => {
                self.entries.insert(key, Lifecycle::Completed);
                inherit(&mut event, started);
                Some(event)
            }
            (Some(previous), _) => {
                debug!(
                    kind = %key.0,
                    id = %key.1,
                    previous = ?previous,
                    status = ?status,
                    "dropping out-of-order lifecycle event"
                );
                None
            }
        }
    }
}

fn started(event: &CanonicalEvent) -> Option<Started> {
    match event {
        CanonicalEvent::ToolCall(call) => Some(Started {
            at: call.started_at,
            name: call.name.clone(),
            arguments: Some(call.arguments.clone()),
        }),
        CanonicalEvent::Step(step) => Some(Started {
            at: step.started_at,
            name: step.name.clone(),
            arguments: None,
        }),
        _ => None,
    }
}

fn inherit(event: &mut CanonicalEvent, started: Started) {
    match event {
        CanonicalEvent::ToolCall(call) => {
            call.started_at = started.at;
            if call.name == UNKNOWN_TOOL_NAME {
                call.name = started.name;
            }
            let no_arguments = call.arguments.as_object().is_some_and(|args| args.is_empty());
            if let Some(arguments) = started.arguments.filter(|_| no_arguments) {
                call.arguments = arguments;
            }
        }
        CanonicalEvent::Step(step) => {
            step.started_at = started.at;
            if step.name == UNNAMED_STEP {
                step.name = started.name;
            }
        }
        _ => {}
    }
}
