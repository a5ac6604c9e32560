use std::time::Duration;

use indexmap::IndexSet;
use steward_policy::SessionBudget;
use steward_protocol::{CanonicalEvent, StreamError, StreamResult};

use crate::retry::RetryPolicy;

/// Matches every canonical kind when present in the allow-list.
pub const ALLOW_ALL_EVENT_KINDS: &str = "*";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub budget: SessionBudget,
    pub stream_overall_timeout: Duration,
    pub allowed_event_kinds: IndexSet<String>,
    pub retry: RetryPolicy,
}

impl RuntimeConfig {
    pub const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 300;

    pub fn new() -> Self {
        Self {
            budget: SessionBudget::default(),
            stream_overall_timeout: Duration::from_secs(Self::DEFAULT_STREAM_TIMEOUT_SECS),
            allowed_event_kinds: Self::default_allowed_event_kinds(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn default_allowed_event_kinds() -> IndexSet<String> {
        [
            CanonicalEvent::TOOL_CALL,
            CanonicalEvent::STEP,
            CanonicalEvent::MESSAGE_COMPLETE,
        ]
        .into_iter()
        .map(str::to_owned)
        .collect()
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.stream_overall_timeout.is_zero() {
            return Err(StreamError::Validation(
                "stream_overall_timeout_seconds must be >= 1".to_owned(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(StreamError::Validation(
                "retry max_attempts must be >= 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Terminal events and final answers always pass so a stream never
    /// ends silently.
    pub fn allows(&self, event: &CanonicalEvent) -> bool {
        event.is_terminal()
            || matches!(event, CanonicalEvent::MessageComplete(_))
            || self.allowed_event_kinds.contains(ALLOW_ALL_EVENT_KINDS)
            || self.allowed_event_kinds.contains(event.kind_name())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
