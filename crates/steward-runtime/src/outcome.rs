use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use steward_protocol::{
    CanonicalEvent, ErrorCode, EventStatus, StreamError, StreamResult, TaskId, TerminationReason,
    ThreadId, ToolCallEvent,
};

use crate::orchestrator::TaskStream;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Terminated {
        reason: TerminationReason,
        tool_calls: u32,
    },
}

/// Single-response result of a drained task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub thread_id: ThreadId,
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Content of the last completed model turn.
    pub content: Option<String>,
    pub finish_reason: Option<String>,
    pub tool_calls: Vec<ToolCallEvent>,
    pub events_delivered: u64,
}

/// Pull `stream` to its end and fold it into a [`TaskOutcome`].
pub async fn drain(mut stream: TaskStream) -> StreamResult<TaskOutcome> {
    let mut outcome = TaskOutcome {
        thread_id: stream.thread_id().clone(),
        task_id: stream.task_id().clone(),
        status: TaskStatus::Completed,
        content: None,
        finish_reason: None,
        tool_calls: Vec::new(),
        events_delivered: 0,
    };

    while let Some(item) = stream.next().await {
        let tagged = item?;
        outcome.events_delivered = tagged.metadata.sequence;
        match tagged.event {
            CanonicalEvent::ToolCall(call) if call.status == EventStatus::Completed => {
                outcome.tool_calls.push(call);
            }
            CanonicalEvent::MessageComplete(message) => {
                outcome.content = Some(message.content);
                outcome.finish_reason = Some(message.finish_reason);
            }
            CanonicalEvent::ExecutionEnded(ended) if ended.is_forced() => {
                outcome.status = TaskStatus::Terminated {
                    reason: ended.reason,
                    tool_calls: ended.tool_calls,
                };
            }
            CanonicalEvent::Error(error) => match error.code {
                // The deadline error follows on the stream itself.
                ErrorCode::Timeout => {}
                ErrorCode::StreamFailure => return Err(StreamError::Connection(error.message)),
                ErrorCode::EngineFailure => return Err(StreamError::Engine(error.message)),
            },
            _ => {}
        }
    }
    Ok(outcome)
}
