//! Runtime ports to the external collaborators.
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.
//! - Engine output is a boxed stream (`RawEventStream`); dropping it is how
//!   the pipeline closes the engine sequence.

use crate::error::StreamResult;
use crate::event::RawEvent;
use crate::ids::{TaskId, ThreadId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub type RawEventStream = BoxStream<'static, StreamResult<RawEvent>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum TaskInput {
    /// A new user turn.
    Message(String),
    /// Continue a thread paused for human review.
    Resume,
}

/// Per-invocation session settings handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub tool_call_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub thread_id: ThreadId,
    pub task_id: TaskId,
    pub input: TaskInput,
    pub session: SessionConfig,
}

/// Thread snapshot as persisted by the checkpoint store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    #[serde(default)]
    pub pending_next_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub values: Value,
}

impl ThreadState {
    pub fn is_awaiting_review(&self) -> bool {
        !self.pending_next_steps.is_empty()
    }
}

/// Human verdict applied before resuming a paused thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeDecision {
    pub approved: bool,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Open one execution. Connection-class errors here, or as the first
    /// stream item, are retried by the orchestrator.
    async fn open_execution(&self, request: ExecutionRequest) -> StreamResult<RawEventStream>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_state(&self, thread_id: &ThreadId) -> StreamResult<Option<ThreadState>>;

    async fn put_state(&self, thread_id: &ThreadId, state: ThreadState) -> StreamResult<()>;

    /// Merge `values` into the thread state as if written by `attributed_to`.
    async fn update_state(
        &self,
        thread_id: &ThreadId,
        values: Value,
        attributed_to: Option<String>,
    ) -> StreamResult<()>;

    /// Remove threads whose last checkpoint is older than `age`.
    async fn cleanup_older_than(&self, age: Duration) -> StreamResult<usize>;
}
