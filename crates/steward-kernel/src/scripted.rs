//! Deterministic execution engine replaying a scripted event feed.
//!
//! Stands in for a real agent engine in the daemon, the API's default
//! wiring, and integration tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use steward_protocol::{
    CheckpointStore, ExecutionEngine, ExecutionRequest, RawEvent, RawEventKind, RawEventStream,
    StreamError, StreamResult, TaskInput,
};
use steward_runtime::HUMAN_REVIEW_NODE;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedStep {
    pub kind: RawEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Pause before emitting this step.
    #[serde(default)]
    pub delay_ms: u64,
}

impl ScriptedStep {
    pub fn new(kind: impl Into<RawEventKind>) -> Self {
        Self {
            kind: kind.into(),
            correlation_id: None,
            label: None,
            payload: Value::Null,
            delay_ms: 0,
        }
    }

    pub fn correlated(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    fn to_raw(&self) -> RawEvent {
        let mut raw = RawEvent::new(self.kind.clone()).with_payload(self.payload.clone());
        if let Some(id) = &self.correlation_id {
            raw = raw.with_correlation_id(id.as_str());
        }
        if let Some(label) = &self.label {
            raw = raw.with_label(label.as_str());
        }
        raw
    }
}

/// On-disk script: the feed for new messages and an optional feed for
/// resumed threads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub steps: Vec<ScriptedStep>,
    #[serde(default)]
    pub resume: Vec<ScriptedStep>,
    /// Leave each thread awaiting human review after a message run.
    #[serde(default)]
    pub pause_for_review: bool,
}

impl Script {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse engine script")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read engine script {}", path.display()))?;
        Self::from_json(&raw)
    }

    /// A research agent that searches `searches` times, then answers.
    pub fn research(searches: usize) -> Self {
        let mut steps = vec![
            ScriptedStep::new(RawEventKind::PhaseStarted)
                .correlated("plan")
                .labelled("planner"),
            ScriptedStep::new(RawEventKind::PhaseEnded)
                .correlated("plan")
                .labelled("planner")
                .payload(json!({"plan": "search then summarize"})),
        ];
        for n in 1..=searches {
            let id = format!("search-{n}");
            steps.push(
                ScriptedStep::new(RawEventKind::ToolInvocationStarted)
                    .correlated(id.as_str())
                    .labelled("web_search")
                    .payload(json!({"input": {"query": format!("topic part {n}")}})),
            );
            steps.push(
                ScriptedStep::new(RawEventKind::ToolInvocationEnded)
                    .correlated(id.as_str())
                    .labelled("web_search")
                    .payload(json!({"output": format!("{n} relevant sources")})),
            );
        }
        steps.push(ScriptedStep::new(RawEventKind::ModelToken).payload(json!({"token": "Summary"})));
        steps.push(
            ScriptedStep::new(RawEventKind::ModelTurnEnded)
                .payload(json!({"content": "Summary of findings.", "finish_reason": "stop"})),
        );

        Self {
            steps,
            resume: vec![
                ScriptedStep::new(RawEventKind::ModelTurnEnded)
                    .payload(json!({"content": "Review applied.", "finish_reason": "stop"})),
            ],
            pause_for_review: false,
        }
    }

    fn feed(&self, input: &TaskInput) -> &[ScriptedStep] {
        match input {
            TaskInput::Message(_) => &self.steps,
            TaskInput::Resume => &self.resume,
        }
    }
}

pub struct ScriptedEngine {
    script: Script,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            checkpoints: None,
        }
    }

    /// Record thread checkpoints in `store` the way a checkpointing engine
    /// would.
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    async fn checkpoint(&self, request: &ExecutionRequest) -> StreamResult<()> {
        let Some(store) = &self.checkpoints else {
            return Ok(());
        };
        let mut state = store
            .get_state(&request.thread_id)
            .await?
            .unwrap_or_default();
        match &request.input {
            TaskInput::Message(message) => {
                if !state.values.is_object() {
                    state.values = json!({});
                }
                if let Value::Object(values) = &mut state.values {
                    values.insert("last_input".to_owned(), Value::String(message.clone()));
                }
                state.pending_next_steps = if self.script.pause_for_review {
                    vec![HUMAN_REVIEW_NODE.to_owned()]
                } else {
                    Vec::new()
                };
            }
            TaskInput::Resume => state.pending_next_steps.clear(),
        }
        state.last_checkpoint_time = Some(Utc::now());
        store.put_state(&request.thread_id, state).await
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn open_execution(&self, request: ExecutionRequest) -> StreamResult<RawEventStream> {
        self.checkpoint(&request).await?;
        let steps = self.script.feed(&request.input).to_vec();
        debug!(
            task_id = %request.task_id,
            steps = steps.len(),
            tool_call_limit = request.session.tool_call_limit,
            "replaying scripted feed"
        );

        Ok(stream::iter(steps)
            .then(|step| async move {
                if step.delay_ms > 0 {
                    sleep(Duration::from_millis(step.delay_ms)).await;
                }
                Ok::<_, StreamError>(step.to_raw())
            })
            .boxed())
    }
}
