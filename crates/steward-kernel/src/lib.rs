mod scripted;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use steward_policy::SessionBudget;
use steward_protocol::{
    CheckpointStore, ExecutionEngine, ResumeDecision, StreamResult, ThreadId, ThreadState,
};
use steward_runtime::{
    InMemoryCheckpointStore, RetryPolicy, RuntimeConfig, TaskOrchestrator, TaskOutcome,
    TaskStream,
};
use tracing::{info, instrument};

pub use scripted::{Script, ScriptedEngine, ScriptedStep};

#[derive(Clone)]
pub struct KernelBuilder {
    engine: Option<Arc<dyn ExecutionEngine>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    script: Option<Script>,
    tool_call_limit: u32,
    stream_timeout: Duration,
    allowed_event_kinds: Vec<String>,
    retry_policy: RetryPolicy,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            engine: None,
            checkpoints: None,
            script: None,
            tool_call_limit: SessionBudget::DEFAULT_TOOL_CALL_LIMIT,
            stream_timeout: Duration::from_secs(RuntimeConfig::DEFAULT_STREAM_TIMEOUT_SECS),
            allowed_event_kinds: RuntimeConfig::default_allowed_event_kinds()
                .into_iter()
                .collect(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Script for the built-in [`ScriptedEngine`], used when no engine is set.
    pub fn script(mut self, script: Script) -> Self {
        self.script = Some(script);
        self
    }

    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn tool_call_limit(mut self, limit: u32) -> Self {
        self.tool_call_limit = limit;
        self
    }

    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn allowed_event_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_event_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn build(self) -> Result<StewardKernel> {
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new()));
        let engine = match self.engine {
            Some(engine) => engine,
            None => Arc::new(
                ScriptedEngine::new(self.script.unwrap_or_else(|| Script::research(3)))
                    .with_checkpoints(Arc::clone(&checkpoints)),
            ),
        };

        let config = RuntimeConfig {
            budget: SessionBudget::try_from_limit(self.tool_call_limit)
                .context("invalid tool call limit")?,
            stream_overall_timeout: self.stream_timeout,
            allowed_event_kinds: self
                .allowed_event_kinds
                .into_iter()
                .map(|kind| kind.trim().to_owned())
                .filter(|kind| !kind.is_empty())
                .collect(),
            retry: self.retry_policy,
        };
        info!(
            tool_call_limit = config.budget.tool_call_limit().get(),
            stream_timeout_secs = config.stream_overall_timeout.as_secs(),
            allowed_event_kinds = ?config.allowed_event_kinds,
            "kernel configured"
        );

        let orchestrator = TaskOrchestrator::new(engine, Arc::clone(&checkpoints), config)
            .context("invalid runtime configuration")?;
        Ok(StewardKernel {
            orchestrator,
            checkpoints,
        })
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct StewardKernel {
    orchestrator: TaskOrchestrator,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl StewardKernel {
    pub fn config(&self) -> &RuntimeConfig {
        self.orchestrator.config()
    }

    #[instrument(skip(self, input), fields(thread_id = %thread_id))]
    pub async fn stream_task(
        &self,
        input: impl Into<String>,
        thread_id: ThreadId,
    ) -> StreamResult<TaskStream> {
        self.orchestrator.stream_task(input, thread_id).await
    }

    #[instrument(skip(self, input), fields(thread_id = %thread_id))]
    pub async fn invoke_task(
        &self,
        input: impl Into<String>,
        thread_id: ThreadId,
    ) -> StreamResult<TaskOutcome> {
        self.orchestrator.invoke_task(input, thread_id).await
    }

    pub async fn resume_task(
        &self,
        thread_id: ThreadId,
        decision: ResumeDecision,
    ) -> StreamResult<TaskStream> {
        self.orchestrator.resume_task(thread_id, decision).await
    }

    pub async fn thread_status(&self, thread_id: &ThreadId) -> StreamResult<ThreadState> {
        self.orchestrator.thread_status(thread_id).await
    }

    /// Drop checkpoints older than `age`; returns how many were removed.
    pub async fn cleanup_checkpoints(&self, age: Duration) -> StreamResult<usize> {
        self.checkpoints.cleanup_older_than(age).await
    }
}
