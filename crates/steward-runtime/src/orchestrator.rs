use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_stream::stream;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::json;
use steward_events::normalize;
use steward_policy::{GovernedStream, govern};
use steward_protocol::{
    CanonicalEvent, CheckpointStore, ErrorCode, ErrorEvent, EventMetadata, ExecutionEndedEvent,
    ExecutionEngine, ExecutionRequest, RawEvent, RawEventStream, ResumeDecision, SessionConfig, StreamError,
    StreamResult, TaskEvent, TaskId, TaskInput, ThreadId, ThreadState,
};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::RuntimeConfig;
use crate::ledger::LifecycleLedger;
use crate::outcome::{TaskOutcome, drain};
use crate::retry::with_retry;

/// Checkpoint node the human verdict is attributed to on resume.
pub const HUMAN_REVIEW_NODE: &str = "human_review";

/// Lifecycle of one task invocation. Only `Opening` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Idle,
    Opening,
    Streaming,
    Completed,
    Terminated,
    TimedOut,
    Failed,
    Cancelled,
}

impl TaskPhase {
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Idle | Self::Opening | Self::Streaming)
    }
}

/// Tracks the phase of one task and records cancellation when dropped
/// before reaching a final phase.
struct PhaseGuard {
    thread_id: ThreadId,
    task_id: TaskId,
    phase: TaskPhase,
}

impl PhaseGuard {
    fn new(thread_id: ThreadId, task_id: TaskId) -> Self {
        Self {
            thread_id,
            task_id,
            phase: TaskPhase::Idle,
        }
    }

    fn enter(&mut self, phase: TaskPhase) {
        debug!(
            thread_id = %self.thread_id,
            task_id = %self.task_id,
            from = ?self.phase,
            to = ?phase,
            "task phase transition"
        );
        self.phase = phase;
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        if !self.phase.is_final() {
            info!(
                thread_id = %self.thread_id,
                task_id = %self.task_id,
                phase = ?self.phase,
                "task cancelled by consumer"
            );
            self.phase = TaskPhase::Cancelled;
        }
    }
}

/// Lazy, pull-driven sequence of tagged canonical events for one task.
///
/// Dropping it releases the governor and the engine stream.
#[must_use = "streams do nothing unless polled"]
pub struct TaskStream {
    thread_id: ThreadId,
    task_id: TaskId,
    inner: BoxStream<'static, StreamResult<TaskEvent>>,
}

impl TaskStream {
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

impl Stream for TaskStream {
    type Item = StreamResult<TaskEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for TaskStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStream")
            .field("thread_id", &self.thread_id)
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct TaskOrchestrator {
    engine: Arc<dyn ExecutionEngine>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: Arc<RuntimeConfig>,
}

impl TaskOrchestrator {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: RuntimeConfig,
    ) -> StreamResult<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            checkpoints,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    #[instrument(skip_all, fields(thread_id = %thread_id))]
    pub async fn stream_task(
        &self,
        input: impl Into<String>,
        thread_id: ThreadId,
    ) -> StreamResult<TaskStream> {
        let input = input.into();
        if input.trim().is_empty() {
            return Err(StreamError::Validation("input must not be empty".to_owned()));
        }
        validate_thread_id(&thread_id)?;
        self.open_task(thread_id, TaskInput::Message(input)).await
    }

    /// Drain [`Self::stream_task`] into a single outcome.
    pub async fn invoke_task(
        &self,
        input: impl Into<String>,
        thread_id: ThreadId,
    ) -> StreamResult<TaskOutcome> {
        drain(self.stream_task(input, thread_id).await?).await
    }

    /// Record a human verdict on a paused thread and continue it under a
    /// fresh budget.
    #[instrument(skip_all, fields(thread_id = %thread_id, approved = decision.approved))]
    pub async fn resume_task(
        &self,
        thread_id: ThreadId,
        decision: ResumeDecision,
    ) -> StreamResult<TaskStream> {
        validate_thread_id(&thread_id)?;
        let state = self.thread_status(&thread_id).await?;
        if !state.is_awaiting_review() {
            return Err(StreamError::Validation(format!(
                "thread {thread_id} has no pending steps to resume"
            )));
        }

        self.checkpoints
            .update_state(
                &thread_id,
                json!({ HUMAN_REVIEW_NODE: decision }),
                Some(HUMAN_REVIEW_NODE.to_owned()),
            )
            .await?;
        info!(
            pending = ?state.pending_next_steps,
            actor = %decision.actor,
            "human review recorded; resuming thread"
        );
        self.open_task(thread_id, TaskInput::Resume).await
    }

    pub async fn thread_status(&self, thread_id: &ThreadId) -> StreamResult<ThreadState> {
        validate_thread_id(thread_id)?;
        self.checkpoints
            .get_state(thread_id)
            .await?
            .ok_or_else(|| StreamError::NotFound(format!("thread {thread_id}")))
    }

    async fn open_task(&self, thread_id: ThreadId, input: TaskInput) -> StreamResult<TaskStream> {
        let task_id = TaskId::default();
        let timeout_seconds = self.config.stream_overall_timeout.as_secs();
        let deadline = Instant::now() + self.config.stream_overall_timeout;
        let mut guard = PhaseGuard::new(thread_id.clone(), task_id.clone());
        guard.enter(TaskPhase::Opening);

        let request = ExecutionRequest {
            thread_id: thread_id.clone(),
            task_id: task_id.clone(),
            input,
            session: SessionConfig {
                tool_call_limit: self.config.budget.tool_call_limit().get(),
            },
        };
        let engine = Arc::clone(&self.engine);
        let opened = timeout_at(
            deadline,
            with_retry(&self.config.retry, |attempt| {
                handshake(Arc::clone(&engine), request.clone(), attempt)
            }),
        )
        .await;

        let events = match opened {
            Ok(Ok(events)) => events,
            Ok(Err(error)) => {
                guard.enter(TaskPhase::Failed);
                return Err(error);
            }
            Err(_) => {
                warn!(
                    task_id = %task_id,
                    timeout_seconds,
                    "deadline expired during handshake"
                );
                guard.enter(TaskPhase::TimedOut);
                return Err(StreamError::DeadlineExceeded {
                    timeout_seconds,
                    events_delivered: 0,
                });
            }
        };

        guard.enter(TaskPhase::Streaming);
        let governed = govern(events, &self.config.budget);
        let inner = drive(governed, Arc::clone(&self.config), guard, deadline).boxed();
        Ok(TaskStream {
            thread_id,
            task_id,
            inner,
        })
    }
}

fn validate_thread_id(thread_id: &ThreadId) -> StreamResult<()> {
    if thread_id.is_blank() {
        return Err(StreamError::Validation(
            "thread_id must not be empty".to_owned(),
        ));
    }
    Ok(())
}

/// `open_execution` plus the first pull. A connection failure on the first
/// item drops the half-open stream so the attempt can be retried.
async fn handshake(
    engine: Arc<dyn ExecutionEngine>,
    request: ExecutionRequest,
    attempt: u32,
) -> StreamResult<RawEventStream> {
    debug!(task_id = %request.task_id, attempt, "opening execution");
    let mut events = engine.open_execution(request).await?;
    let first: Option<RawEvent> = match events.next().await {
        Some(Ok(event)) => Some(event),
        Some(Err(error)) => return Err(error),
        None => None,
    };
    Ok(stream::iter(first.map(Ok)).chain(events).boxed())
}

fn drive(
    mut events: GovernedStream<RawEventStream>,
    config: Arc<RuntimeConfig>,
    mut guard: PhaseGuard,
    deadline: Instant,
) -> impl Stream<Item = StreamResult<TaskEvent>> + Send + 'static {
    stream! {
        let mut ledger = LifecycleLedger::default();
        let mut tagger = Tagger::new(guard.thread_id.clone(), guard.task_id.clone());
        let timeout_seconds = config.stream_overall_timeout.as_secs();
        let mut answered = false;

        loop {
            let next = match timeout_at(deadline, events.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let events_delivered = tagger.delivered();
                    warn!(
                        task_id = %tagger.task_id,
                        events_delivered,
                        timeout_seconds,
                        "stream exceeded overall timeout"
                    );
                    guard.enter(TaskPhase::TimedOut);
                    drop(events);
                    yield Ok(tagger.tag(CanonicalEvent::Error(ErrorEvent {
                        id: format!("{}-timeout", tagger.task_id),
                        code: ErrorCode::Timeout,
                        message: format!("stream exceeded overall timeout of {timeout_seconds}s"),
                        events_delivered: Some(events_delivered),
                        timeout_seconds: Some(timeout_seconds),
                    })));
                    yield Err(StreamError::DeadlineExceeded {
                        timeout_seconds,
                        events_delivered,
                    });
                    break;
                }
            };

            let raw = match next {
                None => {
                    guard.enter(TaskPhase::Completed);
                    if !answered {
                        let tool_calls = events.budget().count();
                        debug!(
                            task_id = %tagger.task_id,
                            tool_calls,
                            "engine finished without a final answer"
                        );
                        yield Ok(tagger.tag(CanonicalEvent::ExecutionEnded(
                            ExecutionEndedEvent::engine_finished(tool_calls),
                        )));
                    }
                    break;
                }
                Some(Ok(raw)) => raw,
                Some(Err(failure)) => {
                    let code = if failure.is_connection_failure() {
                        ErrorCode::StreamFailure
                    } else {
                        ErrorCode::EngineFailure
                    };
                    error!(
                        task_id = %tagger.task_id,
                        events_delivered = tagger.delivered(),
                        error = %failure,
                        "engine failed mid-stream"
                    );
                    guard.enter(TaskPhase::Failed);
                    drop(events);
                    yield Ok(tagger.tag(CanonicalEvent::Error(ErrorEvent {
                        id: format!("{}-failure", tagger.task_id),
                        code,
                        message: failure.to_string(),
                        events_delivered: Some(tagger.delivered()),
                        timeout_seconds: None,
                    })));
                    break;
                }
            };

            let Some(event) = ledger.admit(normalize(&raw)) else {
                continue;
            };
            if !config.allows(&event) {
                trace!(kind = event.kind_name(), "event kind not allowed; dropped");
                continue;
            }

            let terminal = event.is_terminal();
            if terminal {
                guard.enter(match &event {
                    CanonicalEvent::ExecutionEnded(ended) if ended.is_forced() => {
                        TaskPhase::Terminated
                    }
                    CanonicalEvent::ExecutionEnded(_) => TaskPhase::Completed,
                    _ => TaskPhase::Failed,
                });
            }
            answered |= matches!(event, CanonicalEvent::MessageComplete(_));
            yield Ok(tagger.tag(event));
            if terminal {
                break;
            }
        }
    }
}

struct Tagger {
    thread_id: ThreadId,
    task_id: TaskId,
    sequence: u64,
}

impl Tagger {
    fn new(thread_id: ThreadId, task_id: TaskId) -> Self {
        Self {
            thread_id,
            task_id,
            sequence: 0,
        }
    }

    fn delivered(&self) -> u64 {
        self.sequence
    }

    fn tag(&mut self, event: CanonicalEvent) -> TaskEvent {
        self.sequence += 1;
        TaskEvent {
            event,
            metadata: EventMetadata {
                thread_id: self.thread_id.clone(),
                task_id: self.task_id.clone(),
                sequence: self.sequence,
                emitted_at: Utc::now(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use anyhow::Result;
    use serde_json::json;
    use steward_protocol::{EventStatus, RawEventKind, TerminationReason};

    use super::*;
    use crate::checkpoints::InMemoryCheckpointStore;
    use crate::outcome::TaskStatus;
    use crate::testing::{FakeEngine, Script};

    fn orchestrator(engine: FakeEngine, config: RuntimeConfig) -> TaskOrchestrator {
        TaskOrchestrator::new(
            Arc::new(engine),
            Arc::new(InMemoryCheckpointStore::new()),
            config,
        )
        .expect("valid config")
    }

    fn config_with_limit(limit: u32) -> RuntimeConfig {
        RuntimeConfig {
            budget: steward_policy::SessionBudget::try_from_limit(limit).expect("limit"),
            ..RuntimeConfig::default()
        }
    }

    fn thread() -> ThreadId {
        ThreadId::from_string("thread-1")
    }

    async fn collect(stream: TaskStream) -> Vec<StreamResult<TaskEvent>> {
        stream.collect().await
    }

    fn kinds(events: &[StreamResult<TaskEvent>]) -> Vec<String> {
        events
            .iter()
            .map(|item| match item {
                Ok(event) => event.kind_name().to_owned(),
                Err(error) => format!("err:{error}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn limit_reached_still_delivers_final_answer() -> Result<()> {
        let engine = FakeEngine::new(Script::tool_calls(3).then_answer("all done"));
        let drops = engine.drops();
        let orchestrator = orchestrator(engine, config_with_limit(3));

        let outcome = orchestrator.invoke_task("research", thread()).await?;

        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.content.as_deref(), Some("all done"));
        assert_eq!(outcome.tool_calls.len(), 3);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn exceeding_limit_ends_with_single_termination_and_one_close() -> Result<()> {
        let engine = FakeEngine::new(Script::tool_calls(5).then_answer("never"));
        let drops = engine.drops();
        let orchestrator = orchestrator(engine, config_with_limit(2));

        let events = collect(orchestrator.stream_task("research", thread()).await?).await;
        let events = events.into_iter().collect::<Result<Vec<_>, _>>()?;

        let last = events.last().expect("termination");
        let CanonicalEvent::ExecutionEnded(ended) = &last.event else {
            panic!("expected execution_ended, got {}", last.kind_name());
        };
        assert_eq!(ended.tool_calls, 2);
        assert_eq!(ended.reason, TerminationReason::ToolCallLimitExceeded);
        assert_eq!(
            events
                .iter()
                .filter(|event| event.kind_name() == CanonicalEvent::EXECUTION_ENDED)
                .count(),
            1
        );
        assert!(
            events
                .iter()
                .all(|event| event.kind_name() != CanonicalEvent::MESSAGE_COMPLETE)
        );
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn termination_maps_to_terminated_outcome() -> Result<()> {
        let engine = FakeEngine::new(Script::tool_calls(4));
        let orchestrator = orchestrator(engine, config_with_limit(1));

        let outcome = orchestrator.invoke_task("research", thread()).await?;
        assert_eq!(
            outcome.status,
            TaskStatus::Terminated {
                reason: TerminationReason::ToolCallLimitExceeded,
                tool_calls: 1,
            }
        );
        assert!(outcome.content.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn sequence_and_correlation_tags_cover_every_event() -> Result<()> {
        let engine = FakeEngine::new(Script::tool_calls(2).then_answer("ok"));
        let orchestrator = orchestrator(engine, RuntimeConfig::default());

        let stream = orchestrator.stream_task("go", thread()).await?;
        let task_id = stream.task_id().clone();
        let events = collect(stream).await.into_iter().collect::<Result<Vec<_>, _>>()?;

        for (index, event) in events.iter().enumerate() {
            assert_eq!(event.metadata.sequence, index as u64 + 1);
            assert_eq!(event.metadata.thread_id, thread());
            assert_eq!(event.metadata.task_id, task_id);
        }
        Ok(())
    }

    #[tokio::test]
    async fn running_precedes_completed_for_each_tool_call() -> Result<()> {
        let engine = FakeEngine::new(Script::tool_calls(3).then_answer("ok"));
        let orchestrator = orchestrator(engine, RuntimeConfig::default());
        let events = collect(orchestrator.stream_task("go", thread()).await?).await;

        let mut running = std::collections::HashSet::new();
        for event in events.into_iter().collect::<Result<Vec<_>, _>>()? {
            if let CanonicalEvent::ToolCall(call) = event.event {
                match call.status {
                    EventStatus::Running => assert!(running.insert(call.id)),
                    EventStatus::Completed => assert!(running.contains(&call.id)),
                }
            }
        }
        assert_eq!(running.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn blank_input_is_rejected_without_engine_contact() {
        let engine = FakeEngine::new(Script::default());
        let opens = engine.opens();
        let orchestrator = orchestrator(engine, RuntimeConfig::default());

        let empty_input = orchestrator.stream_task("   ", thread()).await;
        let blank_thread = orchestrator
            .stream_task("hello", ThreadId::from_string(" "))
            .await;

        assert!(matches!(empty_input, Err(StreamError::Validation(_))));
        assert!(matches!(blank_thread, Err(StreamError::Validation(_))));
        assert_eq!(opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_retries_connection_failures_without_duplicates() -> Result<()> {
        let engine = FakeEngine::new(Script::tool_calls(1).then_answer("recovered"))
            .failing_opens(2);
        let opens = engine.opens();
        let orchestrator = orchestrator(engine, RuntimeConfig::default());

        let events = collect(orchestrator.stream_task("go", thread()).await?).await;
        let events = events.into_iter().collect::<Result<Vec<_>, _>>()?;

        assert_eq!(opens.load(Ordering::SeqCst), 3);
        let kinds: Vec<_> = events.iter().map(TaskEvent::kind_name).collect();
        assert_eq!(kinds, vec!["tool_call", "tool_call", "message_complete"]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn connection_failure_on_first_pull_is_retried() -> Result<()> {
        let engine = FakeEngine::new(Script::default().then_answer("ok")).failing_first_pulls(1);
        let opens = engine.opens();
        let drops = engine.drops();
        let orchestrator = orchestrator(engine, RuntimeConfig::default());

        let outcome = orchestrator.invoke_task("go", thread()).await?;
        assert_eq!(outcome.content.as_deref(), Some("ok"));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        // The half-open first attempt and the completed second one.
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_handshake_surfaces_streaming_failure() {
        let engine = FakeEngine::new(Script::default()).failing_opens(10);
        let opens = engine.opens();
        let orchestrator = orchestrator(engine, RuntimeConfig::default());

        let result = orchestrator.stream_task("go", thread()).await;
        assert!(matches!(
            result,
            Err(StreamError::StreamingFailed { attempts: 3, .. })
        ));
        assert_eq!(opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_connection_open_error_is_not_retried() {
        let engine = FakeEngine::new(Script::default()).rejecting_opens("bad credentials");
        let opens = engine.opens();
        let orchestrator = orchestrator(engine, RuntimeConfig::default());

        let result = orchestrator.stream_task("go", thread()).await;
        assert!(matches!(result, Err(StreamError::Engine(_))));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_yields_one_timeout_event_then_error() -> Result<()> {
        let engine = FakeEngine::new(Script::tool_calls(1).then_hang());
        let drops = engine.drops();
        let config = RuntimeConfig {
            stream_overall_timeout: Duration::from_secs(5),
            ..RuntimeConfig::default()
        };
        let orchestrator = orchestrator(engine, config);

        let events = collect(orchestrator.stream_task("go", thread()).await?).await;

        assert_eq!(
            kinds(&events),
            vec![
                "tool_call".to_owned(),
                "tool_call".to_owned(),
                "error".to_owned(),
                "err:stream exceeded overall timeout of 5s after 2 events".to_owned(),
            ]
        );
        let Some(Ok(TaskEvent {
            event: CanonicalEvent::Error(timeout),
            ..
        })) = events.get(2)
        else {
            panic!("expected timeout event");
        };
        assert_eq!(timeout.code, ErrorCode::Timeout);
        assert_eq!(timeout.events_delivered, Some(2));
        assert_eq!(timeout.timeout_seconds, Some(5));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_during_handshake_is_a_single_error() {
        let engine = FakeEngine::new(Script::default()).failing_opens(10);
        let config = RuntimeConfig {
            stream_overall_timeout: Duration::from_secs(3),
            ..RuntimeConfig::default()
        };
        let orchestrator = orchestrator(engine, config);

        let result = orchestrator.stream_task("go", thread()).await;
        assert!(matches!(
            result,
            Err(StreamError::DeadlineExceeded {
                timeout_seconds: 3,
                events_delivered: 0
            })
        ));
    }

    #[tokio::test]
    async fn invoke_surfaces_deadline_as_error() {
        let engine = FakeEngine::new(Script::default().then_hang());
        let config = RuntimeConfig {
            stream_overall_timeout: Duration::from_millis(20),
            ..RuntimeConfig::default()
        };
        let orchestrator = orchestrator(engine, config);

        let result = orchestrator.invoke_task("go", thread()).await;
        assert!(matches!(result, Err(StreamError::DeadlineExceeded { .. })));
    }

    #[tokio::test]
    async fn allow_list_drops_unlisted_kinds_but_keeps_final_answer() -> Result<()> {
        let script = Script::default()
            .then(RawEvent::new("model-token").with_payload(json!({"token": "h"})))
            .then(
                RawEvent::new(RawEventKind::PhaseStarted)
                    .with_correlation_id("plan")
                    .with_label("planner"),
            )
            .then_answer("hi");
        let engine = FakeEngine::new(script);
        let config = RuntimeConfig {
            allowed_event_kinds: ["model-token".to_owned()].into_iter().collect(),
            ..RuntimeConfig::default()
        };
        let orchestrator = orchestrator(engine, config);

        let events = collect(orchestrator.stream_task("go", thread()).await?).await;
        assert_eq!(kinds(&events), vec!["model-token", "message_complete"]);
        Ok(())
    }

    #[tokio::test]
    async fn engine_ending_without_answer_closes_with_execution_ended() -> Result<()> {
        let engine = FakeEngine::new(Script::tool_calls(1));
        let orchestrator = orchestrator(engine, RuntimeConfig::default());

        let events = collect(orchestrator.stream_task("go", thread()).await?).await;
        let events = events.into_iter().collect::<Result<Vec<_>, _>>()?;
        let kinds: Vec<_> = events.iter().map(TaskEvent::kind_name).collect();
        assert_eq!(kinds, vec!["tool_call", "tool_call", "execution_ended"]);

        let last = events.last().expect("closing event");
        assert!(last.event.is_terminal());
        let CanonicalEvent::ExecutionEnded(ended) = &last.event else {
            panic!("expected execution_ended, got {}", last.kind_name());
        };
        assert_eq!(ended.reason, TerminationReason::EngineFinished);
        assert_eq!(ended.tool_calls, 1);

        let outcome = orchestrator_with(FakeEngine::new(Script::tool_calls(1)))
            .invoke_task("go", thread())
            .await?;
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.events_delivered, 3);
        Ok(())
    }

    #[tokio::test]
    async fn answered_stream_gets_no_extra_closing_event() -> Result<()> {
        let engine = FakeEngine::new(Script::default().then_answer("hi"));
        let orchestrator = orchestrator(engine, RuntimeConfig::default());

        let events = collect(orchestrator.stream_task("go", thread()).await?).await;
        assert_eq!(kinds(&events), vec!["message_complete"]);
        Ok(())
    }

    #[tokio::test]
    async fn completed_tool_call_keeps_name_and_arguments_from_start() -> Result<()> {
        let script = Script::default()
            .then(
                RawEvent::new(RawEventKind::ToolInvocationStarted)
                    .with_correlation_id("c1")
                    .with_label("search")
                    .with_payload(json!({"input": {"q": "rust"}})),
            )
            .then(
                RawEvent::new(RawEventKind::ToolInvocationEnded)
                    .with_correlation_id("c1")
                    .with_payload(json!({"output": "hit"})),
            )
            .then_answer("done");
        let orchestrator = orchestrator(FakeEngine::new(script), RuntimeConfig::default());

        let outcome = orchestrator.invoke_task("go", thread()).await?;
        assert_eq!(outcome.tool_calls.len(), 1);
        let call = &outcome.tool_calls[0];
        assert_eq!(call.name, "search");
        assert_eq!(call.arguments, json!({"q": "rust"}));
        assert_eq!(call.result, Some(json!("hit")));
        Ok(())
    }

    #[tokio::test]
    async fn connection_lost_mid_stream_surfaces_as_connection_error() -> Result<()> {
        let engine = FakeEngine::new(Script::tool_calls(1).then_connection_lost());
        let orchestrator = orchestrator(engine, RuntimeConfig::default());

        let events = collect(orchestrator.stream_task("go", thread()).await?).await;
        let events = events.into_iter().collect::<Result<Vec<_>, _>>()?;
        let Some(CanonicalEvent::Error(failure)) = events.last().map(|event| &event.event) else {
            panic!("expected error event");
        };
        assert_eq!(failure.code, ErrorCode::StreamFailure);

        let result = orchestrator_with(FakeEngine::new(Script::tool_calls(1).then_connection_lost()))
            .invoke_task("go", thread())
            .await;
        assert!(matches!(result, Err(StreamError::Connection(_))));
        assert!(result.is_err_and(|error| error.is_connection_failure()));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_kinds_pass_through_with_wildcard() -> Result<()> {
        let raw = RawEvent::new("custom-telemetry").with_payload(json!({"cpu": 0.5}));
        let engine = FakeEngine::new(Script::default().then(raw.clone()));
        let config = RuntimeConfig {
            allowed_event_kinds: ["*".to_owned()].into_iter().collect(),
            ..RuntimeConfig::default()
        };
        let orchestrator = orchestrator(engine, config);

        let events = collect(orchestrator.stream_task("go", thread()).await?).await;
        let Some(Ok(TaskEvent {
            event: CanonicalEvent::Passthrough(forwarded),
            ..
        })) = events.first()
        else {
            panic!("expected passthrough");
        };
        assert_eq!(forwarded, &raw);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_lifecycle_events_are_dropped() -> Result<()> {
        let start = RawEvent::new(RawEventKind::ToolInvocationStarted)
            .with_correlation_id("c1")
            .with_label("search");
        let end = RawEvent::new(RawEventKind::ToolInvocationEnded)
            .with_correlation_id("c1")
            .with_label("search");
        let script = Script::default()
            .then(start)
            .then(end.clone())
            .then(end)
            .then_answer("ok");
        let orchestrator = orchestrator(FakeEngine::new(script), RuntimeConfig::default());

        let events = collect(orchestrator.stream_task("go", thread()).await?).await;
        assert_eq!(
            kinds(&events),
            vec!["tool_call", "tool_call", "message_complete"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn mid_stream_engine_failure_ends_with_error_event() -> Result<()> {
        let engine = FakeEngine::new(Script::tool_calls(1).then_engine_error("tool crashed"));
        let drops = engine.drops();
        let orchestrator = orchestrator(engine, RuntimeConfig::default());

        let stream = orchestrator.stream_task("go", thread()).await?;
        let events = collect(stream).await.into_iter().collect::<Result<Vec<_>, _>>()?;

        let last = events.last().expect("error event");
        let CanonicalEvent::Error(failure) = &last.event else {
            panic!("expected error event");
        };
        assert_eq!(failure.code, ErrorCode::EngineFailure);
        assert_eq!(events.len(), 3);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let engine = FakeEngine::new(Script::tool_calls(1).then_engine_error("tool crashed"));
        let result = orchestrator_with(engine).invoke_task("go", thread()).await;
        assert!(matches!(result, Err(StreamError::Engine(message)) if message.contains("tool crashed")));
        Ok(())
    }

    fn orchestrator_with(engine: FakeEngine) -> TaskOrchestrator {
        orchestrator(engine, RuntimeConfig::default())
    }

    #[tokio::test]
    async fn dropping_stream_closes_engine_once() -> Result<()> {
        let engine = FakeEngine::new(Script::tool_calls(3).then_hang());
        let drops = engine.drops();
        let orchestrator = orchestrator(engine, RuntimeConfig::default());

        let mut stream = orchestrator.stream_task("go", thread()).await?;
        assert!(stream.next().await.is_some());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(stream);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_tasks_keep_independent_budgets() -> Result<()> {
        let orchestrator = orchestrator(
            FakeEngine::new(Script::tool_calls(2).then_answer("ok")),
            config_with_limit(2),
        );
        let (first, second) = tokio::join!(
            orchestrator.invoke_task("a", ThreadId::from_string("t-a")),
            orchestrator.invoke_task("b", ThreadId::from_string("t-b")),
        );
        assert_eq!(first?.status, TaskStatus::Completed);
        assert_eq!(second?.status, TaskStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn resume_records_decision_and_opens_fresh_invocation() -> Result<()> {
        let engine = FakeEngine::new(Script::tool_calls(1).then_answer("approved draft"));
        let requests = engine.requests();
        let store = Arc::new(InMemoryCheckpointStore::new());
        let orchestrator =
            TaskOrchestrator::new(Arc::new(engine), store.clone(), RuntimeConfig::default())?;
        store
            .put_state(
                &thread(),
                ThreadState {
                    pending_next_steps: vec![HUMAN_REVIEW_NODE.to_owned()],
                    ..ThreadState::default()
                },
            )
            .await?;

        let decision = ResumeDecision {
            approved: true,
            actor: "reviewer@example.com".to_owned(),
            feedback: None,
        };
        let outcome = drain(orchestrator.resume_task(thread(), decision).await?).await?;

        assert_eq!(outcome.content.as_deref(), Some("approved draft"));
        let state = orchestrator.thread_status(&thread()).await?;
        assert_eq!(state.values[HUMAN_REVIEW_NODE]["approved"], true);
        assert_eq!(state.metadata["last_writer"], HUMAN_REVIEW_NODE);
        let recorded = requests.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].input, TaskInput::Resume);
        Ok(())
    }

    #[tokio::test]
    async fn resume_requires_pending_review() -> Result<()> {
        let engine = FakeEngine::new(Script::default());
        let opens = engine.opens();
        let store = Arc::new(InMemoryCheckpointStore::new());
        let orchestrator =
            TaskOrchestrator::new(Arc::new(engine), store.clone(), RuntimeConfig::default())?;
        let decision = ResumeDecision {
            approved: false,
            actor: "reviewer".to_owned(),
            feedback: Some("needs sources".to_owned()),
        };

        let missing = orchestrator.resume_task(thread(), decision.clone()).await;
        assert!(matches!(missing, Err(StreamError::NotFound(_))));

        store.put_state(&thread(), ThreadState::default()).await?;
        let idle = orchestrator.resume_task(thread(), decision).await;
        assert!(matches!(idle, Err(StreamError::Validation(_))));
        assert_eq!(opens.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn engine_receives_session_limit() -> Result<()> {
        let engine = FakeEngine::new(Script::default().then_answer("ok"));
        let requests = engine.requests();
        let orchestrator = orchestrator(engine, config_with_limit(4));

        orchestrator.invoke_task("go", thread()).await?;
        let recorded = requests.lock();
        assert_eq!(recorded[0].session.tool_call_limit, 4);
        assert_eq!(recorded[0].input, TaskInput::Message("go".to_owned()));
        Ok(())
    }
}
