//! Scripted in-process engine for orchestrator tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use steward_protocol::{
    ExecutionEngine, ExecutionRequest, RawEvent, RawEventKind, RawEventStream, StreamError,
    StreamResult,
};

#[derive(Debug, Clone)]
enum Step {
    Event(RawEvent),
    EngineError(String),
    ConnectionLost,
}

/// Replayable engine output, served identically to every open.
#[derive(Debug, Clone, Default)]
pub(crate) struct Script {
    steps: Vec<Step>,
    hang: bool,
}

impl Script {
    /// `count` start/end pairs of a `search` tool.
    pub(crate) fn tool_calls(count: usize) -> Self {
        let mut script = Self::default();
        for n in 0..count {
            let id = format!("c{n}");
            script = script
                .then(
                    RawEvent::new(RawEventKind::ToolInvocationStarted)
                        .with_correlation_id(id.as_str())
                        .with_label("search")
                        .with_payload(json!({"input": {"query": n}})),
                )
                .then(
                    RawEvent::new(RawEventKind::ToolInvocationEnded)
                        .with_correlation_id(id.as_str())
                        .with_label("search")
                        .with_payload(json!({"output": format!("result {n}")})),
                );
        }
        script
    }

    pub(crate) fn then(mut self, event: RawEvent) -> Self {
        self.steps.push(Step::Event(event));
        self
    }

    pub(crate) fn then_answer(self, content: &str) -> Self {
        self.then(
            RawEvent::new(RawEventKind::ModelTurnEnded).with_payload(json!({"content": content})),
        )
    }

    pub(crate) fn then_engine_error(mut self, message: &str) -> Self {
        self.steps.push(Step::EngineError(message.to_owned()));
        self
    }

    pub(crate) fn then_connection_lost(mut self) -> Self {
        self.steps.push(Step::ConnectionLost);
        self
    }

    /// Keep the stream open without yielding after the scripted steps.
    pub(crate) fn then_hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

struct DropProbe(Arc<AtomicUsize>);

impl Drop for DropProbe {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeEngine {
    script: Script,
    failing_opens: u32,
    failing_first_pulls: u32,
    rejection: Option<String>,
    opens: Arc<AtomicU32>,
    drops: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<ExecutionRequest>>>,
}

impl FakeEngine {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            script,
            failing_opens: 0,
            failing_first_pulls: 0,
            rejection: None,
            opens: Arc::default(),
            drops: Arc::default(),
            requests: Arc::default(),
        }
    }

    /// The first `count` opens fail with a connection error.
    pub(crate) fn failing_opens(mut self, count: u32) -> Self {
        self.failing_opens = count;
        self
    }

    /// After the failing opens, the next `count` streams fail on first pull.
    pub(crate) fn failing_first_pulls(mut self, count: u32) -> Self {
        self.failing_first_pulls = count;
        self
    }

    pub(crate) fn rejecting_opens(mut self, message: &str) -> Self {
        self.rejection = Some(message.to_owned());
        self
    }

    pub(crate) fn opens(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.opens)
    }

    /// Number of engine streams released.
    pub(crate) fn drops(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.drops)
    }

    pub(crate) fn requests(&self) -> Arc<Mutex<Vec<ExecutionRequest>>> {
        Arc::clone(&self.requests)
    }
}

#[async_trait]
impl ExecutionEngine for FakeEngine {
    async fn open_execution(&self, request: ExecutionRequest) -> StreamResult<RawEventStream> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().push(request);

        if let Some(message) = &self.rejection {
            return Err(StreamError::Engine(message.clone()));
        }
        if attempt <= self.failing_opens {
            return Err(StreamError::Connection("connection refused".to_owned()));
        }

        let mut items: Vec<StreamResult<RawEvent>> = Vec::new();
        if attempt <= self.failing_opens + self.failing_first_pulls {
            items.push(Err(StreamError::Io("connection reset".to_owned())));
        }
        items.extend(self.script.steps.iter().map(|step| match step {
            Step::Event(event) => Ok(event.clone()),
            Step::EngineError(message) => Err(StreamError::Engine(message.clone())),
            Step::ConnectionLost => Err(StreamError::Io("connection reset by peer".to_owned())),
        }));

        let tail: RawEventStream = if self.script.hang {
            stream::pending().boxed()
        } else {
            stream::empty().boxed()
        };
        let probe = DropProbe(Arc::clone(&self.drops));
        Ok(stream::iter(items)
            .chain(tail)
            .map(move |item| {
                let _probe = &probe;
                item
            })
            .boxed())
    }
}
