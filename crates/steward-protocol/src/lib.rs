//! # steward-protocol: contract crate for the governed event pipeline
//!
//! Shared types and trait interfaces every Steward crate depends on. It has
//! no runtime dependency (no tokio, no axum) so engines and stores can
//! implement the ports without pulling in the pipeline.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (ThreadId, TaskId, CorrelationId)
//! - [`event`]: RawEvent / RawEventKind (forward-compatible) and CanonicalEvent
//! - [`envelope`]: TaskEvent, EventMetadata, and the `{kind, data, metadata}` wire shape
//! - [`ports`]: ExecutionEngine and CheckpointStore boundaries
//! - [`error`]: StreamError, StreamResult

pub mod envelope;
pub mod error;
pub mod event;
pub mod ids;
pub mod ports;

pub use envelope::{EventEnvelope, EventMetadata, TaskEvent};
pub use error::{StreamError, StreamResult};
pub use event::{
    CanonicalEvent, ErrorCode, ErrorEvent, EventStatus, ExecutionEndedEvent, ExecutionStatus,
    MessageCompleteEvent, RawEvent, RawEventKind, StepEvent, TerminationReason, ToolCallEvent,
};
pub use ids::{CorrelationId, TaskId, ThreadId};
pub use ports::{
    CheckpointStore, ExecutionEngine, ExecutionRequest, RawEventStream, ResumeDecision,
    SessionConfig, TaskInput, ThreadState,
};
