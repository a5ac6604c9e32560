//! Stream orchestrator for governed task executions.
//!
//! [`TaskOrchestrator`] opens one execution per task with handshake retry,
//! wraps the engine stream with the tool-call governor, normalizes and
//! allow-lists events, and tags each delivered event with its thread, task
//! and sequence. The overall deadline covers the handshake and the stream.

mod checkpoints;
mod config;
mod ledger;
mod orchestrator;
mod outcome;
mod retry;
#[cfg(test)]
mod testing;

pub use checkpoints::InMemoryCheckpointStore;
pub use config::{ALLOW_ALL_EVENT_KINDS, RuntimeConfig};
pub use orchestrator::{HUMAN_REVIEW_NODE, TaskOrchestrator, TaskPhase, TaskStream};
pub use outcome::{TaskOutcome, TaskStatus, drain};
pub use retry::RetryPolicy;
