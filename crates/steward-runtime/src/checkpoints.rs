use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use steward_protocol::{CheckpointStore, StreamError, StreamResult, ThreadId, ThreadState};
use tracing::debug;

/// Process-local checkpoint store keyed by thread.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    threads: Arc<Mutex<HashMap<ThreadId, ThreadState>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_state(&self, thread_id: &ThreadId) -> StreamResult<Option<ThreadState>> {
        Ok(self.threads.lock().get(thread_id).cloned())
    }

    async fn put_state(&self, thread_id: &ThreadId, mut state: ThreadState) -> StreamResult<()> {
        state.last_checkpoint_time.get_or_insert_with(Utc::now);
        self.threads.lock().insert(thread_id.clone(), state);
        Ok(())
    }

    async fn update_state(
        &self,
        thread_id: &ThreadId,
        values: Value,
        attributed_to: Option<String>,
    ) -> StreamResult<()> {
        let Value::Object(updates) = values else {
            return Err(StreamError::Validation(
                "state update must be a JSON object".to_owned(),
            ));
        };

        let mut threads = self.threads.lock();
        let state = threads
            .get_mut(thread_id)
            .ok_or_else(|| StreamError::NotFound(format!("thread {thread_id}")))?;

        merge_object(&mut state.values, updates);
        if let Some(writer) = attributed_to {
            merge_object(
                &mut state.metadata,
                Map::from_iter([("last_writer".to_owned(), Value::String(writer))]),
            );
        }
        state.last_checkpoint_time = Some(Utc::now());
        Ok(())
    }

    async fn cleanup_older_than(&self, age: Duration) -> StreamResult<usize> {
        let age = chrono::Duration::from_std(age)
            .map_err(|error| StreamError::Validation(format!("cleanup age: {error}")))?;
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return Ok(0);
        };

        let mut threads = self.threads.lock();
        let before = threads.len();
        threads.retain(|_, state| {
            state
                .last_checkpoint_time
                .is_none_or(|checkpointed| checkpointed >= cutoff)
        });
        let removed = before - threads.len();
        if removed > 0 {
            debug!(removed, "expired thread checkpoints removed");
        }
        Ok(removed)
    }
}

fn merge_object(target: &mut Value, updates: Map<String, Value>) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(existing) = target {
        existing.extend(updates);
    }
}
