//! WebSocket transport: one task per connection.
//!
//! The client opens with a `start` or `resume` frame, receives envelopes as
//! text frames, and may send `cancel` (or close) at any point.

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use steward_kernel::StewardKernel;
use steward_protocol::{ResumeDecision, StreamError, StreamResult, ThreadId};
use steward_runtime::TaskStream;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Start {
        input: String,
        thread_id: String,
    },
    Resume {
        thread_id: String,
        approved: bool,
        actor: Option<String>,
        feedback: Option<String>,
    },
}

enum Pump {
    Finished,
    Cancelled,
    Disconnected,
}

pub(crate) async fn handle_task_socket(kernel: StewardKernel, mut socket: WebSocket) {
    let Some(frame) = first_frame(&mut socket).await else {
        return;
    };

    let task = match open_task(&kernel, &frame).await {
        Ok(task) => task,
        Err(error) => {
            let frame = json!({ "type": "error", "error": error.to_string() }).to_string();
            let _ = socket.send(Message::Text(frame.into())).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let task_id = task.task_id().clone();
    match pump(&mut socket, task).await {
        Pump::Disconnected => {
            info!(task_id = %task_id, "websocket client disconnected; task dropped");
        }
        Pump::Cancelled => {
            info!(task_id = %task_id, "websocket client cancelled task");
            let _ = socket.send(Message::Close(None)).await;
        }
        Pump::Finished => {
            let _ = socket.send(Message::Close(None)).await;
        }
    }
}

/// Wait for the opening text frame, answering pings on the way.
async fn first_frame(socket: &mut WebSocket) -> Option<String> {
    while let Some(message) = socket.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Ping(payload)) => {
                if socket.send(Message::Pong(payload)).await.is_err() {
                    return None;
                }
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn open_task(kernel: &StewardKernel, frame: &str) -> StreamResult<TaskStream> {
    let frame: ClientFrame = serde_json::from_str(frame)
        .map_err(|error| StreamError::Validation(format!("invalid start frame: {error}")))?;
    match frame {
        ClientFrame::Start { input, thread_id } => {
            kernel.stream_task(input, ThreadId::from(thread_id)).await
        }
        ClientFrame::Resume {
            thread_id,
            approved,
            actor,
            feedback,
        } => {
            let decision = ResumeDecision {
                approved,
                actor: actor.unwrap_or_else(|| "websocket".to_owned()),
                feedback,
            };
            kernel.resume_task(ThreadId::from(thread_id), decision).await
        }
    }
}

/// Forward task events until the task ends or the client goes away. The
/// task stream is dropped on return, closing the engine stream.
async fn pump(socket: &mut WebSocket, mut task: TaskStream) -> Pump {
    loop {
        tokio::select! {
            next = task.next() => match next {
                Some(Ok(event)) => {
                    let payload = serde_json::to_string(&event.to_envelope())
                        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        return Pump::Disconnected;
                    }
                }
                Some(Err(error)) => {
                    debug!(%error, "task stream ended with error");
                    return Pump::Finished;
                }
                None => return Pump::Finished,
            },
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Text(text))) if text.trim().eq_ignore_ascii_case("cancel") => {
                    return Pump::Cancelled;
                }
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        return Pump::Disconnected;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Pump::Disconnected,
                Some(Ok(_)) => {}
            },
        }
    }
}
