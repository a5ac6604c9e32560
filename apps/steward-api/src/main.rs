use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use steward_kernel::{KernelBuilder, Script, StewardKernel};
use steward_protocol::{ResumeDecision, StreamError, TaskEvent, ThreadId, ThreadState};
use steward_runtime::{TaskOutcome, TaskStream};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

mod ws;

#[derive(Debug, Parser)]
#[command(name = "steward-api")]
#[command(about = "Governed agent task streaming API")]
struct Cli {
    #[arg(long, env = "STEWARD_LISTEN", default_value = "127.0.0.1:8787")]
    listen: SocketAddr,
    #[arg(long, env = "STEWARD_TOOL_CALL_LIMIT", default_value_t = 10)]
    tool_call_limit: u32,
    #[arg(long, env = "STEWARD_STREAM_TIMEOUT_SECS", default_value_t = 300)]
    stream_timeout_secs: u64,
    #[arg(
        long,
        env = "STEWARD_ALLOWED_EVENT_KINDS",
        value_delimiter = ',',
        default_value = "tool_call,step,message_complete"
    )]
    allowed_event_kinds: Vec<String>,
    /// JSON engine script; the built-in research script is used when absent.
    #[arg(long, env = "STEWARD_SCRIPT")]
    script: Option<PathBuf>,
    /// Drop thread checkpoints older than this many seconds.
    #[arg(long, env = "STEWARD_CHECKPOINT_TTL_SECS")]
    checkpoint_ttl_secs: Option<u64>,
}

#[derive(Clone)]
struct AppState {
    kernel: StewardKernel,
}

#[derive(Debug, Deserialize)]
struct TaskRequest {
    input: String,
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct ResumeRequest {
    approved: bool,
    actor: Option<String>,
    feedback: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<StreamError> for ApiError {
    fn from(error: StreamError) -> Self {
        let status = match &error {
            StreamError::Validation(_) => StatusCode::BAD_REQUEST,
            StreamError::NotFound(_) => StatusCode::NOT_FOUND,
            StreamError::Connection(_)
            | StreamError::Timeout(_)
            | StreamError::Io(_)
            | StreamError::StreamingFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            StreamError::Engine(_) => StatusCode::BAD_GATEWAY,
            StreamError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let kernel = build_kernel(&cli).await?;

    if let Some(ttl) = cli.checkpoint_ttl_secs {
        spawn_checkpoint_cleanup(kernel.clone(), Duration::from_secs(ttl));
    }

    let app = router(AppState { kernel });
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, "steward-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn build_kernel(cli: &Cli) -> Result<StewardKernel> {
    let mut builder = KernelBuilder::new()
        .tool_call_limit(cli.tool_call_limit)
        .stream_timeout(Duration::from_secs(cli.stream_timeout_secs))
        .allowed_event_kinds(cli.allowed_event_kinds.iter().cloned());
    if let Some(path) = &cli.script {
        builder = builder.script(Script::load(path).await?);
    }
    builder.build()
}

fn spawn_checkpoint_cleanup(kernel: StewardKernel, ttl: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ttl.min(Duration::from_secs(3600)));
        loop {
            interval.tick().await;
            match kernel.cleanup_checkpoints(ttl).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "expired checkpoints removed"),
                Err(error) => warn!(%error, "checkpoint cleanup failed"),
            }
        }
    });
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/tasks/invoke", post(invoke_task))
        .route("/tasks/stream", post(stream_task))
        .route("/tasks/ws", get(task_ws))
        .route("/threads/{thread_id}/status", get(thread_status))
        .route("/threads/{thread_id}/resume", post(resume_thread))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.kernel.config();
    Json(json!({
        "status": "ok",
        "service": "steward-api",
        "tool_call_limit": config.budget.tool_call_limit().get(),
        "stream_timeout_secs": config.stream_overall_timeout.as_secs(),
    }))
}

async fn invoke_task(
    State(state): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> ApiResult<Json<TaskOutcome>> {
    let outcome = state
        .kernel
        .invoke_task(request.input, ThreadId::from(request.thread_id))
        .await?;
    Ok(Json(outcome))
}

async fn stream_task(
    State(state): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let task = state
        .kernel
        .stream_task(request.input, ThreadId::from(request.thread_id))
        .await?;
    Ok(sse_response(task))
}

async fn task_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| ws::handle_task_socket(state.kernel, socket))
}

async fn thread_status(
    Path(thread_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<ThreadState>> {
    let status = state
        .kernel
        .thread_status(&ThreadId::from(thread_id))
        .await?;
    Ok(Json(status))
}

async fn resume_thread(
    Path(thread_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ResumeRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let decision = ResumeDecision {
        approved: request.approved,
        actor: request.actor.unwrap_or_else(|| "api".to_owned()),
        feedback: request.feedback,
    };
    let task = state
        .kernel
        .resume_task(ThreadId::from(thread_id), decision)
        .await?;
    Ok(sse_response(task))
}

fn sse_response(mut task: TaskStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream! {
        while let Some(item) = task.next().await {
            match item {
                Ok(event) => yield Ok(as_sse_event(&event)),
                Err(error) => {
                    // Already reported to the client as an `error` event.
                    debug!(%error, task_id = %task.task_id(), "task stream ended with error");
                    break;
                }
            }
        }
    };

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn as_sse_event(event: &TaskEvent) -> Event {
    let payload = serde_json::to_string(&event.to_envelope())
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
    Event::default()
        .id(event.metadata.sequence.to_string())
        .event(event.kind_name())
        .data(payload)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
