use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures_util::StreamExt;
use steward_kernel::{KernelBuilder, Script, StewardKernel};
use steward_protocol::{ResumeDecision, ThreadId};
use steward_runtime::TaskStream;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "stewardd")]
#[command(about = "Steward governed-stream demo daemon")]
struct Cli {
    #[arg(long, env = "STEWARD_TOOL_CALL_LIMIT", default_value_t = 3)]
    tool_call_limit: u32,
    #[arg(long, env = "STEWARD_STREAM_TIMEOUT_SECS", default_value_t = 30)]
    stream_timeout_secs: u64,
    /// JSON engine script; defaults to a research script with `--searches` tool calls.
    #[arg(long, env = "STEWARD_SCRIPT")]
    script: Option<PathBuf>,
    #[arg(long, default_value_t = 5)]
    searches: usize,
    #[arg(long, default_value = "Summarize recent work on stream governance")]
    input: String,
    #[arg(long, default_value = "demo-thread")]
    thread_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .compact()
        .init();

    let cli = Cli::parse();
    let script = match &cli.script {
        Some(path) => Script::load(path).await?,
        None => Script {
            pause_for_review: true,
            ..Script::research(cli.searches)
        },
    };

    let kernel = KernelBuilder::new()
        .script(script)
        .tool_call_limit(cli.tool_call_limit)
        .stream_timeout(Duration::from_secs(cli.stream_timeout_secs))
        .build()?;
    let thread_id = ThreadId::from(cli.thread_id);

    let task = kernel.stream_task(cli.input, thread_id.clone()).await?;
    info!(thread_id = %thread_id, task_id = %task.task_id(), "task started");
    log_events(task).await;

    match kernel.thread_status(&thread_id).await {
        Ok(state) if state.is_awaiting_review() => {
            info!(pending = ?state.pending_next_steps, "thread awaiting review; approving");
            resume(&kernel, thread_id).await?;
        }
        Ok(_) => info!("thread finished without review"),
        Err(error) => warn!(%error, "thread status unavailable"),
    }

    Ok(())
}

async fn resume(kernel: &StewardKernel, thread_id: ThreadId) -> Result<()> {
    let decision = ResumeDecision {
        approved: true,
        actor: "stewardd".to_owned(),
        feedback: None,
    };
    let task = kernel.resume_task(thread_id, decision).await?;
    info!(task_id = %task.task_id(), "resumed task started");
    log_events(task).await;
    Ok(())
}

async fn log_events(mut task: TaskStream) {
    while let Some(item) = task.next().await {
        match item {
            Ok(event) => {
                let rendered = serde_json::to_string(&event.to_envelope())
                    .unwrap_or_else(|_| "{}".to_owned());
                info!(
                    kind = event.kind_name(),
                    sequence = event.metadata.sequence,
                    envelope = %rendered,
                    "event delivered"
                );
            }
            Err(error) => warn!(%error, "task stream failed"),
        }
    }
}
