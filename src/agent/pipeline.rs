//! Task execution pipeline.
//!
//! Turns inbound session frames into work: interactive chat invocations of
//! the code tool with byte-level output streaming, autonomous tasks that end
//! in a pushed branch and a pull request, and repository listings. Each
//! request runs as its own task so sessions proceed in parallel; requests
//! touching the same repository serialize on the workspace lock.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::agent::client::{FrameHandler, OutboundSink};
use crate::agent::forge::Forge;
use crate::agent::workspace::WorkspaceManager;
use crate::error::{Error, Result};
use crate::protocol::Frame;

/// Branch namespace for autonomous tasks.
const BRANCH_PREFIX: &str = "claude-mobile";

/// Shared context cloned into each request task.
#[derive(Clone)]
pub(crate) struct PipelineCtx {
    workspace: Arc<WorkspaceManager>,
    forge: Arc<dyn Forge>,
    sink: Arc<dyn OutboundSink>,
    tool_binary: PathBuf,
    api_key: Option<String>,
}

/// Frame handler driving the agent's request execution.
pub struct TaskPipeline {
    ctx: PipelineCtx,
}

impl TaskPipeline {
    pub fn new(
        workspace: Arc<WorkspaceManager>,
        forge: Arc<dyn Forge>,
        sink: Arc<dyn OutboundSink>,
        tool_binary: PathBuf,
        api_key: Option<String>,
    ) -> Self {
        Self {
            ctx: PipelineCtx {
                workspace,
                forge,
                sink,
                tool_binary,
                api_key,
            },
        }
    }
}

#[async_trait]
impl FrameHandler for TaskPipeline {
    async fn handle(&self, frame: &Frame) -> Result<()> {
        match frame {
            Frame::Ping { session_id } => {
                self.ctx.sink.send_frame(&Frame::Pong {
                    session_id: session_id.clone(),
                });
            }
            Frame::RepoList { session_id } => {
                let ctx = self.ctx.clone();
                let session_id = session_id.clone();
                tokio::spawn(run_repo_list(ctx, session_id));
            }
            Frame::ChatMessage {
                session_id,
                text,
                repo_full_name,
                ..
            } => {
                let ctx = self.ctx.clone();
                let session_id = session_id.clone();
                let text = text.clone();
                let repo = repo_full_name.clone();
                tokio::spawn(run_chat(ctx, session_id, text, repo));
            }
            Frame::TaskStart {
                session_id,
                context,
                repo_full_name,
                base_branch,
            } => {
                let ctx = self.ctx.clone();
                let session_id = session_id.clone();
                let context = context.clone();
                let repo = repo_full_name.clone();
                let base = base_branch.clone();
                tokio::spawn(run_task(ctx, session_id, context, repo, base));
            }
            _ => {}
        }
        Ok(())
    }
}

fn emit_error(ctx: &PipelineCtx, session_id: &str, error: &Error) {
    ctx.sink.send_frame(&Frame::Error {
        session_id: Some(session_id.to_string()),
        message: error.to_string(),
    });
}

// ---------------------------------------------------------------------------
// Repository listing
// ---------------------------------------------------------------------------

pub(crate) async fn run_repo_list(ctx: PipelineCtx, session_id: String) {
    match ctx.forge.list_repositories().await {
        Ok(repos) => {
            ctx.sink.send_frame(&Frame::RepoListResult { session_id, repos });
        }
        Err(e) => emit_error(&ctx, &session_id, &e),
    }
}

// ---------------------------------------------------------------------------
// Chat path
// ---------------------------------------------------------------------------

pub(crate) async fn run_chat(
    ctx: PipelineCtx,
    session_id: String,
    text: String,
    repo: Option<String>,
) {
    if let Err(e) = chat_inner(&ctx, &session_id, &text, repo.as_deref()).await {
        emit_error(&ctx, &session_id, &e);
    }
}

async fn chat_inner(
    ctx: &PipelineCtx,
    session_id: &str,
    text: &str,
    repo: Option<&str>,
) -> Result<()> {
    // The tool reads and writes the working copy for as long as it streams,
    // so the repository lock is held until this function returns.
    let _guard = match repo {
        Some(repo) => Some(ctx.workspace.lock(repo).await),
        None => None,
    };
    let workdir = match repo {
        Some(repo) => ctx.workspace.prepare(repo).await?,
        None => std::env::current_dir()?,
    };

    info!(session = session_id, "Running chat invocation");
    stream_tool(ctx, session_id, &workdir, text).await?;
    // The exit code is ignored for chat.
    ctx.sink.send_frame(&Frame::StreamEnd {
        session_id: session_id.to_string(),
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Autonomous task path
// ---------------------------------------------------------------------------

pub(crate) async fn run_task(
    ctx: PipelineCtx,
    session_id: String,
    context: String,
    repo: String,
    base_branch: String,
) {
    if let Err(e) = task_inner(&ctx, &session_id, &context, &repo, &base_branch).await {
        emit_error(&ctx, &session_id, &e);
    }
}

async fn task_inner(
    ctx: &PipelineCtx,
    session_id: &str,
    context: &str,
    repo: &str,
    base_branch: &str,
) -> Result<()> {
    let _guard = ctx.workspace.lock(repo).await;
    let path = ctx.workspace.prepare(repo).await?;

    let branch = task_branch_name(context, Utc::now().timestamp());
    ctx.workspace.create_branch(&path, &branch).await?;
    info!(session = session_id, repo, branch, "Starting autonomous task");
    ctx.sink.send_frame(&Frame::StreamChunk {
        session_id: session_id.to_string(),
        text: format!("Working on branch {}\n", branch),
    });

    let status = stream_tool(ctx, session_id, &path, context).await?;
    if !status.success() {
        let _ = ctx.workspace.checkout(&path, base_branch).await;
        return Err(Error::Tool(format!(
            "Tool exited with {} before completing the task",
            status
        )));
    }

    if !ctx.workspace.has_changes(&path).await? {
        let _ = ctx.workspace.checkout(&path, base_branch).await;
        return Err(Error::Task("No changes to commit".to_string()));
    }

    let summary = task_summary(context);
    let message = format!("{}\n\nAutomated change for a mobile-requested task.", summary);
    ctx.workspace.commit_all(&path, &message).await?;
    if let Err(e) = ctx.workspace.push_branch(&path, &branch).await {
        let _ = ctx.workspace.checkout(&path, base_branch).await;
        return Err(e);
    }
    // Leave the working copy on the base branch so the next refresh
    // fast-forwards cleanly.
    ctx.workspace.checkout(&path, base_branch).await?;

    let body = format!(
        "Automated change for the task:\n\n> {}\n\nBranch `{}` was created from `{}` by the agent.",
        context, branch, base_branch
    );
    let pr = ctx
        .forge
        .create_pull_request(repo, &branch, base_branch, &summary, &body)
        .await?;

    info!(session = session_id, pr = %pr.url, "Task completed");
    ctx.sink.send_frame(&Frame::TaskDone {
        session_id: session_id.to_string(),
        pr_url: pr.url,
        pr_title: pr.title,
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Child-process streaming
// ---------------------------------------------------------------------------

/// Spawn the code tool and forward every stdout/stderr chunk as a
/// `stream_chunk` the moment it is read. The permission flag is mandatory:
/// no TTY is attached, so the tool must never stop for an interactive
/// prompt.
async fn stream_tool(
    ctx: &PipelineCtx,
    session_id: &str,
    workdir: &Path,
    prompt: &str,
) -> Result<std::process::ExitStatus> {
    let mut cmd = Command::new(&ctx.tool_binary);
    cmd.arg("--dangerously-skip-permissions")
        .arg("-p")
        .arg(prompt)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(key) = &ctx.api_key {
        cmd.env("ANTHROPIC_API_KEY", key);
    }

    let mut child = cmd.spawn().map_err(|e| {
        Error::Tool(format!(
            "Failed to spawn '{}': {}",
            ctx.tool_binary.display(),
            e
        ))
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Tool("Tool stdout unavailable".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Tool("Tool stderr unavailable".to_string()))?;

    let out_pump = tokio::spawn(pump(stdout, ctx.sink.clone(), session_id.to_string()));
    let err_pump = tokio::spawn(pump(stderr, ctx.sink.clone(), session_id.to_string()));

    let status = child
        .wait()
        .await
        .map_err(|e| Error::Tool(format!("Failed to wait for tool: {}", e)))?;
    let _ = out_pump.await;
    let _ = err_pump.await;

    debug!(session = session_id, code = ?status.code(), "Tool exited");
    Ok(status)
}

/// Forward raw byte chunks from one child stream. No buffering beyond the
/// OS read size; a session without a live socket simply drops frames.
async fn pump(
    mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    sink: Arc<dyn OutboundSink>,
    session_id: String,
) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                sink.send_frame(&Frame::StreamChunk {
                    session_id: session_id.clone(),
                    text,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Branch naming
// ---------------------------------------------------------------------------

/// `claude-mobile/<slug>-<base36 timestamp>`.
pub fn task_branch_name(context: &str, timestamp: i64) -> String {
    format!(
        "{}/{}-{}",
        BRANCH_PREFIX,
        slugify(context),
        to_base36(timestamp)
    )
}

/// Lowercase, truncate to 50 characters, collapse non-alphanumeric runs to
/// single hyphens, trim stray hyphens.
pub fn slugify(context: &str) -> String {
    let lowered: String = context.to_lowercase().chars().take(50).collect();
    let mut slug = String::with_capacity(lowered.len());
    let mut in_run = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            in_run = false;
        } else if !in_run {
            slug.push('-');
            in_run = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

/// Positive integer in base36, lowercase.
pub fn to_base36(mut n: i64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n <= 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    digits.into_iter().map(char::from).collect()
}

/// One-line task summary used for the commit subject and PR title.
pub fn task_summary(context: &str) -> String {
    let first_line = context.lines().next().unwrap_or("").trim();
    let summary: String = first_line.chars().take(72).collect();
    if summary.is_empty() {
        "Mobile task".to_string()
    } else {
        summary
    }
}
