//! Agent daemon: relay client + task pipeline.
//!
//! Wires the persistent relay connection to the task pipeline and keeps the
//! operator informed of the pairing code pushed by the relay.

pub mod client;
pub mod forge;
pub mod pipeline;
pub mod workspace;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::agent::client::{FrameHandler, OutboundSink, RelayClient};
use crate::agent::forge::{Forge, GitHubForge};
use crate::agent::pipeline::TaskPipeline;
use crate::agent::workspace::WorkspaceManager;
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::protocol::Frame;

/// Surfaces relay control frames to the operator's terminal. The pairing
/// code printed here is what the mobile operator types in.
struct ControlHandler;

#[async_trait]
impl FrameHandler for ControlHandler {
    async fn handle(&self, frame: &Frame) -> Result<()> {
        match frame {
            Frame::RegisterOk { pairing_code } => {
                info!("Registered with relay");
                println!("Pairing code: {}", pairing_code);
            }
            Frame::Error {
                session_id: None,
                message,
            } => {
                warn!("Relay error: {}", message);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Run the agent daemon until SIGINT/SIGTERM.
pub async fn run(config: AgentConfig) -> Result<()> {
    let tool_binary = resolve_tool_binary(config.tool_binary.as_deref())?;
    info!(tool = %tool_binary.display(), "Using code tool");
    info!(root = %config.workspace_root.display(), "Workspace root");

    let workspace = Arc::new(WorkspaceManager::new(
        config.workspace_root.clone(),
        config.github_token.clone(),
    ));
    let forge: Arc<dyn Forge> = Arc::new(GitHubForge::new(config.github_token.clone()));

    let client = Arc::new(RelayClient::new(
        config.relay_url.clone(),
        config.agent_id.clone(),
    ));
    client.on_frame(Arc::new(ControlHandler));
    let sink: Arc<dyn OutboundSink> = client.clone();
    client.on_frame(Arc::new(TaskPipeline::new(
        workspace,
        forge,
        sink,
        tool_binary,
        config.api_key.clone(),
    )));

    let handle = client.start();
    crate::shutdown_signal().await;

    info!("Shutting down agent");
    client.shutdown();
    let _ = handle.await;
    Ok(())
}

/// Resolve the code-tool binary: explicit override, then `PATH`, then
/// well-known install locations.
pub fn resolve_tool_binary(configured: Option<&str>) -> Result<PathBuf> {
    if let Some(configured) = configured {
        let path = PathBuf::from(configured);
        if path.exists() {
            return Ok(path);
        }
        return Err(Error::Config(format!(
            "Configured tool binary '{}' does not exist",
            configured
        )));
    }

    if let Ok(output) = std::process::Command::new("which").arg("claude").output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
    }

    let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let candidates = [
        home.join(".claude").join("local").join("claude"),
        PathBuf::from("/usr/local/bin/claude"),
        PathBuf::from("/opt/homebrew/bin/claude"),
    ];
    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.clone());
        }
    }

    Err(Error::Config(
        "Claude Code CLI not found. Install it, or set tool_binary in the agent store."
            .to_string(),
    ))
}
