//! Agent setup: writes the persisted configuration store.
//!
//! Interactive prompting is deliberately out of scope; every value arrives
//! as a flag (or later via the `POCKETCLAW_*` environment variables). The
//! agent identity is generated once here and kept across re-runs unless the
//! operator explicitly resets it — resetting orphans any pairing code the
//! relay still holds for the old identity.

use std::path::{Path, PathBuf};

use clap::Args;
use uuid::Uuid;

use crate::config::AgentStore;
use crate::error::Result;

#[derive(Debug, Args, Default)]
pub struct SetupArgs {
    /// Relay WebSocket URL, e.g. wss://relay.example.com/ws
    #[arg(long)]
    pub relay_url: Option<String>,

    /// Forge access token used for clones, pushes, and the forge API
    #[arg(long)]
    pub github_token: Option<String>,

    /// Authentication mode to record in the store
    #[arg(long)]
    pub auth_mode: Option<String>,

    /// Optional provider API key forwarded to the code tool
    #[arg(long)]
    pub api_key: Option<String>,

    /// Explicit code-tool binary path
    #[arg(long)]
    pub tool_binary: Option<String>,

    /// Working-copy root directory
    #[arg(long)]
    pub workspace_root: Option<PathBuf>,

    /// Generate a fresh agent identity even if one already exists
    #[arg(long)]
    pub reset_identity: bool,
}

/// Apply `args` over the existing store and persist it.
pub fn run(store_path: &Path, args: SetupArgs) -> Result<()> {
    let mut store = AgentStore::load(store_path)?;

    if store.agent_id.is_none() || args.reset_identity {
        store.agent_id = Some(Uuid::new_v4().to_string());
    }
    if let Some(value) = args.relay_url {
        store.relay_url = Some(value);
    }
    if let Some(value) = args.github_token {
        store.github_token = Some(value);
    }
    if let Some(value) = args.auth_mode {
        store.auth_mode = value;
    }
    if let Some(value) = args.api_key {
        store.api_key = Some(value);
    }
    if let Some(value) = args.tool_binary {
        store.tool_binary = Some(value);
    }
    if let Some(value) = args.workspace_root {
        store.workspace_root = Some(value);
    }

    store.save(store_path)?;
    println!("Configuration written to {}", store_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_generates_identity_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");

        run(
            &path,
            SetupArgs {
                relay_url: Some("wss://r.example/ws".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let first = AgentStore::load(&path).unwrap();
        let id = first.agent_id.clone().expect("identity generated");
        assert!(Uuid::parse_str(&id).is_ok());

        // A second run with different values keeps the identity.
        run(
            &path,
            SetupArgs {
                github_token: Some("ghp_abc".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let second = AgentStore::load(&path).unwrap();
        assert_eq!(second.agent_id.as_deref(), Some(id.as_str()));
        assert_eq!(second.relay_url.as_deref(), Some("wss://r.example/ws"));
        assert_eq!(second.github_token.as_deref(), Some("ghp_abc"));
    }

    #[test]
    fn test_reset_identity_rotates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");

        run(&path, SetupArgs::default()).unwrap();
        let first = AgentStore::load(&path).unwrap().agent_id.unwrap();

        run(
            &path,
            SetupArgs {
                reset_identity: true,
                ..Default::default()
            },
        )
        .unwrap();
        let second = AgentStore::load(&path).unwrap().agent_id.unwrap();
        assert_ne!(first, second);
    }
}
