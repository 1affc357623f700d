//! Agent configuration management
//!
//! The agent persists a small key/value store as TOML under the user's
//! config directory. Five environment variables override the store so the
//! daemon can run on hosts where no store was ever written (containers, CI):
//!
//! | variable                  | store key        |
//! |---------------------------|------------------|
//! | `POCKETCLAW_AGENT_ID`     | `agent_id`       |
//! | `POCKETCLAW_RELAY_URL`    | `relay_url`      |
//! | `POCKETCLAW_GITHUB_TOKEN` | `github_token`   |
//! | `POCKETCLAW_AUTH_MODE`    | `auth_mode`      |
//! | `POCKETCLAW_API_KEY`      | `api_key`        |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ENV_AGENT_ID: &str = "POCKETCLAW_AGENT_ID";
pub const ENV_RELAY_URL: &str = "POCKETCLAW_RELAY_URL";
pub const ENV_GITHUB_TOKEN: &str = "POCKETCLAW_GITHUB_TOKEN";
pub const ENV_AUTH_MODE: &str = "POCKETCLAW_AUTH_MODE";
pub const ENV_API_KEY: &str = "POCKETCLAW_API_KEY";

fn default_auth_mode() -> String {
    "token".to_string()
}

/// On-disk agent store. All fields optional so a partially written store
/// still parses; validation happens when the daemon resolves its config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentStore {
    /// Stable opaque identity announced to the relay. Generated once at
    /// first setup and never rotated except by operator reset.
    pub agent_id: Option<String>,

    /// WebSocket URL of the relay, e.g. `wss://relay.example.com/ws`.
    pub relay_url: Option<String>,

    /// Forge access token used for clones, pushes, and the forge API.
    pub github_token: Option<String>,

    /// Authentication mode chosen at setup time.
    #[serde(default = "default_auth_mode")]
    pub auth_mode: String,

    /// Optional provider API key forwarded to the code tool's environment.
    pub api_key: Option<String>,

    /// Override for the code-tool binary. When unset the daemon resolves
    /// `claude` from `PATH` and well-known install locations.
    pub tool_binary: Option<String>,

    /// Override for the working-copy root directory.
    pub workspace_root: Option<PathBuf>,
}

impl AgentStore {
    /// Default store path: `<config_dir>/pocketclaw/agent.toml`.
    pub fn default_path() -> PathBuf {
        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pocketclaw")
            .join("agent.toml")
    }

    /// Load the store from `path`. A missing file yields the default store.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse '{}': {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Config(format!(
                "Failed to read '{}': {}",
                path.display(),
                e
            ))),
        }
    }

    /// Persist the store to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize store: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Fully resolved agent configuration, validated for daemon start.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub relay_url: String,
    pub github_token: String,
    pub auth_mode: String,
    pub api_key: Option<String>,
    pub tool_binary: Option<String>,
    pub workspace_root: PathBuf,
}

impl AgentConfig {
    /// Resolve the effective configuration: store, then environment
    /// overrides, then validation of the mandatory fields.
    pub fn resolve(store_path: &Path) -> Result<Self> {
        let store = AgentStore::load(store_path)?;
        Self::from_store(store, |name| std::env::var(name).ok())
    }

    /// Apply `env` overrides to `store` and validate. The environment is
    /// injected as a lookup function so tests never touch process state.
    pub fn from_store(
        store: AgentStore,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let agent_id = env(ENV_AGENT_ID).or(store.agent_id);
        let relay_url = env(ENV_RELAY_URL).or(store.relay_url);
        let github_token = env(ENV_GITHUB_TOKEN).or(store.github_token);
        let auth_mode = env(ENV_AUTH_MODE).unwrap_or(store.auth_mode);
        let api_key = env(ENV_API_KEY).or(store.api_key);

        let (agent_id, relay_url, github_token) = match (agent_id, relay_url, github_token) {
            (Some(agent_id), Some(relay_url), Some(github_token)) => {
                (agent_id, relay_url, github_token)
            }
            (agent_id, relay_url, github_token) => {
                let mut missing = Vec::new();
                if agent_id.is_none() {
                    missing.push("agent_id");
                }
                if relay_url.is_none() {
                    missing.push("relay_url");
                }
                if github_token.is_none() {
                    missing.push("github_token");
                }
                return Err(Error::Config(format!(
                    "Missing required configuration: {}. Run `pocketclaw setup` or set the \
                     POCKETCLAW_* environment variables.",
                    missing.join(", ")
                )));
            }
        };

        let workspace_root = store.workspace_root.unwrap_or_else(default_workspace_root);

        Ok(Self {
            agent_id,
            relay_url,
            github_token,
            auth_mode,
            api_key,
            tool_binary: store.tool_binary,
            workspace_root,
        })
    }

    /// Human-readable rendering with secrets redacted, for `pocketclaw config`.
    pub fn redacted(&self) -> String {
        format!(
            "agent_id       = {}\n\
             relay_url      = {}\n\
             github_token   = {}\n\
             auth_mode      = {}\n\
             api_key        = {}\n\
             tool_binary    = {}\n\
             workspace_root = {}",
            self.agent_id,
            self.relay_url,
            redact(&self.github_token),
            self.auth_mode,
            self.api_key.as_deref().map_or("(unset)".to_string(), redact),
            self.tool_binary.as_deref().unwrap_or("(auto)"),
            self.workspace_root.display(),
        )
    }
}

/// Default working-copy root: `~/.pocketclaw/workspaces`.
pub fn default_workspace_root() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pocketclaw")
        .join("workspaces")
}

fn redact(secret: &str) -> String {
    if secret.len() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", &secret[..4])
    }
}
