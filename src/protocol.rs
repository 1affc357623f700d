//! Wire protocol shared by the relay, the agent, and mobile clients.
//!
//! Every frame is exactly one JSON object carried as one WebSocket text
//! message, with a mandatory `type` string. The relay interprets only the
//! pairing control frames; everything else is opaque to it and is routed by
//! `sessionId` alone, which is why the raw-value helpers at the bottom of
//! this module exist alongside the typed catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session ID used by the agent's application-level heartbeat. It never
/// resolves to a live session, so the relay drops heartbeat pings on the
/// floor after resetting its dead-connection timer.
pub const HEARTBEAT_SESSION_ID: &str = "__heartbeat__";

/// Close code for a connection that failed URL classification.
pub const CLOSE_BAD_HANDSHAKE: u16 = 4000;

/// Close code for a mobile that presented an unknown session token.
pub const CLOSE_SESSION_EXPIRED: u16 = 4001;

/// The full frame catalog.
///
/// Tags are snake_case (`agent_register`, `stream_chunk`, ...) and field
/// names are camelCase on the wire (`pairingCode`, `sessionId`, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Agent → Relay: announce identity after the socket opens.
    #[serde(rename_all = "camelCase")]
    AgentRegister { agent_token: String, version: String },

    /// Relay → Agent: registration accepted; carries the stable pairing code.
    #[serde(rename_all = "camelCase")]
    RegisterOk { pairing_code: String },

    /// Mobile → Relay: redeem a pairing code.
    #[serde(rename_all = "camelCase")]
    MobileConnect { pairing_code: String },

    /// Relay → Mobile: pairing succeeded; carries the minted session token.
    #[serde(rename_all = "camelCase")]
    SessionOk { session_token: String },

    /// Mobile → Relay: tear down the session and rotate the pairing code.
    #[serde(rename_all = "camelCase")]
    InvalidatePairing { session_id: String },

    /// Error surfaced to either peer on its own socket.
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },

    /// Mobile → Agent: list repositories accessible to the agent.
    #[serde(rename_all = "camelCase")]
    RepoList { session_id: String },

    /// Mobile → Agent: run the code tool interactively, streaming output.
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        session_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        repo_full_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        branch_name: Option<String>,
    },

    /// Mobile → Agent: run an autonomous task ending in a pull request.
    #[serde(rename_all = "camelCase")]
    TaskStart {
        session_id: String,
        context: String,
        repo_full_name: String,
        base_branch: String,
    },

    /// Application-level keepalive, relayed to the counterparty.
    #[serde(rename_all = "camelCase")]
    Ping { session_id: String },

    /// Reply to an application-level ping.
    #[serde(rename_all = "camelCase")]
    Pong { session_id: String },

    /// Agent → Mobile: repository listing.
    #[serde(rename_all = "camelCase")]
    RepoListResult {
        session_id: String,
        repos: Vec<Repository>,
    },

    /// Agent → Mobile: one chunk of child-process output.
    #[serde(rename_all = "camelCase")]
    StreamChunk { session_id: String, text: String },

    /// Agent → Mobile: the child process exited.
    #[serde(rename_all = "camelCase")]
    StreamEnd { session_id: String },

    /// Agent → Mobile: terminal result of an autonomous task.
    #[serde(rename_all = "camelCase")]
    TaskDone {
        session_id: String,
        pr_url: String,
        pr_title: String,
    },
}

impl Frame {
    /// Serialize to the single-line JSON text carried on the wire.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("frame serialization is infallible")
    }
}

/// Projection of a forge repository sent to the mobile client.
///
/// `description` and `language` serialize as explicit `null` when absent; the
/// mobile stores the shape verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: u64,
    pub full_name: String,
    pub description: Option<String>,
    pub default_branch: String,
    pub language: Option<String>,
    pub private: bool,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Raw-frame helpers for the relay's opaque forwarding path
// ---------------------------------------------------------------------------

/// Read the `type` discriminator of a raw frame, if present.
pub fn frame_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// Read the `sessionId` of a raw frame, if present.
pub fn frame_session_id(value: &Value) -> Option<&str> {
    value.get("sessionId").and_then(Value::as_str)
}

/// Stamp (or overwrite) the `sessionId` of a raw frame.
///
/// The relay calls this on every mobile → agent frame so that a
/// mobile-supplied value can never impersonate another session.
pub fn stamp_session_id(value: &mut Value, session_id: &str) {
    if let Value::Object(map) = value {
        map.insert(
            "sessionId".to_string(),
            Value::String(session_id.to_string()),
        );
    }
}
