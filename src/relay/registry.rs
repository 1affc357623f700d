//! In-memory relay registry: agents, pairing codes, and sessions.
//!
//! All lookup tables live behind one mutex and every multi-table operation
//! (register, pair, resume, invalidate, route) runs as a single critical
//! section. The lock is a `std::sync::Mutex` and is never held across an
//! await point: live sockets are represented as unbounded channel senders,
//! so delivery from inside the critical section never blocks.
//!
//! State survives socket loss on purpose. An `AgentEntry` keeps its pairing
//! code while the agent is away, and a `Session` keeps its token while the
//! mobile is away; only explicit invalidation removes either.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{stamp_session_id, Frame};

/// Outbound half of a connection. The per-connection writer task drains the
/// receiving end into the WebSocket sink; dropping the sender closes it.
pub type FrameSender = mpsc::UnboundedSender<String>;

/// One registered agent. The entry outlives the socket so the pairing code
/// stays stable across reconnects.
struct AgentEntry {
    socket: Option<FrameSender>,
    pairing_code: String,
    #[allow(dead_code)]
    connected_at: DateTime<Utc>,
}

/// One paired session. `mobile` is present only while a mobile socket is
/// actively bound to the token.
struct SessionEntry {
    agent_id: String,
    pairing_code: String,
    mobile: Option<FrameSender>,
}

#[derive(Default)]
struct Inner {
    /// AgentIdentity → entry (entry embeds the identity → code inverse).
    agents: HashMap<String, AgentEntry>,
    /// PairingCode → AgentIdentity.
    codes: HashMap<String, String>,
    /// SessionToken → entry (entry embeds token → identity / code / socket).
    sessions: HashMap<String, SessionEntry>,
}

/// Aggregate registry counts exposed for operator diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub registered_agents: usize,
    pub live_agents: usize,
    pub active_sessions: usize,
    pub live_mobiles: usize,
}

/// Outcome of forwarding a stamped mobile frame toward the agent.
#[derive(Debug, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Delivered to the agent's live socket.
    Sent,
    /// The session exists but its agent has no live socket.
    AgentDown,
    /// The session no longer exists (invalidated underneath this socket).
    SessionGone,
}

/// The relay's single logical registry.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    // -----------------------------------------------------------------------
    // Agent side
    // -----------------------------------------------------------------------

    /// Register an agent, displacing any prior socket for the same identity
    /// without touching the pairing code. Returns the code to advertise in
    /// `register_ok` — fresh on first registration, reused afterwards.
    pub fn register_agent(&self, agent_id: &str, socket: FrameSender) -> String {
        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.agents.get_mut(agent_id) {
            entry.socket = Some(socket);
            entry.connected_at = Utc::now();
            return entry.pairing_code.clone();
        }

        let code = generate_pairing_code(&inner.codes);
        inner.codes.insert(code.clone(), agent_id.to_string());
        inner.agents.insert(
            agent_id.to_string(),
            AgentEntry {
                socket: Some(socket),
                pairing_code: code.clone(),
                connected_at: Utc::now(),
            },
        );
        tracing::info!(agent_id, "Agent registered, pairing code issued");
        code
    }

    /// Clear the agent's socket pointer if (and only if) `socket` is still
    /// the one stored. A stale connection closing after a reconnect must not
    /// knock out the replacement.
    pub fn agent_disconnected(&self, agent_id: &str, socket: &FrameSender) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.agents.get_mut(agent_id) {
            if entry
                .socket
                .as_ref()
                .is_some_and(|s| s.same_channel(socket))
            {
                entry.socket = None;
                tracing::info!(agent_id, "Agent socket cleared");
            }
        }
    }

    /// Route an agent-originated frame to the mobile bound to `session_id`.
    /// Returns false when the frame was dropped (no session or no live
    /// mobile socket) — the caller stays silent either way.
    pub fn route_to_mobile(&self, session_id: &str, raw: String) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.sessions.get(session_id) {
            Some(SessionEntry {
                mobile: Some(tx), ..
            }) => tx.send(raw).is_ok(),
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Mobile side
    // -----------------------------------------------------------------------

    /// Redeem a pairing code: mint a session token, record all mappings, and
    /// bind the mobile socket. Returns `None` for an unknown code. Codes are
    /// multi-use; each successful redemption yields a distinct token.
    pub fn pair_mobile(&self, code: &str, socket: FrameSender) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        let agent_id = inner.codes.get(code)?.clone();
        let token = Uuid::new_v4().to_string();
        inner.sessions.insert(
            token.clone(),
            SessionEntry {
                agent_id: agent_id.clone(),
                pairing_code: code.to_string(),
                mobile: Some(socket),
            },
        );
        tracing::info!(agent_id, session = %token, "Mobile paired");
        Some(token)
    }

    /// Re-bind a returning mobile to an existing session. Returns false when
    /// the token was never issued or has been invalidated.
    pub fn resume_mobile(&self, token: &str, socket: FrameSender) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.sessions.get_mut(token) {
            Some(entry) => {
                entry.mobile = Some(socket);
                tracing::info!(session = %token, "Mobile resumed session");
                true
            }
            None => false,
        }
    }

    /// Clear the session's mobile socket pointer if it is still `socket`.
    /// The session itself survives for a later resume.
    pub fn mobile_disconnected(&self, token: &str, socket: &FrameSender) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.sessions.get_mut(token) {
            if entry
                .mobile
                .as_ref()
                .is_some_and(|s| s.same_channel(socket))
            {
                entry.mobile = None;
            }
        }
    }

    /// Stamp the frame with the socket's bound token and deliver it to the
    /// agent. The mobile-supplied `sessionId`, if any, is overwritten.
    pub fn forward_to_agent(
        &self,
        token: &str,
        mut frame: serde_json::Value,
    ) -> ForwardOutcome {
        stamp_session_id(&mut frame, token);
        let inner = self.inner.lock().unwrap();
        let Some(session) = inner.sessions.get(token) else {
            return ForwardOutcome::SessionGone;
        };
        match inner
            .agents
            .get(&session.agent_id)
            .and_then(|a| a.socket.as_ref())
        {
            Some(tx) if tx.send(frame.to_string()).is_ok() => ForwardOutcome::Sent,
            _ => ForwardOutcome::AgentDown,
        }
    }

    /// Tear down session `token` and rotate its originating pairing code.
    ///
    /// Every session derived from the same code is revoked with it. If the
    /// agent is live it receives `register_ok` with the rotated code; if it
    /// is absent, the whole agent entry is dropped and the next registration
    /// starts over with a fresh code.
    ///
    /// Returns true when the token existed.
    pub fn invalidate(&self, token: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(session) = inner.sessions.remove(token) else {
            return false;
        };
        let agent_id = session.agent_id;
        let old_code = session.pairing_code;

        inner
            .sessions
            .retain(|_, entry| entry.pairing_code != old_code);
        inner.codes.remove(&old_code);

        let agent_live = inner
            .agents
            .get(&agent_id)
            .is_some_and(|a| a.socket.is_some());

        if !agent_live {
            inner.agents.remove(&agent_id);
            tracing::info!(agent_id, "Pairing invalidated; absent agent entry dropped");
            return true;
        }

        let new_code = generate_pairing_code(&inner.codes);
        inner.codes.insert(new_code.clone(), agent_id.clone());
        if let Some(entry) = inner.agents.get_mut(&agent_id) {
            entry.pairing_code = new_code.clone();
            if let Some(tx) = &entry.socket {
                let _ = tx.send(
                    Frame::RegisterOk {
                        pairing_code: new_code.clone(),
                    }
                    .to_json(),
                );
            }
        }
        tracing::info!(agent_id, "Pairing invalidated; code rotated");
        true
    }

    // -----------------------------------------------------------------------
    // Introspection (diagnostics endpoint and tests)
    // -----------------------------------------------------------------------

    /// Aggregate counts for the relay's `/status` endpoint.
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().unwrap();
        RegistryStats {
            registered_agents: inner.agents.len(),
            live_agents: inner.agents.values().filter(|a| a.socket.is_some()).count(),
            active_sessions: inner.sessions.len(),
            live_mobiles: inner
                .sessions
                .values()
                .filter(|s| s.mobile.is_some())
                .count(),
        }
    }

    /// Pairing code currently associated with `agent_id`.
    pub fn pairing_code_for(&self, agent_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.agents.get(agent_id).map(|a| a.pairing_code.clone())
    }

    /// Agent identity bound to a session token.
    pub fn agent_for_session(&self, token: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.get(token).map(|s| s.agent_id.clone())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Six decimal digits, uniform, zero-padded, unique among live codes.
fn generate_pairing_code(live: &HashMap<String, String>) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let code = format!("{:06}", rng.gen_range(0..1_000_000u32));
        if !live.contains_key(&code) {
            return code;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel() -> (FrameSender, mpsc::UnboundedReceiver<String>) {
        mpsc::unbounded_channel()
    }

    fn recv_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
        let raw = rx.try_recv().expect("expected a frame");
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn test_pairing_code_format() {
        let registry = Registry::new();
        let (tx, _rx) = channel();
        let code = registry.register_agent("A1", tx);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_happy_path_pairing() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = channel();
        let code = registry.register_agent("A1", agent_tx);

        let (mobile_tx, _mobile_rx) = channel();
        let token = registry.pair_mobile(&code, mobile_tx).expect("pairing");

        // Both directions of the mapping hold.
        assert_eq!(registry.pairing_code_for("A1").as_deref(), Some(code.as_str()));
        assert_eq!(registry.agent_for_session(&token).as_deref(), Some("A1"));
        // The token is a well-formed UUID.
        assert!(Uuid::parse_str(&token).is_ok());
    }

    #[test]
    fn test_unknown_code_rejected() {
        let registry = Registry::new();
        let (tx, _rx) = channel();
        assert!(registry.pair_mobile("000000", tx).is_none());
    }

    #[test]
    fn test_code_stable_across_agent_reconnects() {
        let registry = Registry::new();
        let (tx1, _rx1) = channel();
        let code1 = registry.register_agent("A1", tx1.clone());
        registry.agent_disconnected("A1", &tx1);

        let (tx2, _rx2) = channel();
        let code2 = registry.register_agent("A1", tx2);
        assert_eq!(code1, code2);
    }

    #[test]
    fn test_reregistration_displaces_socket_without_invalidating_code() {
        let registry = Registry::new();
        let (tx1, mut rx1) = channel();
        let code = registry.register_agent("A1", tx1.clone());

        // New connection registers before the old one noticed it was gone.
        let (tx2, mut rx2) = channel();
        let code2 = registry.register_agent("A1", tx2);
        assert_eq!(code, code2);

        // The stale connection's disconnect must not clear the new socket.
        registry.agent_disconnected("A1", &tx1);

        let (mobile_tx, _mobile_rx) = channel();
        let token = registry.pair_mobile(&code, mobile_tx).unwrap();
        let outcome = registry.forward_to_agent(&token, json!({"type": "ping"}));
        assert_eq!(outcome, ForwardOutcome::Sent);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_multi_use_code_yields_distinct_tokens() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = channel();
        let code = registry.register_agent("A1", agent_tx);

        let (m1, _r1) = channel();
        let (m2, _r2) = channel();
        let t1 = registry.pair_mobile(&code, m1).unwrap();
        let t2 = registry.pair_mobile(&code, m2).unwrap();
        assert_ne!(t1, t2);
        assert_eq!(registry.agent_for_session(&t1).as_deref(), Some("A1"));
        assert_eq!(registry.agent_for_session(&t2).as_deref(), Some("A1"));
    }

    #[test]
    fn test_forward_stamps_session_id_over_forged_value() {
        let registry = Registry::new();
        let (agent_tx, mut agent_rx) = channel();
        let code = registry.register_agent("A1", agent_tx);
        let (mobile_tx, _mobile_rx) = channel();
        let token = registry.pair_mobile(&code, mobile_tx).unwrap();

        let forged = json!({"type": "chat_message", "sessionId": "someone-else", "text": "hi"});
        assert_eq!(registry.forward_to_agent(&token, forged), ForwardOutcome::Sent);

        let delivered = recv_frame(&mut agent_rx);
        assert_eq!(delivered["sessionId"], token.as_str());
        assert_eq!(delivered["text"], "hi");
    }

    #[test]
    fn test_forward_reports_agent_down() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = channel();
        let code = registry.register_agent("A1", agent_tx.clone());
        let (mobile_tx, _mobile_rx) = channel();
        let token = registry.pair_mobile(&code, mobile_tx).unwrap();

        registry.agent_disconnected("A1", &agent_tx);
        let outcome = registry.forward_to_agent(&token, json!({"type": "repo_list"}));
        assert_eq!(outcome, ForwardOutcome::AgentDown);
    }

    #[test]
    fn test_route_to_mobile_only_bound_socket() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = channel();
        let code = registry.register_agent("A1", agent_tx);

        let (m1, mut r1) = channel();
        let (m2, mut r2) = channel();
        let t1 = registry.pair_mobile(&code, m1).unwrap();
        let _t2 = registry.pair_mobile(&code, m2).unwrap();

        let frame = json!({"type": "stream_chunk", "sessionId": t1, "text": "a\n"}).to_string();
        assert!(registry.route_to_mobile(&t1, frame));
        assert!(r1.try_recv().is_ok());
        assert!(r2.try_recv().is_err());
    }

    #[test]
    fn test_route_drops_silently_without_live_mobile() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = channel();
        let code = registry.register_agent("A1", agent_tx);
        let (mobile_tx, _mobile_rx) = channel();
        let token = registry.pair_mobile(&code, mobile_tx.clone()).unwrap();

        registry.mobile_disconnected(&token, &mobile_tx);
        assert!(!registry.route_to_mobile(&token, "{}".to_string()));
        // Unknown session: also a silent drop.
        assert!(!registry.route_to_mobile("no-such-session", "{}".to_string()));
    }

    #[test]
    fn test_resume_rebinds_socket() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = channel();
        let code = registry.register_agent("A1", agent_tx);
        let (m1, _r1) = channel();
        let token = registry.pair_mobile(&code, m1.clone()).unwrap();
        registry.mobile_disconnected(&token, &m1);

        let (m2, mut r2) = channel();
        assert!(registry.resume_mobile(&token, m2));
        assert!(registry.route_to_mobile(&token, "{}".to_string()));
        assert!(r2.try_recv().is_ok());
    }

    #[test]
    fn test_resume_unknown_token_fails() {
        let registry = Registry::new();
        let (tx, _rx) = channel();
        assert!(!registry.resume_mobile("never-issued", tx));
    }

    #[test]
    fn test_invalidation_rotates_code_and_notifies_agent() {
        let registry = Registry::new();
        let (agent_tx, mut agent_rx) = channel();
        let code = registry.register_agent("A1", agent_tx);
        let (mobile_tx, _mobile_rx) = channel();
        let token = registry.pair_mobile(&code, mobile_tx).unwrap();

        assert!(registry.invalidate(&token));

        // Old code is dead, session is gone.
        let (m, _r) = channel();
        assert!(registry.pair_mobile(&code, m).is_none());
        assert!(registry.agent_for_session(&token).is_none());

        // The live agent got register_ok with a rotated code.
        let frame = recv_frame(&mut agent_rx);
        assert_eq!(frame["type"], "register_ok");
        let new_code = frame["pairingCode"].as_str().unwrap().to_string();
        assert_ne!(new_code, code);

        // The rotated code pairs.
        let (m2, _r2) = channel();
        assert!(registry.pair_mobile(&new_code, m2).is_some());
    }

    #[test]
    fn test_invalidation_revokes_sibling_sessions() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = channel();
        let code = registry.register_agent("A1", agent_tx);
        let (m1, _r1) = channel();
        let (m2, _r2) = channel();
        let t1 = registry.pair_mobile(&code, m1).unwrap();
        let t2 = registry.pair_mobile(&code, m2).unwrap();

        registry.invalidate(&t1);
        assert!(registry.agent_for_session(&t2).is_none());
        let (m3, _r3) = channel();
        assert!(!registry.resume_mobile(&t2, m3));
    }

    #[test]
    fn test_invalidation_with_absent_agent_drops_entry() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = channel();
        let code = registry.register_agent("A1", agent_tx.clone());
        let (mobile_tx, _mobile_rx) = channel();
        let token = registry.pair_mobile(&code, mobile_tx).unwrap();

        registry.agent_disconnected("A1", &agent_tx);
        assert!(registry.invalidate(&token));
        assert!(registry.pairing_code_for("A1").is_none());

        // Re-registration starts over with a fresh code.
        let (tx2, _rx2) = channel();
        let code2 = registry.register_agent("A1", tx2);
        assert_ne!(code, code2);
    }

    #[test]
    fn test_invalidate_unknown_token_is_noop() {
        let registry = Registry::new();
        assert!(!registry.invalidate("never-issued"));
    }

    #[test]
    fn test_stats_track_lifecycle() {
        let registry = Registry::new();
        assert_eq!(
            registry.stats(),
            RegistryStats {
                registered_agents: 0,
                live_agents: 0,
                active_sessions: 0,
                live_mobiles: 0,
            }
        );

        let (agent_tx, _agent_rx) = channel();
        let code = registry.register_agent("A1", agent_tx.clone());
        let (mobile_tx, _mobile_rx) = channel();
        let token = registry.pair_mobile(&code, mobile_tx.clone()).unwrap();
        assert_eq!(
            registry.stats(),
            RegistryStats {
                registered_agents: 1,
                live_agents: 1,
                active_sessions: 1,
                live_mobiles: 1,
            }
        );

        registry.agent_disconnected("A1", &agent_tx);
        registry.mobile_disconnected(&token, &mobile_tx);
        let stats = registry.stats();
        assert_eq!(stats.registered_agents, 1);
        assert_eq!(stats.live_agents, 0);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.live_mobiles, 0);
    }

    #[test]
    fn test_tokens_unique_across_lifetime() {
        let registry = Registry::new();
        let (agent_tx, _agent_rx) = channel();
        let code = registry.register_agent("A1", agent_tx);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let (m, _r) = channel();
            let token = registry.pair_mobile(&code, m).unwrap();
            assert!(seen.insert(token));
        }
    }
}
