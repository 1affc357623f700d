//! Relay WebSocket server.
//!
//! Terminates every socket, classifies it from the upgrade query string,
//! runs the pairing state machine, and shuttles frames between paired peers.
//! Each connection is one task owning its socket; outbound frames arrive on
//! an unbounded channel registered with the [`Registry`], so no lock is held
//! across socket I/O.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{
    frame_session_id, frame_type, Frame, CLOSE_BAD_HANDSHAKE, CLOSE_SESSION_EXPIRED,
};
use crate::relay::registry::{ForwardOutcome, FrameSender, Registry};
use crate::Result;

/// A socket that produces no frames for this long is considered dead.
const DEAD_CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);

/// A pairing candidate that stays idle this long is closed.
const PAIR_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8790,
        }
    }
}

/// Connection classification derived from the upgrade URL.
#[derive(Debug, PartialEq, Eq)]
enum ClientKind {
    Agent { agent_token: String },
    MobilePairing,
    MobileResume { session_token: String },
}

/// Classify an upgrade request from its query parameters. `None` means the
/// classification is missing or malformed and the socket closes with 4000.
fn classify(params: &HashMap<String, String>) -> Option<ClientKind> {
    match params.get("type").map(String::as_str) {
        Some("agent") => match params.get("agentToken") {
            Some(token) if !token.is_empty() => Some(ClientKind::Agent {
                agent_token: token.clone(),
            }),
            _ => None,
        },
        Some("mobile") => match params.get("sessionToken") {
            Some(token) if !token.is_empty() => Some(ClientKind::MobileResume {
                session_token: token.clone(),
            }),
            _ => Some(ClientKind::MobilePairing),
        },
        _ => None,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: "pocketclaw-relay",
    })
}

/// Operator diagnostics: registry counts.
async fn status_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    Json(registry.stats())
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(registry): State<Arc<Registry>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, params, registry))
}

/// Build the relay router. Exposed for tests that bind an ephemeral port.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/ws", get(ws_upgrade_handler))
        .with_state(registry)
}

/// Serve the relay on an already-bound listener until shutdown.
pub async fn serve_on(listener: TcpListener, registry: Arc<Registry>) -> Result<()> {
    axum::serve(listener, router(registry))
        .await
        .map_err(|e| crate::Error::Relay(format!("Server error: {}", e)))?;
    Ok(())
}

/// Bind and run the relay, exiting cleanly on Ctrl+C / SIGTERM.
pub async fn run(config: RelayConfig) -> Result<()> {
    let registry = Arc::new(Registry::new());
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| crate::Error::Relay(format!("Failed to bind {}: {}", addr, e)))?;
    info!("Relay listening on {}", addr);

    tokio::select! {
        result = serve_on(listener, registry) => result,
        _ = crate::shutdown_signal() => {
            info!("Relay shutting down");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handling
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut ws: WebSocket,
    params: HashMap<String, String>,
    registry: Arc<Registry>,
) {
    match classify(&params) {
        Some(ClientKind::Agent { agent_token }) => {
            handle_agent(ws, agent_token, registry).await;
        }
        Some(ClientKind::MobilePairing) => {
            handle_mobile_pairing(ws, registry).await;
        }
        Some(ClientKind::MobileResume { session_token }) => {
            handle_mobile_resume(ws, session_token, registry).await;
        }
        None => {
            debug!("Rejecting connection with bad handshake parameters");
            close_with(&mut ws, CLOSE_BAD_HANDSHAKE, "bad handshake").await;
        }
    }
}

async fn close_with(ws: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = ws
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })))
        .await;
}

async fn send_frame(ws: &mut WebSocket, frame: &Frame) -> bool {
    ws.send(Message::Text(frame.to_json())).await.is_ok()
}

/// Receive outcome for the socket loops below.
enum Inbound {
    Frame(Value),
    Gone,
}

/// Pull the next parseable text frame; malformed JSON is silently dropped.
/// Returns `Gone` on close, error, or end of stream.
async fn next_frame(ws: &mut WebSocket) -> Inbound {
    loop {
        match ws.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                Ok(value) if value.is_object() => return Inbound::Frame(value),
                _ => continue,
            },
            Some(Ok(Message::Close(_))) | None => return Inbound::Gone,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("WebSocket receive error: {}", e);
                return Inbound::Gone;
            }
        }
    }
}

/// Agent socket: register on `agent_register`, then route session-stamped
/// frames toward their bound mobiles. Silence for 90s closes the socket.
async fn handle_agent(mut ws: WebSocket, url_token: String, registry: Arc<Registry>) {
    let (tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let mut registered_id: Option<String> = None;
    let mut deadline = tokio::time::Instant::now() + DEAD_CONNECTION_TIMEOUT;

    loop {
        tokio::select! {
            inbound = next_frame(&mut ws) => {
                let value = match inbound {
                    Inbound::Frame(v) => v,
                    Inbound::Gone => break,
                };
                deadline = tokio::time::Instant::now() + DEAD_CONNECTION_TIMEOUT;

                if frame_type(&value) == Some("agent_register") {
                    let Ok(Frame::AgentRegister { agent_token, .. }) =
                        serde_json::from_value::<Frame>(value)
                    else {
                        continue;
                    };
                    let code = registry.register_agent(&agent_token, tx.clone());
                    registered_id = Some(agent_token);
                    if !send_frame(&mut ws, &Frame::RegisterOk { pairing_code: code }).await {
                        break;
                    }
                    continue;
                }

                // Everything else routes by sessionId; frames without one
                // (including the heartbeat ping) are dropped here.
                if let Some(session_id) = frame_session_id(&value) {
                    let session_id = session_id.to_string();
                    registry.route_to_mobile(&session_id, value.to_string());
                }
            }
            Some(raw) = out_rx.recv() => {
                if ws.send(Message::Text(raw)).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(agent = ?registered_id, "Agent connection dead, closing");
                close_with(&mut ws, 1000, "connection dead").await;
                break;
            }
        }
    }

    if let Some(agent_id) = registered_id {
        registry.agent_disconnected(&agent_id, &tx);
        info!(agent_id, "Agent connection closed");
    }
}

/// Mobile pairing candidate: wait for `mobile_connect`, mint a session on a
/// known code, then run the paired loop. Invalid codes keep the socket open
/// for retry within the idle bound.
async fn handle_mobile_pairing(mut ws: WebSocket, registry: Arc<Registry>) {
    let (tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let mut deadline = tokio::time::Instant::now() + PAIR_WAIT_TIMEOUT;

    let token = loop {
        tokio::select! {
            inbound = next_frame(&mut ws) => {
                let value = match inbound {
                    Inbound::Frame(v) => v,
                    Inbound::Gone => return,
                };
                deadline = tokio::time::Instant::now() + PAIR_WAIT_TIMEOUT;

                let Ok(Frame::MobileConnect { pairing_code }) =
                    serde_json::from_value::<Frame>(value)
                else {
                    // Only mobile_connect is meaningful before pairing.
                    continue;
                };

                match registry.pair_mobile(&pairing_code, tx.clone()) {
                    Some(token) => {
                        if !send_frame(&mut ws, &Frame::SessionOk {
                            session_token: token.clone(),
                        })
                        .await
                        {
                            registry.mobile_disconnected(&token, &tx);
                            return;
                        }
                        break token;
                    }
                    None => {
                        let rejected = Frame::Error {
                            session_id: None,
                            message: "Invalid or expired pairing code".to_string(),
                        };
                        if !send_frame(&mut ws, &rejected).await {
                            return;
                        }
                    }
                }
            }
            Some(raw) = out_rx.recv() => {
                // Nothing is registered for this socket yet; drain defensively.
                let _ = raw;
            }
            _ = tokio::time::sleep_until(deadline) => {
                debug!("Pairing candidate idle, closing");
                close_with(&mut ws, 1000, "pairing timeout").await;
                return;
            }
        }
    };

    paired_loop(ws, out_rx, tx, token, registry).await;
}

/// Returning mobile: re-bind the socket to an existing session or reject
/// with the expired-session close code.
async fn handle_mobile_resume(mut ws: WebSocket, session_token: String, registry: Arc<Registry>) {
    let (tx, out_rx) = mpsc::unbounded_channel::<String>();

    if !registry.resume_mobile(&session_token, tx.clone()) {
        let expired = Frame::Error {
            session_id: None,
            message: "Session expired — reconnect".to_string(),
        };
        let _ = send_frame(&mut ws, &expired).await;
        close_with(&mut ws, CLOSE_SESSION_EXPIRED, "session expired").await;
        return;
    }

    paired_loop(ws, out_rx, tx, session_token, registry).await;
}

/// PAIRED state: restamp and forward mobile frames to the agent, deliver
/// agent frames pushed onto the outbound channel, intercept
/// `invalidate_pairing`, and enforce the dead-connection timer.
async fn paired_loop(
    mut ws: WebSocket,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    tx: FrameSender,
    token: String,
    registry: Arc<Registry>,
) {
    let mut deadline = tokio::time::Instant::now() + DEAD_CONNECTION_TIMEOUT;

    loop {
        tokio::select! {
            inbound = next_frame(&mut ws) => {
                let value = match inbound {
                    Inbound::Frame(v) => v,
                    Inbound::Gone => break,
                };
                deadline = tokio::time::Instant::now() + DEAD_CONNECTION_TIMEOUT;

                if frame_type(&value) == Some("invalidate_pairing") {
                    registry.invalidate(&token);
                    close_with(&mut ws, 1000, "pairing invalidated").await;
                    break;
                }

                match registry.forward_to_agent(&token, value) {
                    ForwardOutcome::Sent => {}
                    ForwardOutcome::AgentDown => {
                        let offline = Frame::Error {
                            session_id: Some(token.clone()),
                            message: "Agent disconnected".to_string(),
                        };
                        if !send_frame(&mut ws, &offline).await {
                            break;
                        }
                    }
                    ForwardOutcome::SessionGone => {
                        let expired = Frame::Error {
                            session_id: None,
                            message: "Session expired — reconnect".to_string(),
                        };
                        let _ = send_frame(&mut ws, &expired).await;
                        close_with(&mut ws, CLOSE_SESSION_EXPIRED, "session expired").await;
                        break;
                    }
                }
            }
            Some(raw) = out_rx.recv() => {
                if ws.send(Message::Text(raw)).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                debug!(session = %token, "Mobile connection dead, closing");
                close_with(&mut ws, 1000, "connection dead").await;
                break;
            }
        }
    }

    registry.mobile_disconnected(&token, &tx);
    debug!(session = %token, "Mobile connection closed");
}
