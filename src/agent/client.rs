//! Persistent WebSocket client to the relay.
//!
//! Maintains exactly one live connection identified by the agent's stable
//! identity: registers on open, emits an application-level heartbeat every
//! 30s, and reconnects forever on loss with a fixed 5s delay. Nothing is
//! queued across a disconnect — `send_frame` reports false and the caller
//! copes (for the task pipeline that means dropping the frame, by design).

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::protocol::{Frame, HEARTBEAT_SESSION_ID};
use crate::Result;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Subscriber for inbound relay frames. Handlers run sequentially on the
/// receive task in registration order; one handler failing is logged and
/// does not affect the others.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, frame: &Frame) -> Result<()>;
}

/// Narrow outbound seam used by the task pipeline, so pipeline tests can
/// record frames without a live relay.
pub trait OutboundSink: Send + Sync {
    /// Returns false when the socket is not open; the frame is not queued.
    fn send_frame(&self, frame: &Frame) -> bool;
}

/// The agent's connection to one relay URL.
pub struct RelayClient {
    relay_url: String,
    agent_id: String,
    version: String,
    reconnect_delay: Duration,
    outbound: RwLock<Option<mpsc::UnboundedSender<String>>>,
    handlers: RwLock<Vec<Arc<dyn FrameHandler>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RelayClient {
    pub fn new(relay_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self::with_reconnect_delay(relay_url, agent_id, RECONNECT_DELAY)
    }

    /// Create a client with a custom reconnect delay (tests shorten it).
    pub fn with_reconnect_delay(
        relay_url: impl Into<String>,
        agent_id: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            relay_url: relay_url.into(),
            agent_id: agent_id.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            reconnect_delay,
            outbound: RwLock::new(None),
            handlers: RwLock::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Register a handler for inbound frames. Handlers are invoked in
    /// registration order for every parsed frame.
    pub fn on_frame(&self, handler: Arc<dyn FrameHandler>) {
        self.handlers.write().unwrap().push(handler);
    }

    /// True while a socket is open.
    pub fn is_connected(&self) -> bool {
        self.outbound.read().unwrap().is_some()
    }

    /// Spawn the connection loop. Runs until [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run_loop().await })
    }

    /// Stop the connection loop: cancel any pending reconnect and close the
    /// socket with a normal close.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn run_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let url = format!(
                "{}?type=agent&agentToken={}",
                self.relay_url, self.agent_id
            );
            match tokio_tungstenite::connect_async(&url).await {
                Ok((stream, _)) => {
                    info!(relay = %self.relay_url, "Connected to relay");
                    self.run_connection(stream, &mut shutdown_rx).await;
                }
                Err(e) => {
                    warn!("Relay connection failed: {}", e);
                }
            }

            *self.outbound.write().unwrap() = None;
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
        *self.outbound.write().unwrap() = None;
        info!("Relay client stopped");
    }

    /// One connection attempt: register, heartbeat, and read until the
    /// socket drops or shutdown is requested.
    async fn run_connection<S>(
        &self,
        stream: tokio_tungstenite::WebSocketStream<S>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut reader) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.write().unwrap() = Some(out_tx.clone());

        let register = Frame::AgentRegister {
            agent_token: self.agent_id.clone(),
            version: self.version.clone(),
        };
        let _ = out_tx.send(register.to_json());

        // Heartbeat is active iff the socket is open: it lives inside this
        // select loop, so it stops with the connection.
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );

        loop {
            tokio::select! {
                inbound = reader.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch(&text).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("Relay connection closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Relay connection error: {}", e);
                            break;
                        }
                    }
                }
                Some(raw) = out_rx.recv() => {
                    if sink.send(Message::Text(raw)).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    let ping = Frame::Ping {
                        session_id: HEARTBEAT_SESSION_ID.to_string(),
                    };
                    let _ = out_tx.send(ping.to_json());
                }
                _ = shutdown_rx.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        *self.outbound.write().unwrap() = None;
    }

    /// Parse one inbound text frame and invoke every handler in order.
    /// Unparsable frames are dropped.
    async fn dispatch(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping unparsable frame: {}", e);
                return;
            }
        };
        let handlers: Vec<Arc<dyn FrameHandler>> =
            self.handlers.read().unwrap().iter().cloned().collect();
        for handler in handlers {
            if let Err(e) = handler.handle(&frame).await {
                warn!("Frame handler failed: {}", e);
            }
        }
    }
}

impl OutboundSink for RelayClient {
    fn send_frame(&self, frame: &Frame) -> bool {
        match self.outbound.read().unwrap().as_ref() {
            Some(tx) => tx.send(frame.to_json()).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl FrameHandler for Recorder {
        async fn handle(&self, frame: &Frame) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.label, frame.to_json()));
            if self.fail {
                return Err(crate::Error::Relay("boom".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_send_returns_false_when_disconnected() {
        let client = RelayClient::new("ws://127.0.0.1:1/ws", "A1");
        assert!(!client.is_connected());
        assert!(!client.send_frame(&Frame::Ping {
            session_id: HEARTBEAT_SESSION_ID.into()
        }));
    }

    #[tokio::test]
    async fn test_dispatch_runs_handlers_in_registration_order() {
        let client = RelayClient::new("ws://127.0.0.1:1/ws", "A1");
        let log = Arc::new(Mutex::new(Vec::new()));
        client.on_frame(Arc::new(Recorder {
            label: "first",
            log: log.clone(),
            fail: true, // a failing handler must not affect later ones
        }));
        client.on_frame(Arc::new(Recorder {
            label: "second",
            log: log.clone(),
            fail: false,
        }));

        client
            .dispatch(r#"{"type":"register_ok","pairingCode":"482931"}"#)
            .await;

        let entries = log.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].starts_with("first:"));
        assert!(entries[1].starts_with("second:"));
    }

    #[tokio::test]
    async fn test_dispatch_drops_unparsable_frames() {
        let client = RelayClient::new("ws://127.0.0.1:1/ws", "A1");
        let log = Arc::new(Mutex::new(Vec::new()));
        client.on_frame(Arc::new(Recorder {
            label: "only",
            log: log.clone(),
            fail: false,
        }));

        client.dispatch("not json at all").await;
        client.dispatch(r#"{"type":"unknown_kind"}"#).await;
        assert!(log.lock().unwrap().is_empty());
    }

    /// Minimal in-process relay: accepts one socket, captures the first
    /// frame, replies with register_ok, then echoes nothing further.
    async fn fake_relay() -> (String, tokio::sync::oneshot::Receiver<Frame>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (first_tx, first_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let frame: Frame = serde_json::from_str(&text).unwrap();
                let _ = first_tx.send(frame);
            }
            let reply = Frame::RegisterOk {
                pairing_code: "482931".to_string(),
            };
            let _ = ws.send(Message::Text(reply.to_json())).await;
            // Hold the socket open until the client goes away.
            while let Some(Ok(_)) = ws.next().await {}
        });
        (format!("ws://{}", addr), first_rx)
    }

    #[tokio::test]
    async fn test_registers_on_connect_and_dispatches_replies() {
        let (url, first_rx) = fake_relay().await;
        let client = Arc::new(RelayClient::with_reconnect_delay(
            format!("{}/ws", url),
            "A1",
            Duration::from_millis(100),
        ));
        let log = Arc::new(Mutex::new(Vec::new()));
        client.on_frame(Arc::new(Recorder {
            label: "h",
            log: log.clone(),
            fail: false,
        }));

        let handle = client.start();

        // First frame out is agent_register with our identity and version.
        let first = tokio::time::timeout(Duration::from_secs(5), first_rx)
            .await
            .unwrap()
            .unwrap();
        match first {
            Frame::AgentRegister {
                agent_token,
                version,
            } => {
                assert_eq!(agent_token, "A1");
                assert_eq!(version, env!("CARGO_PKG_VERSION"));
            }
            other => panic!("expected agent_register, got {:?}", other),
        }

        // The relay's register_ok reaches the handler.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !log.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler never saw register_ok");
        assert!(log.lock().unwrap()[0].contains("register_ok"));
        assert!(client.is_connected());
        assert!(client.send_frame(&Frame::Ping {
            session_id: HEARTBEAT_SESSION_ID.into()
        }));

        client.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_loss() {
        // First endpoint dies immediately; the client must retry and reach
        // a second accept on the same listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (second_tx, second_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            // First connection: accept and drop straight away.
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
            // Second connection: handshake and signal.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = second_tx.send(());
            while let Some(Ok(_)) = ws.next().await {}
        });

        let client = Arc::new(RelayClient::with_reconnect_delay(
            format!("ws://{}/ws", addr),
            "A1",
            Duration::from_millis(50),
        ));
        let handle = client.start();

        tokio::time::timeout(Duration::from_secs(5), second_rx)
            .await
            .expect("client never reconnected")
            .unwrap();

        client.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}
