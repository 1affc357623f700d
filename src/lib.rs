//! Pocketclaw — drive a code-generation CLI on your dev box from your phone.
//!
//! Three actors speak JSON frames over WebSocket:
//!
//! ```text
//!  ┌────────┐        ┌─────────────────┐        ┌──────────────────────┐
//!  │ Mobile │ ──WS── │      Relay      │ ──WS── │        Agent         │
//!  │ client │        │ pairing + mux   │        │ code tool · git · PR │
//!  └────────┘        └─────────────────┘        └──────────────────────┘
//! ```
//!
//! The relay is stateless beyond in-memory tables: it runs the pairing
//! state machine and forwards session-stamped frames between one agent and
//! its mobiles. The agent keeps a persistent connection to the relay and
//! executes chat and autonomous-task requests against local working copies,
//! streaming child-process output back and opening pull requests on the
//! forge for committed work.

pub mod agent;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod setup;

pub use error::{Error, Result};

/// Resolve on SIGINT or, on Unix, SIGTERM.
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
