//! Relay service: WebSocket termination, pairing, and session multiplexing.

pub mod registry;
pub mod server;

pub use registry::{ForwardOutcome, Registry, RegistryStats};
pub use server::{run, RelayConfig};
