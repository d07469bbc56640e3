//! ==============================================================================
//! upstream - the single telemetry source the hub listens to
//! ==============================================================================
//!
//! purpose:
//!     defines the capability the relay hub depends on. the hub never opens
//!     sockets or retries connections itself; it only reacts to the lifecycle
//!     and data events a transport hands it, and asks the transport to send
//!     the subscription request after every (re)connect.
//!
//! relationships:
//!     - used by: hub.rs (drives the hub's event loop)
//!     - implemented by: socketio.rs (rust_socketio connector), tests (fake transport)
//!
//! ==============================================================================

pub mod socketio;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::snapshot::RawTelemetry;

pub use socketio::SocketIoTransport;

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Connected,
    Disconnected,
    Data(RawTelemetry),
}

/// Payload of the outbound `subscribe` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeRequest {
    #[serde(rename = "apiKeys")]
    pub api_keys: Vec<String>,
}

impl SubscribeRequest {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_keys: vec![api_key.into()],
        }
    }
}

#[async_trait]
pub trait UpstreamTransport: Send {
    /// Next lifecycle or data event. `None` once the transport has shut down
    /// for good. Must be cancel safe: the hub polls it inside `select!`.
    async fn recv(&mut self) -> Option<UpstreamEvent>;

    /// Queue the subscription request on the current connection. Must not block.
    fn subscribe(&mut self, request: &SubscribeRequest) -> Result<()>;

    /// Short name for logs.
    fn name(&self) -> &'static str {
        "upstream"
    }
}
