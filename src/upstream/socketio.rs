//! ==============================================================================
//! socketio.rs - socket.io connector for the station feed
//! ==============================================================================
//!
//! purpose:
//!     owns the one upstream connection. rust_socketio speaks the protocol over
//!     a websocket; this module maps its callbacks onto UpstreamEvents and
//!     forwards the hub's subscribe requests.
//!
//! relationships:
//!     - implements: mod.rs (UpstreamTransport)
//!     - uses: config.rs (UpstreamConfig)
//!     - used by: main.rs (handed to the relay hub)
//!
//! lifecycle:
//!
//! ```text
//!     connect ──fail──> sleep(backoff), backoff *= 2 ──┐
//!        ^                                              │
//!        └──────────────────────────────────────────────┘
//!        │ ok
//!        v
//!     forward subscribe requests until the hub drops the transport
//!
//!     after the first successful connect the client library reconnects on
//!     its own, within the same backoff bounds.
//! ```
//!
//! ==============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use rust_socketio::asynchronous::{Client, ClientBuilder};
use rust_socketio::{Event, Payload, TransportType};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::{SubscribeRequest, UpstreamEvent, UpstreamTransport};
use crate::config::UpstreamConfig;
use crate::snapshot::RawTelemetry;

pub struct SocketIoTransport {
    events: mpsc::UnboundedReceiver<UpstreamEvent>,
    outbound: mpsc::UnboundedSender<SubscribeRequest>,
}

impl SocketIoTransport {
    /// Start the connector task. Connecting happens in the background; the
    /// task winds down once this transport is dropped.
    pub fn spawn(config: &UpstreamConfig, application_key: &str) -> Result<Self> {
        let address = endpoint(&config.url, application_key)?;

        let (event_tx, events) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let connector = Connector {
            address,
            link: LinkState::new(event_tx),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            connect_timeout: config.connect_timeout(),
        };
        tokio::spawn(connector.run(outbound_rx));

        Ok(Self { events, outbound })
    }
}

#[async_trait]
impl UpstreamTransport for SocketIoTransport {
    async fn recv(&mut self) -> Option<UpstreamEvent> {
        self.events.recv().await
    }

    fn subscribe(&mut self, request: &SubscribeRequest) -> Result<()> {
        self.outbound
            .send(request.clone())
            .map_err(|_| anyhow!("socket.io connector has stopped"))
    }

    fn name(&self) -> &'static str {
        "socket.io"
    }
}

/// `<base>/?api=1&applicationKey=<key>`; the client library adds `socket.io/`.
fn endpoint(base: &str, application_key: &str) -> Result<String> {
    let base = base.trim().trim_end_matches('/');
    let scheme_ok = ["http://", "https://", "ws://", "wss://"]
        .iter()
        .any(|scheme| base.starts_with(scheme) && base.len() > scheme.len());
    if !scheme_ok || base.contains(char::is_whitespace) {
        bail!("invalid upstream url {:?}", base);
    }
    // goes into the query string verbatim
    if !application_key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("application key contains characters that are not allowed in a url");
    }
    Ok(format!("{base}/?api=1&applicationKey={application_key}"))
}

/// Collapses the library's connect / close callbacks into one event per edge.
#[derive(Clone)]
struct LinkState {
    events: mpsc::UnboundedSender<UpstreamEvent>,
    connected: Arc<AtomicBool>,
}

impl LinkState {
    fn new(events: mpsc::UnboundedSender<UpstreamEvent>) -> Self {
        Self {
            events,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn up(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("Connected to Ambient Weather");
            let _ = self.events.send(UpstreamEvent::Connected);
        }
    }

    fn down(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Disconnected from Ambient Weather");
            let _ = self.events.send(UpstreamEvent::Disconnected);
        }
    }

    fn data(&self, payload: Payload) {
        match telemetry_from(payload) {
            Some(raw) => {
                let _ = self.events.send(UpstreamEvent::Data(raw));
            }
            None => warn!("data event without an object payload"),
        }
    }
}

/// First argument of a `data` event, if it is a JSON object.
#[allow(deprecated)]
fn telemetry_from(payload: Payload) -> Option<RawTelemetry> {
    let value = match payload {
        Payload::Text(values) => values.into_iter().next()?,
        Payload::String(text) => serde_json::from_str(&text).ok()?,
        _ => return None,
    };
    match value {
        Value::Object(raw) => Some(raw),
        _ => None,
    }
}

#[allow(deprecated)]
fn log_subscribed(payload: &Payload) {
    let devices = match payload {
        Payload::Text(values) => values
            .first()
            .and_then(|v| v.get("devices"))
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0),
        _ => 0,
    };
    info!(devices, "subscription confirmed by upstream");
}

struct Connector {
    address: String,
    link: LinkState,
    initial_backoff: Duration,
    max_backoff: Duration,
    connect_timeout: Duration,
}

impl Connector {
    async fn run(self, mut outbound: mpsc::UnboundedReceiver<SubscribeRequest>) {
        let Some(client) = self.connect_with_backoff().await else {
            return;
        };

        while let Some(request) = outbound.recv().await {
            debug!(keys = request.api_keys.len(), "sending subscribe to upstream");
            if let Err(e) = send_subscribe(&client, &request).await {
                warn!("failed to send subscribe request: {:#}", e);
            }
        }

        debug!("relay hub dropped the transport, closing upstream");
        if let Err(e) = client.disconnect().await {
            debug!("upstream disconnect failed: {}", e);
        }
    }

    async fn connect_with_backoff(&self) -> Option<Client> {
        let mut backoff = self.initial_backoff;
        loop {
            match self.connect().await {
                Ok(client) => return Some(client),
                Err(e) => warn!("upstream connection error: {:#}", e),
            }

            info!(delay_ms = backoff.as_millis() as u64, "reconnecting to upstream");
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = self.link.events.closed() => {
                    debug!("relay hub dropped the transport, connector stopping");
                    return None;
                }
            }
            backoff = next_backoff(backoff, self.max_backoff);
        }
    }

    async fn connect(&self) -> Result<Client> {
        let on_connect = self.link.clone();
        let on_close = self.link.clone();
        let on_data = self.link.clone();

        let builder = ClientBuilder::new(self.address.clone())
            .transport_type(TransportType::Websocket)
            .reconnect(true)
            .reconnect_on_disconnect(true)
            .reconnect_delay(millis(self.initial_backoff), millis(self.max_backoff))
            .on(Event::Connect, move |_, _| {
                on_connect.up();
                async {}.boxed()
            })
            .on(Event::Close, move |_, _| {
                on_close.down();
                async {}.boxed()
            })
            .on("data", move |payload, _| {
                on_data.data(payload);
                async {}.boxed()
            })
            .on("subscribed", |payload, _| {
                log_subscribed(&payload);
                async {}.boxed()
            })
            .on(Event::Error, |payload, _| {
                warn!(?payload, "upstream socket error");
                async {}.boxed()
            });

        timeout(self.connect_timeout, builder.connect())
            .await
            .map_err(|_| anyhow!("connect timed out after {:?}", self.connect_timeout))?
            .context("socket.io connect failed")
    }
}

async fn send_subscribe(client: &Client, request: &SubscribeRequest) -> Result<()> {
    let payload = serde_json::to_value(request)?;
    client.emit("subscribe", payload).await?;
    Ok(())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
