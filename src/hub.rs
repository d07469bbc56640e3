//! ==============================================================================
//! hub.rs - relay hub: upstream lifecycle + subscriber fan-out
//! ==============================================================================
//!
//! purpose:
//!     owns the only mutable relay state (connection status, latest snapshot,
//!     pressure history, subscriber set) and reacts to two kinds of input:
//!     upstream events and subscriber join/leave requests.
//!
//! relationships:
//!     - uses: trend.rs (pressure history), snapshot.rs (enrichment)
//!     - uses: upstream/mod.rs (UpstreamTransport, injected)
//!     - used by: server.rs (via HubHandle), main.rs (spawns the hub task)
//!
//! architecture:
//!
//! ```text
//!     ┌──────────────┐  UpstreamEvent   ┌────────────────────┐  SubscriberEvent
//!     │  transport   │ ───────────────> │     hub task       │ ──────────────> subscriber 1
//!     └──────────────┘                  │ (one reaction at   │ ──────────────> subscriber 2
//!     ┌──────────────┐  HubCommand      │  a time, no locks) │ ──────────────> ...
//!     │  HubHandle   │ ───────────────> │                    │
//!     └──────────────┘                  └────────────────────┘
//! ```
//!
//! broadcast rule:
//!     delivery is fire-and-forget per subscriber. the subscriber ids are
//!     copied before a broadcast pass, so a subscriber removed during the pass
//!     (its own delivery failed) never disturbs the others.
//!
//! ```text
//!     a subscriber whose queue is full is dropped rather than left holding
//!     stale state; it reconnects and is replayed the latest state on join.
//! ```
//!
//! ==============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::snapshot::{enrich, pressure_of, RawTelemetry, Snapshot, PRESSURE_FIELD};
use crate::trend::{PressureTrendAnalyzer, TrendConfig};
use crate::upstream::{SubscribeRequest, UpstreamEvent, UpstreamTransport};

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Messages sent to a subscriber on join: latest snapshot, then status.
pub const JOIN_REPLAY_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
}

/// What a subscriber receives. Snapshots are shared, not copied, per subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum SubscriberEvent {
    WeatherData(Option<Arc<Snapshot>>),
    ConnectionStatus(ConnectionStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// outbound queue full; the subscriber is removed
    Lagged,
    /// the connection is gone; the subscriber is removed
    Closed,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Lagged => write!(f, "subscriber queue is full"),
            DeliveryError::Closed => write!(f, "subscriber connection closed"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// A downstream connection. `deliver` must not block.
pub trait Subscriber: Send {
    fn deliver(&mut self, event: &SubscriberEvent) -> Result<(), DeliveryError>;
}

/// Bounded per-connection queue; a slow reader loses its connection, not the hub's time.
/// Must hold at least `JOIN_REPLAY_LEN` events.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<SubscriberEvent>,
}

impl ChannelSubscriber {
    pub fn new(tx: mpsc::Sender<SubscriberEvent>) -> Self {
        Self { tx }
    }
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&mut self, event: &SubscriberEvent) -> Result<(), DeliveryError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Lagged,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

impl Subscriber for mpsc::UnboundedSender<SubscriberEvent> {
    fn deliver(&mut self, event: &SubscriberEvent) -> Result<(), DeliveryError> {
        self.send(event.clone()).map_err(|_| DeliveryError::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Point-in-time view for the JSON api.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubState {
    pub connected: bool,
    pub subscribers: usize,
    #[serde(rename = "weatherData")]
    pub weather_data: Option<Arc<Snapshot>>,
}

pub struct RelayHub {
    api_key: String,
    analyzer: PressureTrendAnalyzer,
    latest: Option<Arc<Snapshot>>,
    connected: bool,
    subscribers: BTreeMap<SubscriberId, Box<dyn Subscriber>>,
    next_id: u64,
    show_readings: bool,
}

impl RelayHub {
    pub fn new(api_key: impl Into<String>, trend: TrendConfig) -> Self {
        Self {
            api_key: api_key.into(),
            analyzer: PressureTrendAnalyzer::new(trend),
            latest: None,
            connected: false,
            subscribers: BTreeMap::new(),
            next_id: 0,
            show_readings: false,
        }
    }

    /// Log a one-line summary of every reading at info level.
    pub fn with_reading_log(mut self, enabled: bool) -> Self {
        self.show_readings = enabled;
        self
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.connected,
        }
    }

    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.latest.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn analyzer(&self) -> &PressureTrendAnalyzer {
        &self.analyzer
    }

    pub fn state(&self) -> HubState {
        HubState {
            connected: self.connected,
            subscribers: self.subscribers.len(),
            weather_data: self.latest.clone(),
        }
    }

    pub fn handle_upstream(&mut self, event: UpstreamEvent, transport: &mut dyn UpstreamTransport) {
        match event {
            UpstreamEvent::Connected => self.on_connect(transport),
            UpstreamEvent::Disconnected => self.on_disconnect(),
            UpstreamEvent::Data(raw) => self.on_data(raw),
        }
    }

    fn on_connect(&mut self, transport: &mut dyn UpstreamTransport) {
        info!(transport = transport.name(), "upstream connected");
        self.connected = true;
        if let Err(e) = transport.subscribe(&SubscribeRequest::new(self.api_key.clone())) {
            warn!("failed to send subscribe request: {:#}", e);
        }
        self.broadcast(SubscriberEvent::ConnectionStatus(self.status()));
    }

    fn on_disconnect(&mut self) {
        info!("upstream disconnected");
        self.connected = false;
        self.broadcast(SubscriberEvent::ConnectionStatus(self.status()));
    }

    fn on_data(&mut self, raw: RawTelemetry) {
        if let Some(pressure) = pressure_of(&raw) {
            self.analyzer.add_reading(pressure);
        }

        let trend = self.analyzer.get_trend();
        let Some(snapshot) = enrich(Some(&raw), Utc::now(), trend).map(Arc::new) else {
            return;
        };

        if self.show_readings {
            info!(
                tempf = ?snapshot.field("tempf"),
                pressure = ?snapshot.field(PRESSURE_FIELD),
                trend = ?trend.classification,
                change_rate = trend.change_rate,
                wind = ?snapshot.wind_direction,
                "[READING]"
            );
        } else {
            debug!(fields = raw.len(), trend = ?trend.classification, "reading received");
        }

        self.latest = Some(snapshot.clone());
        self.broadcast(SubscriberEvent::WeatherData(Some(snapshot)));
    }

    /// The transport is gone for good: report it once and keep serving state.
    fn on_upstream_closed(&mut self) {
        warn!("upstream transport stopped delivering events");
        if self.connected {
            self.on_disconnect();
        }
    }

    /// Register and replay current state: latest snapshot (if any) then status.
    pub fn join(&mut self, subscriber: Box<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.subscribers.insert(id, subscriber);
        debug!(%id, total = self.subscribers.len(), "subscriber joined");

        if let Some(snapshot) = self.latest.clone() {
            self.send_to(id, &SubscriberEvent::WeatherData(Some(snapshot)));
        }
        self.send_to(id, &SubscriberEvent::ConnectionStatus(self.status()));
        id
    }

    pub fn leave(&mut self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            debug!(%id, total = self.subscribers.len(), "subscriber left");
        }
        removed
    }

    fn broadcast(&mut self, event: SubscriberEvent) {
        let ids: Vec<SubscriberId> = self.subscribers.keys().copied().collect();
        for id in ids {
            self.send_to(id, &event);
        }
    }

    fn send_to(&mut self, id: SubscriberId, event: &SubscriberEvent) {
        let Some(subscriber) = self.subscribers.get_mut(&id) else {
            return;
        };
        match subscriber.deliver(event) {
            Ok(()) => {}
            Err(DeliveryError::Lagged) => {
                self.subscribers.remove(&id);
                warn!(%id, "subscriber queue full, dropped so it can rejoin");
            }
            Err(DeliveryError::Closed) => {
                self.subscribers.remove(&id);
                debug!(%id, "subscriber closed during delivery, removed");
            }
        }
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Join { subscriber, reply } => {
                let id = self.join(subscriber);
                if reply.send(id).is_err() {
                    self.leave(id);
                }
            }
            HubCommand::Leave(id) => {
                self.leave(id);
            }
            HubCommand::State(reply) => {
                let _ = reply.send(self.state());
            }
        }
    }

    /// Move the hub onto its own task. Every reaction runs to completion
    /// before the next one starts.
    pub fn spawn<T>(self, transport: T) -> (HubHandle, JoinHandle<()>)
    where
        T: UpstreamTransport + 'static,
    {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let task = tokio::spawn(self.run(transport, rx));
        (HubHandle { tx }, task)
    }

    /// Ends when every HubHandle has been dropped.
    pub async fn run<T>(mut self, mut transport: T, mut commands: mpsc::Receiver<HubCommand>)
    where
        T: UpstreamTransport,
    {
        let mut upstream_open = true;
        loop {
            tokio::select! {
                event = transport.recv(), if upstream_open => match event {
                    Some(event) => self.handle_upstream(event, &mut transport),
                    None => {
                        upstream_open = false;
                        self.on_upstream_closed();
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        info!("relay hub stopped");
    }
}

pub enum HubCommand {
    Join {
        subscriber: Box<dyn Subscriber>,
        reply: oneshot::Sender<SubscriberId>,
    },
    Leave(SubscriberId),
    State(oneshot::Sender<HubState>),
}

/// Cheap, cloneable access to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub async fn join(&self, subscriber: impl Subscriber + 'static) -> Result<SubscriberId> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Join {
            subscriber: Box::new(subscriber),
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("relay hub dropped the join request"))
    }

    pub async fn leave(&self, id: SubscriberId) -> Result<()> {
        self.send(HubCommand::Leave(id)).await
    }

    pub async fn state(&self) -> Result<HubState> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::State(reply)).await?;
        rx.await.map_err(|_| anyhow!("relay hub dropped the state request"))
    }

    async fn send(&self, command: HubCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("relay hub is not running"))
    }
}
