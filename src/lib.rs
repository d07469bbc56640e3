//! Weather relay: one upstream station feed in, enriched snapshots out to
//! every live subscriber.

pub mod compass;
pub mod config;
pub mod hub;
pub mod server;
pub mod snapshot;
pub mod trend;
pub mod upstream;

pub use hub::{HubHandle, RelayHub, Subscriber, SubscriberEvent};
pub use snapshot::{RawTelemetry, Snapshot};
pub use trend::{PressureTrendAnalyzer, TrendClassification, TrendConfig, TrendResult};
pub use upstream::{SubscribeRequest, UpstreamEvent, UpstreamTransport};
