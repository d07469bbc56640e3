//! ==============================================================================
//! snapshot.rs - snapshot enricher
//! ==============================================================================
//!
//! purpose:
//!     turns the latest raw upstream payload into the record subscribers see:
//!     every raw field passed through, plus timestamp, pressure trend and
//!     compass labels for the wind direction fields.
//!
//! relationships:
//!     - used by: hub.rs (builds one snapshot per upstream reading)
//!     - uses: trend.rs (TrendResult), compass.rs (wind labels)
//!
//! malformed input:
//!     a missing or non-numeric wind field never fails the build; the derived
//!     label is simply left out (`windDirection`) or null (`windDirectionAvg`).
//!
//! ==============================================================================

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

use crate::compass::CompassPoint;
use crate::trend::TrendResult;

/// Upstream payload, field name -> value, kept verbatim.
pub type RawTelemetry = Map<String, Value>;

/// Relative barometric pressure, inHg.
pub const PRESSURE_FIELD: &str = "baromrelin";
pub const WIND_DIR_FIELD: &str = "winddir";
pub const WIND_DIR_AVG_FIELD: &str = "winddir_avg10m";

const TIMESTAMP_KEY: &str = "timestamp";
const PRESSURE_TREND_KEY: &str = "pressureTrend";
const WIND_DIRECTION_KEY: &str = "windDirection";
const WIND_DIRECTION_AVG_KEY: &str = "windDirectionAvg";

const DERIVED_KEYS: [&str; 4] = [
    TIMESTAMP_KEY,
    PRESSURE_TREND_KEY,
    WIND_DIRECTION_KEY,
    WIND_DIRECTION_AVG_KEY,
];

/// One enriched, broadcastable record.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub raw: RawTelemetry,
    pub timestamp: DateTime<Utc>,
    pub pressure_trend: TrendResult,
    pub wind_direction: Option<CompassPoint>,
    pub wind_direction_avg: Option<CompassPoint>,
}

impl Snapshot {
    /// Enrich `raw` received at `timestamp`. Pure; the caller supplies the trend.
    pub fn build(raw: &RawTelemetry, timestamp: DateTime<Utc>, pressure_trend: TrendResult) -> Self {
        Self {
            raw: raw.clone(),
            timestamp,
            pressure_trend,
            wind_direction: compass_field(raw, WIND_DIR_FIELD),
            wind_direction_avg: compass_field(raw, WIND_DIR_AVG_FIELD),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.raw.get(name)
    }
}

/// `None` until the first upstream reading has arrived.
pub fn enrich(
    latest: Option<&RawTelemetry>,
    timestamp: DateTime<Utc>,
    pressure_trend: TrendResult,
) -> Option<Snapshot> {
    latest.map(|raw| Snapshot::build(raw, timestamp, pressure_trend))
}

/// A finite numeric pressure reading, if the payload carries one.
pub fn pressure_of(raw: &RawTelemetry) -> Option<f64> {
    numeric_field(raw, PRESSURE_FIELD)
}

fn compass_field(raw: &RawTelemetry, name: &str) -> Option<CompassPoint> {
    numeric_field(raw, name).and_then(CompassPoint::from_degrees)
}

fn numeric_field(raw: &RawTelemetry, name: &str) -> Option<f64> {
    raw.get(name)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
}

// flat object: raw fields first, derived keys last and winning over raw ones
impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (key, value) in self.raw.iter() {
            if !DERIVED_KEYS.contains(&key.as_str()) {
                map.serialize_entry(key, value)?;
            }
        }
        map.serialize_entry(
            TIMESTAMP_KEY,
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        map.serialize_entry(PRESSURE_TREND_KEY, &self.pressure_trend)?;
        if let Some(direction) = self.wind_direction {
            map.serialize_entry(WIND_DIRECTION_KEY, &direction)?;
        }
        map.serialize_entry(WIND_DIRECTION_AVG_KEY, &self.wind_direction_avg)?;
        map.end()
    }
}
