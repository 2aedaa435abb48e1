//! Air-quality data model types.
//!
//! These types represent the values that flow through the update pipeline:
//! - Observation events (one reading, one station, one instant)
//! - Alerts derived from AQI bands
//! - Device status notifications
//! - Connection state snapshots shared with display surfaces

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aqi;

/// Pollutants reported by the sensor network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Pollutant {
    #[serde(rename = "PM25")]
    Pm25,
    #[serde(rename = "PM10")]
    Pm10,
    #[serde(rename = "O3")]
    O3,
    #[serde(rename = "NO2")]
    No2,
    #[serde(rename = "SO2")]
    So2,
    #[serde(rename = "CO")]
    Co,
}

impl Pollutant {
    /// Every pollutant, in display order.
    pub const ALL: [Pollutant; 6] = [
        Pollutant::Pm25,
        Pollutant::Pm10,
        Pollutant::O3,
        Pollutant::No2,
        Pollutant::So2,
        Pollutant::Co,
    ];

    /// Wire code of the pollutant (e.g., "PM25").
    pub fn code(&self) -> &'static str {
        match self {
            Pollutant::Pm25 => "PM25",
            Pollutant::Pm10 => "PM10",
            Pollutant::O3 => "O3",
            Pollutant::No2 => "NO2",
            Pollutant::So2 => "SO2",
            Pollutant::Co => "CO",
        }
    }

    /// UN/CEFACT unit code used when a reading carries none.
    ///
    /// `GQ` is µg/m³, `59` is ppm (CO is reported in ppm).
    pub fn default_unit_code(&self) -> &'static str {
        match self {
            Pollutant::Co => "59",
            _ => "GQ",
        }
    }
}

impl fmt::Display for Pollutant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A single pollutant reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Measured value, `None` when the sensor reported no value
    pub value: Option<f64>,

    /// Unit code (e.g., "GQ" for µg/m³)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Measurement {
    pub fn new(value: f64, unit: &str) -> Self {
        Self {
            value: Some(value),
            unit: Some(unit.to_string()),
        }
    }
}

/// Position in WGS84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// One sensor reading at one station at one instant.
///
/// This is the normalized shape every transport delivers, regardless of
/// whether the wire carried an NGSI-LD document or this structure directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationEvent {
    /// Station / feature-of-interest identifier
    pub station_id: String,

    /// Observation time (UTC)
    pub observed_at: DateTime<Utc>,

    /// Pollutant readings keyed by pollutant code
    #[serde(default)]
    pub metrics: BTreeMap<Pollutant, Measurement>,

    /// Transmitted composite index, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aqi: Option<f64>,

    /// Station position
    pub location: Location,
}

impl ObservationEvent {
    /// Create an event with no readings.
    pub fn new(station_id: &str, observed_at: DateTime<Utc>, location: Location) -> Self {
        Self {
            station_id: station_id.to_string(),
            observed_at,
            metrics: BTreeMap::new(),
            aqi: None,
            location,
        }
    }

    /// Add a reading using the pollutant's default unit.
    pub fn with_metric(mut self, pollutant: Pollutant, value: f64) -> Self {
        self.metrics.insert(
            pollutant,
            Measurement::new(value, pollutant.default_unit_code()),
        );
        self
    }

    /// Set the transmitted AQI.
    pub fn with_aqi(mut self, aqi: f64) -> Self {
        self.aqi = Some(aqi);
        self
    }

    /// Value of a pollutant reading, if present and non-null.
    pub fn metric(&self, pollutant: Pollutant) -> Option<f64> {
        self.metrics.get(&pollutant).and_then(|m| m.value)
    }

    /// The transmitted AQI, or one derived from PM2.5/PM10 when absent.
    pub fn effective_aqi(&self) -> Option<f64> {
        self.aqi.or_else(|| aqi::composite(&self.metrics))
    }
}

/// AQI bands in order of severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertLevel {
    Normal,
    Moderate,
    UnhealthyForSensitive,
    Unhealthy,
    VeryUnhealthy,
    Hazardous,
}

impl AlertLevel {
    /// Classify an AQI value (inclusive upper bounds).
    pub fn from_aqi(aqi: f64) -> Self {
        if aqi <= 50.0 {
            AlertLevel::Normal
        } else if aqi <= 100.0 {
            AlertLevel::Moderate
        } else if aqi <= 150.0 {
            AlertLevel::UnhealthyForSensitive
        } else if aqi <= 200.0 {
            AlertLevel::Unhealthy
        } else if aqi <= 300.0 {
            AlertLevel::VeryUnhealthy
        } else {
            AlertLevel::Hazardous
        }
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            AlertLevel::Normal => "good",
            AlertLevel::Moderate => "moderate",
            AlertLevel::UnhealthyForSensitive => "unhealthy for sensitive groups",
            AlertLevel::Unhealthy => "unhealthy",
            AlertLevel::VeryUnhealthy => "very unhealthy",
            AlertLevel::Hazardous => "hazardous",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A threshold-crossing alert. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub station_id: String,
    pub level: AlertLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aqi: Option<f64>,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
}

/// Device status notification pushed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Delivery mechanism currently feeding the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Push,
    Poll,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Push => f.write_str("push"),
            TransportKind::Poll => f.write_str("poll"),
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Degraded but operational: data arrives via HTTP polling.
    Polling,
    Reconnecting,
}

/// Snapshot of the connection manager's state for display surfaces.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,

    /// The manager is running (between `initialize` and `disconnect`)
    pub is_enabled: bool,

    /// Transport currently feeding the session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,

    /// Push reconnect attempts made since the last successful connect
    pub reconnect_attempts: u32,

    /// Wall-clock time of the last accepted observation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_data_at: Option<DateTime<Utc>>,

    /// No observation has been accepted within the staleness threshold
    pub waiting_for_data: bool,

    /// Last transport failure, kept for display
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_polling(&self) -> bool {
        self.state == ConnectionState::Polling
    }
}
