//! Protocol message types for the push channel.
//!
//! This module defines all messages exchanged over the air-quality hub:
//! - Server → Client: Hello, NewAirQualityData, AirQualityUpdate,
//!   AirQualityAlert, DeviceStatusChanged, InvocationResult
//! - Client → Server: Invoke
//!
//! Messages are serialized as JSON over WebSocket text frames. Server frames
//! are `{"event": <name>, "payload": <json>}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use airwatch_core::{Alert, DeviceStatus, ObservationEvent};

use crate::ngsi::{AirQualityObserved, NgsiError};

/// Protocol version announced in `Hello`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// REST path: latest reading per station.
pub const LATEST_PATH: &str = "/api/airquality/latest";

/// REST path: recent readings, oldest first.
pub const HISTORY_PATH: &str = "/api/airquality/history";

/// Default WebSocket path of the push hub.
pub const HUB_PATH: &str = "/hubs/airquality";

// ============================================================================
// Hello Message (Server → Client on connect)
// ============================================================================

/// Hello message sent by the hub immediately on connection.
///
/// # Example
/// ```json
/// {
///   "event": "Hello",
///   "payload": {
///     "connectionId": "6f1c2a8e-3d7b-4f0a-9b1e-2c5d8e7f9a10",
///     "version": "1.0",
///     "serverTime": "2025-03-01T08:00:00.000Z"
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloMessage {
    /// Hub-assigned connection identifier.
    pub connection_id: String,

    /// Protocol version supported.
    pub version: String,

    /// Current hub time.
    pub server_time: DateTime<Utc>,
}

impl HelloMessage {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION.to_string(),
            server_time: Utc::now(),
        }
    }
}

// ============================================================================
// Observation payloads
// ============================================================================

/// One observation as carried on the wire.
///
/// The normalized shape is tried first; anything else is read as an NGSI-LD
/// document, whose fields are all optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObservationRecord {
    Normalized(ObservationEvent),
    Document(Box<AirQualityObserved>),
}

impl ObservationRecord {
    pub fn into_event(self) -> Result<ObservationEvent, NgsiError> {
        match self {
            ObservationRecord::Normalized(event) => Ok(event),
            ObservationRecord::Document(doc) => ObservationEvent::try_from(*doc),
        }
    }
}

/// A single observation or a batch (one per station).
///
/// `Many` comes first: a derived struct also accepts a JSON array, so an
/// empty array would otherwise read as an empty document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObservationPayload {
    Many(Vec<ObservationRecord>),
    One(ObservationRecord),
}

/// Result of normalizing a payload: the events that converted and the
/// documents that did not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedObservations {
    pub events: Vec<ObservationEvent>,
    pub rejected: Vec<NgsiError>,
}

impl ObservationPayload {
    /// NGSI-LD documents for the given events.
    pub fn documents(events: &[ObservationEvent]) -> Self {
        ObservationPayload::Many(
            events
                .iter()
                .map(|e| ObservationRecord::Document(Box::new(AirQualityObserved::from(e))))
                .collect(),
        )
    }

    /// A single NGSI-LD document.
    pub fn document(event: &ObservationEvent) -> Self {
        ObservationPayload::One(ObservationRecord::Document(Box::new(
            AirQualityObserved::from(event),
        )))
    }

    pub fn len(&self) -> usize {
        match self {
            ObservationPayload::One(_) => 1,
            ObservationPayload::Many(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Normalize every record, keeping wire order.
    pub fn into_events(self) -> DecodedObservations {
        let records = match self {
            ObservationPayload::One(record) => vec![record],
            ObservationPayload::Many(records) => records,
        };

        let mut decoded = DecodedObservations::default();
        for record in records {
            match record.into_event() {
                Ok(event) => decoded.events.push(event),
                Err(e) => decoded.rejected.push(e),
            }
        }
        decoded
    }
}

// ============================================================================
// Invocations
// ============================================================================

/// Hub methods a client can invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum Command {
    GetLatestAirQuality,
    GetAirQualityHistory,
    /// Receive pushes for this station only (on top of broadcast alerts).
    JoinLocationGroup(String),
    LeaveLocationGroup(String),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetLatestAirQuality => "GetLatestAirQuality",
            Command::GetAirQualityHistory => "GetAirQualityHistory",
            Command::JoinLocationGroup(_) => "JoinLocationGroup",
            Command::LeaveLocationGroup(_) => "LeaveLocationGroup",
        }
    }
}

/// Invocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub invocation_id: u64,
    pub command: Command,
}

/// Reply to an invocation, correlated by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub invocation_id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ObservationPayload>,
}

impl InvocationResult {
    pub fn ok(invocation_id: u64, payload: Option<ObservationPayload>) -> Self {
        Self {
            invocation_id,
            success: true,
            message: None,
            payload,
        }
    }

    pub fn failed(invocation_id: u64, message: impl Into<String>) -> Self {
        Self {
            invocation_id,
            success: false,
            message: Some(message.into()),
            payload: None,
        }
    }
}

// ============================================================================
// Unified Message Enums
// ============================================================================

/// Messages that can be sent from hub to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerMessage {
    /// Sent once on connection.
    Hello(HelloMessage),

    /// A new reading from a station.
    NewAirQualityData(ObservationPayload),

    /// A corrected or refreshed reading.
    AirQualityUpdate(ObservationPayload),

    /// Alert raised by the backend.
    AirQualityAlert(Alert),

    DeviceStatusChanged(DeviceStatus),

    InvocationResult(InvocationResult),
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Hello(_) => "Hello",
            ServerMessage::NewAirQualityData(_) => "NewAirQualityData",
            ServerMessage::AirQualityUpdate(_) => "AirQualityUpdate",
            ServerMessage::AirQualityAlert(_) => "AirQualityAlert",
            ServerMessage::DeviceStatusChanged(_) => "DeviceStatusChanged",
            ServerMessage::InvocationResult(_) => "InvocationResult",
        }
    }
}

/// Messages that can be received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Invoke(InvokeRequest),
}
