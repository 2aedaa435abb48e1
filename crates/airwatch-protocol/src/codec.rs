//! Frame and body codec for the air-quality protocol.
//!
//! The hub uses JSON messages over WebSocket text frames and the REST API
//! returns JSON bodies. This module provides encoding and decoding utilities
//! for both.

use thiserror::Error;

use crate::messages::{ClientMessage, DecodedObservations, ObservationPayload, ServerMessage};
use crate::ngsi::NgsiError;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Received binary frame instead of text.
    #[error("Expected text frame, received binary")]
    BinaryFrame,

    /// An NGSI-LD document could not be normalized.
    #[error("Invalid observation document: {0}")]
    InvalidDocument(#[from] NgsiError),
}

/// Encode a hub message for transmission.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(CodecError::from)
}

/// Decode a hub message received over the socket.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}

/// Encode a client message for transmission.
pub fn encode_client_message(msg: &ClientMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(CodecError::from)
}

/// Decode a client message received by the hub.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}

/// Decode a REST body holding one observation or an array of them.
///
/// Only malformed JSON is an error; documents that fail to normalize are
/// returned in `rejected`.
pub fn decode_observations(body: &str) -> Result<DecodedObservations, CodecError> {
    let payload: ObservationPayload = serde_json::from_str(body)?;
    Ok(payload.into_events())
}

/// Like [`decode_observations`] but fails on the first invalid document.
pub fn decode_observations_strict(
    body: &str,
) -> Result<Vec<airwatch_core::ObservationEvent>, CodecError> {
    let decoded = decode_observations(body)?;
    match decoded.rejected.into_iter().next() {
        Some(e) => Err(CodecError::InvalidDocument(e)),
        None => Ok(decoded.events),
    }
}
