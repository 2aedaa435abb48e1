//! Transport adapters.
//!
//! An adapter hides how observations arrive. Both variants push normalized
//! [`TransportEvent`]s into the sink handed to `connect`, and answer
//! [`Command`] invocations:
//! - [`PushTransport`]: WebSocket hub, server-initiated events
//! - [`PollTransport`]: periodic HTTP GET against the REST API
//!
//! Adapters never touch reconciled state. The connection manager owns the
//! one active adapter and swaps it through [`ActiveTransport`].

mod poll;
mod push;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use airwatch_core::config::TransportSettings;
use airwatch_core::{Alert, DeviceStatus, ObservationEvent, TransportKind};
use airwatch_protocol::{CodecError, Command, InvocationResult};

pub use airwatch_protocol::{HISTORY_PATH, HUB_PATH, LATEST_PATH};
pub use poll::{ApiClient, PollTransport};
pub use push::PushTransport;

/// Transport-level failures. Never fatal to the session.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("connection closed: {0}")]
    Closed(String),
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        TransportError::Malformed(e.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(format!("HTTP request ({})", e))
        } else {
            TransportError::Http(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

/// Normalized event delivered by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    NewData(ObservationEvent),
    Update(ObservationEvent),
    Alert(Alert),
    DeviceStatus(DeviceStatus),
    /// The connection dropped without a local disconnect.
    Closed { reason: String },
}

/// Where an adapter delivers its events. Dropping the receiver detaches
/// every listener at once.
pub type EventSink = mpsc::Sender<TransportEvent>;

/// Returned by a successful connect.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionHandle {
    pub kind: TransportKind,
    /// Hub-assigned id (push only).
    pub connection_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(kind: TransportKind, connection_id: Option<String>) -> Self {
        Self {
            kind,
            connection_id,
            connected_at: Utc::now(),
        }
    }
}

/// Reply to an invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub success: bool,
    pub message: Option<String>,
    pub observations: Vec<ObservationEvent>,
}

impl Response {
    pub fn with_observations(observations: Vec<ObservationEvent>) -> Self {
        Self {
            success: true,
            message: None,
            observations,
        }
    }

    pub fn acknowledged(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            observations: Vec::new(),
        }
    }
}

impl From<InvocationResult> for Response {
    fn from(result: InvocationResult) -> Self {
        let decoded = result.payload.map(|p| p.into_events()).unwrap_or_default();
        for e in &decoded.rejected {
            warn!(
                invocation_id = result.invocation_id,
                error = %e,
                "Skipping invalid observation in invocation result"
            );
        }

        Self {
            success: result.success,
            message: result.message,
            observations: decoded.events,
        }
    }
}

/// A delivery mechanism for observations.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Open the transport; events flow into `sink` until disconnect or close.
    async fn connect(&mut self, sink: EventSink) -> Result<ConnectionHandle, TransportError>;

    /// Close the transport and stop its background work. Idempotent.
    async fn disconnect(&mut self);

    async fn invoke(&self, command: Command) -> Result<Response, TransportError>;
}

/// Creates fresh adapters for connect and probe attempts.
pub trait TransportFactory: Send + Sync {
    fn push(&self) -> Result<Box<dyn TransportAdapter>, TransportError>;

    fn poll(&self) -> Result<Box<dyn TransportAdapter>, TransportError>;
}

/// Factory for the real WebSocket and HTTP adapters.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    settings: TransportSettings,
}

impl HttpTransportFactory {
    pub fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn push(&self) -> Result<Box<dyn TransportAdapter>, TransportError> {
        Ok(Box::new(PushTransport::new(
            &self.settings.push_url,
            self.settings.request_timeout(),
        )))
    }

    fn poll(&self) -> Result<Box<dyn TransportAdapter>, TransportError> {
        let api = ApiClient::new(&self.settings.api_base_url, self.settings.request_timeout())?;
        Ok(Box::new(PollTransport::new(api, self.settings.poll_interval())))
    }
}

/// The adapter currently feeding the session.
pub enum ActiveTransport {
    Push(Box<dyn TransportAdapter>),
    Poll(Box<dyn TransportAdapter>),
}

impl ActiveTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            ActiveTransport::Push(_) => TransportKind::Push,
            ActiveTransport::Poll(_) => TransportKind::Poll,
        }
    }

    pub fn adapter(&self) -> &dyn TransportAdapter {
        match self {
            ActiveTransport::Push(adapter) | ActiveTransport::Poll(adapter) => adapter.as_ref(),
        }
    }

    pub async fn disconnect(&mut self) {
        match self {
            ActiveTransport::Push(adapter) | ActiveTransport::Poll(adapter) => {
                adapter.disconnect().await
            }
        }
    }
}

impl std::fmt::Debug for ActiveTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ActiveTransport").field(&self.kind()).finish()
    }
}
