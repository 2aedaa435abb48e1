//! Mock push hub.
//!
//! Accepts WebSocket clients and:
//! - sends `Hello` with a fresh connection id
//! - broadcasts observations, alerts and device status changes
//! - answers invocations from the station feed
//! - keeps per-connection location groups

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use airwatch_core::{Alert, DeviceStatus, ObservationEvent};
use airwatch_protocol::{
    decode_client_message, encode_server_message, ClientMessage, Command, HelloMessage,
    InvocationResult, ObservationPayload, ServerMessage,
};

use crate::feed::StationFeed;
use crate::groups::LocationGroups;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration for the push hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to when using [`PushHub::run`].
    pub bind_addr: SocketAddr,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

/// Something the backend wants to push.
#[derive(Debug, Clone)]
pub enum HubEvent {
    NewData(ObservationEvent),
    Update(ObservationEvent),
    Alert(Alert),
    DeviceStatus(DeviceStatus),
}

impl HubEvent {
    /// Wire form. Observations go out as NGSI-LD documents.
    pub fn to_message(&self) -> ServerMessage {
        match self {
            HubEvent::NewData(event) => {
                ServerMessage::NewAirQualityData(ObservationPayload::document(event))
            }
            HubEvent::Update(event) => {
                ServerMessage::AirQualityUpdate(ObservationPayload::document(event))
            }
            HubEvent::Alert(alert) => ServerMessage::AirQualityAlert(alert.clone()),
            HubEvent::DeviceStatus(status) => ServerMessage::DeviceStatusChanged(status.clone()),
        }
    }
}

/// The mock WebSocket hub.
pub struct PushHub {
    config: HubConfig,
    feed: StationFeed,
    /// Fan-out to connection handlers.
    broadcast_tx: broadcast::Sender<HubEvent>,
    /// Events submitted by tests, the generator or the binary.
    event_tx: mpsc::Sender<HubEvent>,
    event_rx: mpsc::Receiver<HubEvent>,
    connections: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl PushHub {
    pub fn new(config: HubConfig, feed: StationFeed) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        let (event_tx, event_rx) = mpsc::channel(1024);

        Self {
            config,
            feed,
            broadcast_tx,
            event_tx,
            event_rx,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this stops accepting and closes every connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Get a sender for submitting events to the hub.
    pub fn event_sender(&self) -> mpsc::Sender<HubEvent> {
        self.event_tx.clone()
    }

    /// Live count of open client connections.
    pub fn connection_count(&self) -> Arc<AtomicUsize> {
        self.connections.clone()
    }

    pub fn feed(&self) -> &StationFeed {
        &self.feed
    }

    /// Bind the configured address and serve forever.
    pub async fn run(self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shut down.
    pub async fn serve(self, listener: TcpListener) -> Result<(), BoxError> {
        info!("Mock push hub listening on {}", listener.local_addr()?);

        let PushHub {
            feed,
            broadcast_tx,
            mut event_rx,
            connections,
            shutdown,
            ..
        } = self;

        // Record, then fan out
        let processor_feed = feed.clone();
        let processor_tx = broadcast_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let HubEvent::NewData(observation) | HubEvent::Update(observation) = &event {
                    processor_feed.record(observation.clone());
                }
                let _ = processor_tx.send(event);
            }
        });

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Mock push hub shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let feed = feed.clone();
                    let events = broadcast_tx.subscribe();
                    let connections = connections.clone();
                    let shutdown = shutdown.clone();

                    tokio::spawn(async move {
                        connections.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = handle_connection(stream, addr, feed, events, shutdown).await {
                            error!("Connection error from {}: {}", addr, e);
                        }
                        connections.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    feed: StationFeed,
    mut events: broadcast::Receiver<HubEvent>,
    shutdown: CancellationToken,
) -> Result<(), BoxError> {
    info!("New connection from {}", addr);

    // `?stations=S1,S2` joins groups up front
    let query = Arc::new(Mutex::new(None::<String>));
    let captured = query.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        *captured.lock() = req.uri().query().map(str::to_string);
        Ok(resp)
    })
    .await?;

    let mut groups = query
        .lock()
        .take()
        .map(|query| LocationGroups::from_query(&query))
        .unwrap_or_default();

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let connection_id = Uuid::new_v4().to_string();
    let hello = encode_server_message(&ServerMessage::Hello(HelloMessage::new(&connection_id)))?;
    ws_tx.send(Message::Text(hello)).await?;
    debug!(connection_id = %connection_id, "Sent Hello to {}", addr);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_message(&text, &feed, &mut groups, &mut ws_tx).await {
                            warn!("Error handling message from {}: {}", addr, e);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} closed connection", addr);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_tx.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => {
                        info!("Client {} disconnected", addr);
                        break;
                    }
                    _ => {}
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if !groups.accepts(&event) {
                            continue;
                        }
                        let msg = encode_server_message(&event.to_message())?;
                        if let Err(e) = ws_tx.send(Message::Text(msg)).await {
                            error!("Failed to push to {}: {}", addr, e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} lagged {} messages", addr, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event channel closed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Answer one invocation.
async fn handle_client_message(
    text: &str,
    feed: &StationFeed,
    groups: &mut LocationGroups,
    ws_tx: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
) -> Result<(), BoxError> {
    let ClientMessage::Invoke(request) = decode_client_message(text)?;
    let id = request.invocation_id;
    debug!(invocation_id = id, method = request.command.name(), "Invocation received");

    let result = match request.command {
        Command::GetLatestAirQuality => {
            InvocationResult::ok(id, Some(ObservationPayload::documents(&feed.latest())))
        }
        Command::GetAirQualityHistory => {
            InvocationResult::ok(id, Some(ObservationPayload::documents(&feed.history())))
        }
        Command::JoinLocationGroup(station) if station.is_empty() => {
            InvocationResult::failed(id, "station id required")
        }
        Command::JoinLocationGroup(station) => {
            groups.join(&station);
            InvocationResult::ok(id, None)
        }
        Command::LeaveLocationGroup(station) => {
            groups.leave(&station);
            InvocationResult::ok(id, None)
        }
    };

    let msg = encode_server_message(&ServerMessage::InvocationResult(result))?;
    ws_tx.send(Message::Text(msg)).await?;
    Ok(())
}
