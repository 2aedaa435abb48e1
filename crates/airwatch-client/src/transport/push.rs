//! WebSocket push transport.
//!
//! Connects to the hub, waits for `Hello`, then runs one session task that
//! owns both halves of the socket:
//! - decodes hub events and forwards them to the sink
//! - writes outbound invocation frames
//! - resolves pending invocations by id
//! - answers pings

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use airwatch_core::TransportKind;
use airwatch_protocol::{
    decode_server_message, encode_client_message, ClientMessage, CodecError, Command,
    InvocationResult, InvokeRequest, ServerMessage,
};

use super::{ConnectionHandle, EventSink, Response, TransportAdapter, TransportError, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<InvocationResult>>>>;

const OUTBOUND_BUFFER: usize = 32;

struct Session {
    outbound: mpsc::Sender<String>,
    pending: Pending,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Push adapter over a WebSocket.
pub struct PushTransport {
    url: String,
    timeout: Duration,
    next_invocation: AtomicU64,
    session: Option<Session>,
}

impl PushTransport {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
            next_invocation: AtomicU64::new(1),
            session: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.task.is_finished())
    }
}

#[async_trait]
impl TransportAdapter for PushTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }

    async fn connect(&mut self, sink: EventSink) -> Result<ConnectionHandle, TransportError> {
        self.disconnect().await;

        let (ws, _) = timeout(self.timeout, tokio_tungstenite::connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to {}", self.url)))?
            .map_err(|e| TransportError::Connect {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        let (ws_tx, mut ws_rx) = ws.split();

        let connection_id = timeout(self.timeout, read_hello(&mut ws_rx))
            .await
            .map_err(|_| TransportError::Timeout("waiting for Hello".to_string()))??;
        info!(url = %self.url, connection_id = %connection_id, "Push transport connected");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_session(
            ws_tx,
            ws_rx,
            outbound_rx,
            sink,
            pending.clone(),
            cancel.clone(),
        ));

        self.session = Some(Session {
            outbound: outbound_tx,
            pending,
            cancel,
            task,
        });

        Ok(ConnectionHandle::new(TransportKind::Push, Some(connection_id)))
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            if let Err(e) = session.task.await {
                warn!(error = %e, "Push session task failed");
            }
            debug!(url = %self.url, "Push transport disconnected");
        }
    }

    async fn invoke(&self, command: Command) -> Result<Response, TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;

        let invocation_id = self.next_invocation.fetch_add(1, Ordering::Relaxed);
        let method = command.name();
        let frame = encode_client_message(&ClientMessage::Invoke(InvokeRequest {
            invocation_id,
            command,
        }))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        session.pending.lock().insert(invocation_id, reply_tx);

        if session.outbound.send(frame).await.is_err() {
            session.pending.lock().remove(&invocation_id);
            return Err(TransportError::Closed("session ended".to_string()));
        }

        match timeout(self.timeout, reply_rx).await {
            Ok(Ok(result)) => Ok(Response::from(result)),
            Ok(Err(_)) => Err(TransportError::Closed(format!(
                "connection closed before {} replied",
                method
            ))),
            Err(_) => {
                session.pending.lock().remove(&invocation_id);
                Err(TransportError::Timeout(format!("invocation {}", method)))
            }
        }
    }
}

impl Drop for PushTransport {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }
}

/// Wait for the hub's `Hello` and return the connection id.
async fn read_hello(ws_rx: &mut SplitStream<WsStream>) -> Result<String, TransportError> {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                return match decode_server_message(&text)? {
                    ServerMessage::Hello(hello) => Ok(hello.connection_id),
                    other => Err(TransportError::Malformed(format!(
                        "expected Hello, received {}",
                        other.event_name()
                    ))),
                };
            }
            Some(Ok(Message::Binary(_))) => return Err(CodecError::BinaryFrame.into()),
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Closed("closed before Hello".to_string()))
            }
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(_)) => {}
        }
    }
}

async fn run_session(
    mut ws_tx: SplitSink<WsStream, Message>,
    mut ws_rx: SplitStream<WsStream>,
    mut outbound_rx: mpsc::Receiver<String>,
    sink: EventSink,
    pending: Pending,
    cancel: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break None;
            }

            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = ws_tx.send(Message::Text(frame)).await {
                    break Some(e.to_string());
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(&text, &sink, &pending).await,
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            break Some(e.to_string());
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(error = %CodecError::BinaryFrame, "Ignoring hub frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break Some(frame.map_or_else(
                            || "hub closed the connection".to_string(),
                            |f| format!("hub closed the connection: {}", f.reason),
                        ));
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("stream ended".to_string()),
                    Some(Ok(_)) => {}
                }
            }
        }
    };

    // New invocations fail on send; waiting ones fail with "closed"
    // instead of timing out.
    drop(outbound_rx);
    pending.lock().clear();

    if let Some(reason) = reason {
        if !cancel.is_cancelled() {
            warn!(reason = %reason, "Push connection lost");
            let _ = sink.send(TransportEvent::Closed { reason }).await;
        }
    }
}

async fn dispatch(text: &str, sink: &EventSink, pending: &Pending) {
    let msg = match decode_server_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed hub frame");
            return;
        }
    };

    let events = match msg {
        ServerMessage::Hello(_) => {
            debug!("Ignoring repeated Hello");
            return;
        }
        ServerMessage::NewAirQualityData(payload) => {
            normalized(payload).into_iter().map(TransportEvent::NewData).collect()
        }
        ServerMessage::AirQualityUpdate(payload) => {
            normalized(payload).into_iter().map(TransportEvent::Update).collect()
        }
        ServerMessage::AirQualityAlert(alert) => vec![TransportEvent::Alert(alert)],
        ServerMessage::DeviceStatusChanged(status) => vec![TransportEvent::DeviceStatus(status)],
        ServerMessage::InvocationResult(result) => {
            match pending.lock().remove(&result.invocation_id) {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => debug!(
                    invocation_id = result.invocation_id,
                    "Dropping reply for unknown or expired invocation"
                ),
            }
            return;
        }
    };

    for event in events {
        if sink.send(event).await.is_err() {
            debug!("Event sink closed, dropping hub event");
            return;
        }
    }
}

fn normalized(payload: airwatch_protocol::ObservationPayload) -> Vec<airwatch_core::ObservationEvent> {
    let decoded = payload.into_events();
    for e in &decoded.rejected {
        warn!(error = %e, "Skipping invalid observation document");
    }
    decoded.events
}

#[cfg(test)]
mod tests {
    use super::*;
    use airwatch_core::{Location, ObservationEvent, Pollutant};
    use airwatch_protocol::{decode_client_message, encode_server_message, HelloMessage, ObservationPayload};
    use chrono::{TimeZone, Utc};
    use tokio::net::TcpListener;

    fn reading(station: &str) -> ObservationEvent {
        ObservationEvent::new(
            station,
            Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap(),
            Location::new(21.0, 105.8),
        )
        .with_metric(Pollutant::Pm25, 20.0)
    }

    /// Single-connection hub: sends `first`, echoes invocations with the
    /// station list, then closes when `close` fires.
    async fn spawn_hub(first: ServerMessage, close: oneshot::Receiver<()>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut tx, mut rx) = ws.split();
            tx.send(Message::Text(encode_server_message(&first).unwrap()))
                .await
                .unwrap();

            let mut close = close;
            loop {
                tokio::select! {
                    _ = &mut close => {
                        let _ = tx.send(Message::Close(None)).await;
                        break;
                    }
                    msg = rx.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let ClientMessage::Invoke(req) = decode_client_message(&text).unwrap();
                            let reply = InvocationResult::ok(
                                req.invocation_id,
                                Some(ObservationPayload::documents(&[reading("S9")])),
                            );
                            let frame = encode_server_message(&ServerMessage::InvocationResult(reply)).unwrap();
                            tx.send(Message::Text(frame)).await.unwrap();

                            let push = ServerMessage::NewAirQualityData(ObservationPayload::document(&reading("S1")));
                            tx.send(Message::Text(encode_server_message(&push).unwrap())).await.unwrap();
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    }
                }
            }
        });

        format!("ws://{}/hubs/airquality", addr)
    }

    #[tokio::test]
    async fn test_connect_invoke_and_receive() {
        let (close_tx, close_rx) = oneshot::channel();
        let url = spawn_hub(ServerMessage::Hello(HelloMessage::new("abc")), close_rx).await;

        let mut transport = PushTransport::new(&url, Duration::from_secs(5));
        let (sink, mut events) = mpsc::channel(16);
        let handle = transport.connect(sink).await.unwrap();
        assert_eq!(handle.kind, TransportKind::Push);
        assert_eq!(handle.connection_id.as_deref(), Some("abc"));
        assert!(transport.is_connected());

        let response = transport.invoke(Command::GetLatestAirQuality).await.unwrap();
        assert!(response.success);
        assert_eq!(response.observations[0].station_id, "S9");

        match events.recv().await {
            Some(TransportEvent::NewData(event)) => assert_eq!(event.station_id, "S1"),
            other => panic!("Expected NewData, got {:?}", other),
        }

        close_tx.send(()).unwrap();
        match events.recv().await {
            Some(TransportEvent::Closed { .. }) => {}
            other => panic!("Expected Closed, got {:?}", other),
        }

        assert!(matches!(
            transport.invoke(Command::GetAirQualityHistory).await,
            Err(TransportError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_hello_is_malformed() {
        let (_close_tx, close_rx) = oneshot::channel();
        let first = ServerMessage::NewAirQualityData(ObservationPayload::document(&reading("S1")));
        let url = spawn_hub(first, close_rx).await;

        let mut transport = PushTransport::new(&url, Duration::from_secs(5));
        let (sink, _events) = mpsc::channel(16);
        assert!(matches!(
            transport.connect(sink).await,
            Err(TransportError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_local_disconnect_emits_no_closed_event() {
        let (_close_tx, close_rx) = oneshot::channel();
        let url = spawn_hub(ServerMessage::Hello(HelloMessage::new("x")), close_rx).await;

        let mut transport = PushTransport::new(&url, Duration::from_secs(5));
        let (sink, mut events) = mpsc::channel(16);
        transport.connect(sink).await.unwrap();
        transport.disconnect().await;

        assert!(!transport.is_connected());
        assert_eq!(events.recv().await, None);
        assert!(matches!(
            transport.invoke(Command::GetLatestAirQuality).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_hub_fails_to_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport = PushTransport::new(&format!("ws://{}/hub", addr), Duration::from_secs(5));
        let (sink, _events) = mpsc::channel(16);
        assert!(matches!(
            transport.connect(sink).await,
            Err(TransportError::Connect { .. })
        ));
    }
}
