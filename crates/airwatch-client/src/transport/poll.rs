//! HTTP polling transport.
//!
//! Used while the push channel is unavailable. A ticker task fetches the
//! latest observations every poll interval and forwards them as `NewData`;
//! duplicates of already-seen readings are absorbed by the reconciler.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use airwatch_core::{ObservationEvent, TransportKind};
use airwatch_protocol::{decode_observations, Command, HISTORY_PATH, LATEST_PATH};

use super::{ConnectionHandle, EventSink, Response, TransportAdapter, TransportError, TransportEvent};

/// REST API client shared by polling and one-shot requests.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn latest(&self) -> Result<Vec<ObservationEvent>, TransportError> {
        self.fetch(LATEST_PATH).await
    }

    pub async fn history(&self) -> Result<Vec<ObservationEvent>, TransportError> {
        self.fetch(HISTORY_PATH).await
    }

    async fn fetch(&self, path: &str) -> Result<Vec<ObservationEvent>, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        let body = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let decoded = decode_observations(&body)?;
        for e in &decoded.rejected {
            warn!(url = %url, error = %e, "Skipping invalid observation document");
        }

        debug!(url = %url, count = decoded.events.len(), "Fetched observations");
        Ok(decoded.events)
    }
}

struct Ticker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Poll adapter over the REST API.
pub struct PollTransport {
    api: ApiClient,
    interval: Duration,
    ticker: Option<Ticker>,
}

impl PollTransport {
    pub fn new(api: ApiClient, interval: Duration) -> Self {
        Self {
            api,
            interval,
            ticker: None,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.ticker
            .as_ref()
            .is_some_and(|ticker| !ticker.task.is_finished())
    }
}

#[async_trait]
impl TransportAdapter for PollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    async fn connect(&mut self, sink: EventSink) -> Result<ConnectionHandle, TransportError> {
        self.disconnect().await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_ticker(
            self.api.clone(),
            self.interval,
            sink,
            cancel.clone(),
        ));
        self.ticker = Some(Ticker { cancel, task });

        info!(
            base_url = %self.api.base_url(),
            interval_ms = self.interval.as_millis() as u64,
            "Polling started"
        );
        Ok(ConnectionHandle::new(TransportKind::Poll, None))
    }

    async fn disconnect(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.cancel.cancel();
            if let Err(e) = ticker.task.await {
                warn!(error = %e, "Poll ticker task failed");
            }
            info!("Polling stopped");
        }
    }

    async fn invoke(&self, command: Command) -> Result<Response, TransportError> {
        match command {
            Command::GetLatestAirQuality => Ok(Response::with_observations(self.api.latest().await?)),
            Command::GetAirQualityHistory => {
                Ok(Response::with_observations(self.api.history().await?))
            }
            Command::JoinLocationGroup(_) | Command::LeaveLocationGroup(_) => {
                Ok(Response::acknowledged(format!(
                    "{} has no effect while polling",
                    command.name()
                )))
            }
        }
    }
}

impl Drop for PollTransport {
    fn drop(&mut self) {
        if let Some(ticker) = &self.ticker {
            ticker.cancel.cancel();
        }
    }
}

async fn run_ticker(api: ApiClient, period: Duration, sink: EventSink, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            fetched = api.latest() => fetched,
        };

        match fetched {
            Ok(events) => {
                for event in events {
                    if sink.send(TransportEvent::NewData(event)).await.is_err() {
                        debug!("Event sink closed, stopping poll ticker");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Poll failed, retrying next tick");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airwatch_core::{Location, Pollutant};
    use airwatch_protocol::ObservationPayload;
    use axum::routing::get;
    use axum::{Json, Router};
    use chrono::{TimeZone, Utc};
    use tokio::sync::mpsc;

    fn reading(station: &str, hour: u32) -> ObservationEvent {
        ObservationEvent::new(
            station,
            Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap(),
            Location::new(21.0, 105.8),
        )
        .with_metric(Pollutant::Pm10, 40.0)
    }

    async fn spawn_api() -> String {
        let app = Router::new()
            .route(
                LATEST_PATH,
                get(|| async { Json(ObservationPayload::documents(&[reading("S1", 9), reading("S2", 9)])) }),
            )
            .route(
                HISTORY_PATH,
                get(|| async { Json(ObservationPayload::documents(&[reading("S1", 8), reading("S1", 9)])) }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_ticker_delivers_latest() {
        let base = spawn_api().await;
        let api = ApiClient::new(&base, Duration::from_secs(5)).unwrap();
        let mut transport = PollTransport::new(api, Duration::from_millis(50));

        let (sink, mut events) = mpsc::channel(16);
        let handle = transport.connect(sink).await.unwrap();
        assert_eq!(handle.kind, TransportKind::Poll);
        assert!(transport.is_polling());

        let mut stations = Vec::new();
        for _ in 0..2 {
            match events.recv().await {
                Some(TransportEvent::NewData(event)) => stations.push(event.station_id),
                other => panic!("Expected NewData, got {:?}", other),
            }
        }
        assert_eq!(stations, vec!["S1", "S2"]);

        transport.disconnect().await;
        assert!(!transport.is_polling());
    }

    #[tokio::test]
    async fn test_invoke_answers_from_rest() {
        let base = spawn_api().await;
        let api = ApiClient::new(&base, Duration::from_secs(5)).unwrap();
        assert!(!api.base_url().ends_with('/'));
        let transport = PollTransport::new(api, Duration::from_secs(60));

        let history = transport.invoke(Command::GetAirQualityHistory).await.unwrap();
        let hours: Vec<_> = history.observations.iter().map(|e| e.observed_at).collect();
        assert_eq!(hours.len(), 2);
        assert!(hours[0] < hours[1]);

        let join = transport
            .invoke(Command::JoinLocationGroup("S1".to_string()))
            .await
            .unwrap();
        assert!(join.success);
        assert!(join.observations.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_api_is_an_http_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = ApiClient::new(&format!("http://{}", addr), Duration::from_secs(5)).unwrap();
        assert!(matches!(api.latest().await, Err(TransportError::Http(_))));
    }
}
