//! # airwatch-mock
//!
//! In-process stand-in for the air-quality backend: a WebSocket push hub and
//! the REST API, both served from one [`StationFeed`]. Used by the client's
//! integration tests and by `airwatch --mock`.

pub mod api;
pub mod feed;
pub mod generator;
pub mod groups;
pub mod hub;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use airwatch_protocol::HUB_PATH;

pub use feed::StationFeed;
pub use generator::{demo_stations, DemoGenerator, DemoStation};
pub use groups::LocationGroups;
pub use hub::{HubConfig, HubEvent, PushHub};

/// A running mock backend.
pub struct MockBackend {
    hub_addr: SocketAddr,
    api_addr: SocketAddr,
    feed: StationFeed,
    events: mpsc::Sender<HubEvent>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MockBackend {
    /// Bind the hub and the API (port 0 picks a free port) and serve both.
    pub async fn start(hub_addr: SocketAddr, api_addr: SocketAddr) -> std::io::Result<Self> {
        let hub_listener = TcpListener::bind(hub_addr).await?;
        let api_listener = TcpListener::bind(api_addr).await?;
        let hub_addr = hub_listener.local_addr()?;
        let api_addr = api_listener.local_addr()?;

        let feed = StationFeed::default();
        let hub = PushHub::new(HubConfig { bind_addr: hub_addr }, feed.clone());
        let events = hub.event_sender();
        let cancel = hub.shutdown_token();

        let hub_task = tokio::spawn(async move {
            if let Err(e) = hub.serve(hub_listener).await {
                error!("Mock push hub error: {}", e);
            }
        });

        let api_feed = feed.clone();
        let api_cancel = cancel.clone();
        let api_task = tokio::spawn(async move {
            tokio::select! {
                _ = api_cancel.cancelled() => {}
                result = api::serve(api_listener, api_feed) => {
                    if let Err(e) = result {
                        error!("Mock REST API error: {}", e);
                    }
                }
            }
        });

        info!(push_url = %format!("ws://{}{}", hub_addr, HUB_PATH), api_url = %format!("http://{}", api_addr), "Mock backend ready");

        Ok(Self {
            hub_addr,
            api_addr,
            feed,
            events,
            cancel,
            tasks: vec![hub_task, api_task],
        })
    }

    /// Start on `127.0.0.1` with ephemeral ports.
    pub async fn start_local() -> std::io::Result<Self> {
        let any = SocketAddr::from(([127, 0, 0, 1], 0));
        Self::start(any, any).await
    }

    pub fn push_url(&self) -> String {
        format!("ws://{}{}", self.hub_addr, HUB_PATH)
    }

    pub fn api_url(&self) -> String {
        format!("http://{}", self.api_addr)
    }

    pub fn feed(&self) -> &StationFeed {
        &self.feed
    }

    pub fn event_sender(&self) -> mpsc::Sender<HubEvent> {
        self.events.clone()
    }

    /// Push an event to every matching connection; it is also recorded in
    /// the feed.
    pub async fn publish(&self, event: HubEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Run a demo generator until shutdown.
    pub fn spawn_generator(&mut self, generator: DemoGenerator, period: Duration) {
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        self.tasks
            .push(tokio::spawn(generator.run(events, period, cancel)));
    }

    /// Close every connection and stop serving.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Mock backend stopped");
    }
}
