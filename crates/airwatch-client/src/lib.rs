//! # airwatch-client
//!
//! Real-time air-quality client built on tokio.
//!
//! - [`transport`]: WebSocket push and HTTP polling adapters
//! - [`manager`]: connection lifecycle, reconnect backoff, polling fallback
//!   and push probes
//! - [`pipeline`]: reconciliation, alerting and bus fan-out of incoming data
//!
//! ```no_run
//! use airwatch_client::{Category, ConnectionManager, Settings};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConnectionManager::new(Settings::default())?;
//! manager.on(Category::Alert, |event| println!("{:?}", event));
//! let pushed = manager.initialize().await;
//! println!("push connected: {}", pushed);
//! manager.load_history().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod manager;
pub mod pipeline;
pub mod transport;

pub use airwatch_core::{
    Alert, AlertLevel, BusEvent, Category, ConnectionState, ConnectionStatus, EventBus,
    ObservationEvent, ReconciledSnapshot, Settings, Subscription, SubscriptionBus, TransportKind,
};
pub use airwatch_protocol::Command;

pub use backoff::Backoff;
pub use manager::ConnectionManager;
pub use pipeline::{IngestPipeline, Origin, PipelineViews};
pub use transport::{
    ActiveTransport, ApiClient, ConnectionHandle, EventSink, HttpTransportFactory, PollTransport,
    PushTransport, Response, TransportAdapter, TransportError, TransportEvent, TransportFactory,
};
