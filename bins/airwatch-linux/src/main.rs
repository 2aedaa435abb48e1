//! `airwatch`: live air-quality monitor.
//!
//! Connects to the push hub (falling back to REST polling), preloads
//! history and logs readings, alerts and connection changes until Ctrl+C.

mod storage;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use airwatch_client::{BusEvent, Category, ConnectionManager};
use airwatch_mock::{DemoGenerator, MockBackend};

use storage::FileConfigStorage;

#[derive(Parser, Debug)]
#[command(name = "airwatch")]
#[command(about = "Live air-quality updates with push/poll fallback")]
struct Args {
    /// Settings file (JSON). Written with defaults when missing.
    #[arg(short, long, default_value = "airwatch.json")]
    config: PathBuf,

    /// Run the mock backend in-process and connect to it
    #[arg(long)]
    mock: bool,

    /// Mock push hub address (with --mock)
    #[arg(long, default_value = "127.0.0.1:3000", requires = "mock")]
    mock_hub: SocketAddr,

    /// Mock REST API address (with --mock)
    #[arg(long, default_value = "127.0.0.1:3001", requires = "mock")]
    mock_api: SocketAddr,

    /// Demo data period in seconds (with --mock)
    #[arg(long, default_value = "2")]
    demo_period: u64,

    /// Push hub URL, overrides the settings file and environment
    #[arg(long)]
    push_url: Option<String>,

    /// REST API base URL, overrides the settings file and environment
    #[arg(long)]
    api_url: Option<String>,

    /// Poll only, never try the push hub
    #[arg(long)]
    no_push: bool,

    /// Only receive pushes for this station (repeatable)
    #[arg(long = "station")]
    stations: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,airwatch_client=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let storage = FileConfigStorage::new(&args.config);
    let mut settings = storage
        .load_or_init()
        .with_context(|| format!("loading {}", storage.path().display()))?;
    for variable in storage::apply_env_overrides(&mut settings) {
        info!(variable, "Applied environment override");
    }
    if let Some(url) = args.push_url {
        settings.transport.push_url = url;
    }
    if let Some(url) = args.api_url {
        settings.transport.api_base_url = url;
    }
    if args.no_push {
        settings.transport.push_enabled = false;
    }

    let backend = if args.mock {
        let mut backend = MockBackend::start(args.mock_hub, args.mock_api)
            .await
            .context("starting mock backend")?;
        backend.spawn_generator(
            DemoGenerator::default(),
            Duration::from_secs(args.demo_period.max(1)),
        );
        settings.transport.push_url = backend.push_url();
        settings.transport.api_base_url = backend.api_url();
        Some(backend)
    } else {
        None
    };

    info!(
        push_url = %settings.transport.push_url,
        api_url = %settings.transport.api_base_url,
        push_enabled = settings.transport.push_enabled,
        "airwatch starting..."
    );

    let manager = ConnectionManager::new(settings)?;
    log_bus_events(&manager);

    if manager.initialize().await {
        info!("Receiving live pushes");
    } else {
        warn!("Push unavailable, polling");
    }

    let preloaded = manager.load_history().await;
    info!(preloaded, "History preloaded");

    for station in &args.stations {
        if !manager.join_location_group(station).await {
            warn!(station_id = %station, "Could not join location group");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    manager.disconnect().await;
    if let Some(backend) = backend {
        backend.shutdown().await;
    }

    info!("Shutdown complete");
    Ok(())
}

/// Log what a display surface would render.
fn log_bus_events(manager: &ConnectionManager) {
    manager.on(Category::Reconciled, |event| {
        if let BusEvent::Reconciled(update) = event {
            info!(
                station_id = %update.appended.station_id,
                observed_at = %update.appended.observed_at,
                aqi = ?update.appended.effective_aqi(),
                stations = update.snapshot.latest_by_station.len(),
                "Reading"
            );
        }
    });

    manager.on(Category::Alert, |event| {
        if let BusEvent::Alert(alert) = event {
            warn!(
                station_id = %alert.station_id,
                level = %alert.level,
                aqi = ?alert.aqi,
                "{}",
                alert.message
            );
        }
    });

    manager.on(Category::DeviceStatus, |event| {
        if let BusEvent::DeviceStatus(status) = event {
            info!(device_id = %status.device_id, status = %status.status, "Device status");
        }
    });

    manager.on(Category::StatusChanged, |event| {
        if let BusEvent::StatusChanged(status) = event {
            debug!(
                state = ?status.state,
                transport = ?status.transport,
                attempts = status.reconnect_attempts,
                waiting_for_data = status.waiting_for_data,
                "Status"
            );
        }
    });

    manager.on(Category::DataStale, |event| {
        if let BusEvent::DataStale { last_data_at } = event {
            warn!(last_data_at = ?last_data_at, "Waiting for data");
        }
    });
}
