//! Mock REST API.
//!
//! - `GET /api/airquality/latest` → array of NGSI-LD documents, one per station
//! - `GET /api/airquality/history` → array of NGSI-LD documents, oldest first

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use airwatch_protocol::{ObservationPayload, HISTORY_PATH, LATEST_PATH};

use crate::feed::StationFeed;

/// Build the API router over a feed.
pub fn router(feed: StationFeed) -> Router {
    Router::new()
        .route(LATEST_PATH, get(latest_handler))
        .route(HISTORY_PATH, get(history_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(feed)
}

/// Serve the API on a bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, feed: StationFeed) -> std::io::Result<()> {
    info!("Mock REST API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(feed)).await
}

async fn latest_handler(State(feed): State<StationFeed>) -> Json<ObservationPayload> {
    Json(ObservationPayload::documents(&feed.latest()))
}

async fn history_handler(State(feed): State<StationFeed>) -> Json<ObservationPayload> {
    Json(ObservationPayload::documents(&feed.history()))
}
