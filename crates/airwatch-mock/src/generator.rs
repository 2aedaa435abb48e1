//! Demo data generator: a few stations with drifting particulate levels.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use airwatch_core::{Alert, AlertLevel, DeviceStatus, Location, ObservationEvent, Pollutant};

use crate::hub::HubEvent;

/// AQI above which the generator raises a backend alert.
const ALERT_AQI: f64 = 150.0;

/// Device status flips every this many ticks.
const DEVICE_STATUS_EVERY: u64 = 10;

#[derive(Debug, Clone)]
pub struct DemoStation {
    pub id: String,
    pub location: Location,
    /// Mean PM2.5 in µg/m³.
    pub baseline_pm25: f64,
}

impl DemoStation {
    pub fn new(id: &str, latitude: f64, longitude: f64, baseline_pm25: f64) -> Self {
        Self {
            id: id.to_string(),
            location: Location::new(latitude, longitude),
            baseline_pm25,
        }
    }
}

/// Stations around Hanoi with different pollution profiles.
pub fn demo_stations() -> Vec<DemoStation> {
    vec![
        DemoStation::new("hanoi-hoan-kiem", 21.0285, 105.8542, 35.0),
        DemoStation::new("hanoi-cau-giay", 21.0362, 105.7906, 55.0),
        DemoStation::new("hanoi-long-bien", 21.0466, 105.8880, 80.0),
    ]
}

pub struct DemoGenerator {
    stations: Vec<DemoStation>,
    tick: u64,
}

impl DemoGenerator {
    pub fn new(stations: Vec<DemoStation>) -> Self {
        Self { stations, tick: 0 }
    }

    pub fn stations(&self) -> &[DemoStation] {
        &self.stations
    }

    /// Readings for one tick, plus alerts and device status changes.
    pub fn next_batch(&mut self, now: DateTime<Utc>) -> Vec<HubEvent> {
        self.tick += 1;
        let mut events = Vec::with_capacity(self.stations.len() + 1);

        for (i, station) in self.stations.iter().enumerate() {
            let phase = self.tick as f64 / 6.0 + i as f64 * 2.1;
            let pm25 = round1((station.baseline_pm25 * (1.0 + 0.9 * phase.sin())).max(0.0));
            let pm10 = round1(pm25 * 1.6);

            let reading = ObservationEvent::new(&station.id, now, station.location)
                .with_metric(Pollutant::Pm25, pm25)
                .with_metric(Pollutant::Pm10, pm10);

            if let Some(aqi) = reading.effective_aqi().filter(|aqi| *aqi > ALERT_AQI) {
                let level = AlertLevel::from_aqi(aqi);
                events.push(HubEvent::NewData(reading));
                events.push(HubEvent::Alert(Alert {
                    station_id: station.id.clone(),
                    level,
                    aqi: Some(aqi),
                    message: format!("Air quality is {} at {}", level, station.id),
                    triggered_at: now,
                }));
            } else {
                events.push(HubEvent::NewData(reading));
            }
        }

        if self.tick % DEVICE_STATUS_EVERY == 0 {
            if let Some(station) = self.stations.first() {
                let online = (self.tick / DEVICE_STATUS_EVERY) % 2 == 0;
                events.push(HubEvent::DeviceStatus(DeviceStatus {
                    device_id: format!("{}-sensor", station.id),
                    status: if online { "online" } else { "offline" }.to_string(),
                    timestamp: Some(now),
                }));
            }
        }

        events
    }

    /// Push a batch every `period` until cancelled or the hub goes away.
    pub async fn run(
        mut self,
        events: mpsc::Sender<HubEvent>,
        period: Duration,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let batch = self.next_batch(Utc::now());
            debug!(tick = self.tick, events = batch.len(), "Demo batch");
            for event in batch {
                if events.send(event).await.is_err() {
                    error!("Failed to send demo event - hub may have stopped");
                    return;
                }
            }
        }
    }
}

impl Default for DemoGenerator {
    fn default() -> Self {
        Self::new(demo_stations())
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
