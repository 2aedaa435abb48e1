//! Alert evaluation.
//!
//! Derives threshold-crossing alerts from reconciled readings using the AQI
//! bands in [`AlertLevel::from_aqi`]. The evaluator emits at most one alert
//! per reading and keeps no memory between calls; capping the displayed list
//! is the job of [`RecentAlerts`].

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::AlertSettings;
use crate::model::{Alert, AlertLevel, ObservationEvent};

/// Default number of alerts kept for display.
pub const DEFAULT_RECENT_ALERTS: usize = 5;

/// Malformed metric data reaching the evaluator. Never fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("station {station_id} has no AQI and no particulate readings")]
    MissingAqi { station_id: String },

    #[error("station {station_id} reported an invalid AQI ({value})")]
    InvalidAqi { station_id: String, value: f64 },
}

/// Turns readings into alerts.
#[derive(Debug, Clone, Default)]
pub struct AlertEvaluator {
    settings: AlertSettings,
}

impl AlertEvaluator {
    pub fn new(settings: AlertSettings) -> Self {
        Self { settings }
    }

    /// Evaluate a reading; malformed data counts as "no alert".
    pub fn evaluate(&self, latest: &ObservationEvent) -> Option<Alert> {
        self.try_evaluate(latest).ok().flatten()
    }

    /// Evaluate a reading, reporting why it could not be classified.
    pub fn try_evaluate(&self, latest: &ObservationEvent) -> Result<Option<Alert>, EvaluationError> {
        let aqi = latest
            .effective_aqi()
            .ok_or_else(|| EvaluationError::MissingAqi {
                station_id: latest.station_id.clone(),
            })?;

        if !aqi.is_finite() || aqi < 0.0 {
            return Err(EvaluationError::InvalidAqi {
                station_id: latest.station_id.clone(),
                value: aqi,
            });
        }

        let level = AlertLevel::from_aqi(aqi);
        if !self.should_alert(level) {
            return Ok(None);
        }

        Ok(Some(Alert {
            station_id: latest.station_id.clone(),
            level,
            aqi: Some(aqi),
            message: format!(
                "Air quality at {} is {} (AQI {:.0})",
                latest.station_id, level, aqi
            ),
            triggered_at: latest.observed_at,
        }))
    }

    fn should_alert(&self, level: AlertLevel) -> bool {
        match level {
            AlertLevel::Normal => false,
            AlertLevel::Moderate => self.settings.alert_on_moderate,
            _ => true,
        }
    }
}

/// Newest-first list of the last N alerts.
#[derive(Debug, Clone)]
pub struct RecentAlerts {
    capacity: usize,
    alerts: VecDeque<Alert>,
}

impl RecentAlerts {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            alerts: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, alert: Alert) {
        self.alerts.push_front(alert);
        self.alerts.truncate(self.capacity);
    }

    /// Alerts, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter()
    }

    /// An alert for this station and reading time is already kept.
    pub fn contains(&self, station_id: &str, triggered_at: DateTime<Utc>) -> bool {
        self.alerts
            .iter()
            .any(|alert| alert.station_id == station_id && alert.triggered_at == triggered_at)
    }

    pub fn to_vec(&self) -> Vec<Alert> {
        self.alerts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

impl Default for RecentAlerts {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_ALERTS)
    }
}
